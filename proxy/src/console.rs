//! Operator commands read from standard input

use crate::network::ProxyContext;
use crate::session::SessionEvent;
use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    List,
    Transfer { player: String, server: String },
    Kick { player: String, reason: String },
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        let command = match name.to_lowercase().as_str() {
            "." | "stop" | "end" => Command::Stop,
            "list" => Command::List,
            "transfer" => match (words.next(), words.next()) {
                (Some(player), Some(server)) => Command::Transfer {
                    player: player.to_string(),
                    server: server.to_string(),
                },
                _ => Command::Unknown(line.trim().to_string()),
            },
            "kick" => match words.next() {
                Some(player) => {
                    let reason = words.collect::<Vec<_>>().join(" ");
                    Command::Kick {
                        player: player.to_string(),
                        reason: if reason.is_empty() {
                            "Kicked".to_string()
                        } else {
                            reason
                        },
                    }
                }
                None => Command::Unknown(line.trim().to_string()),
            },
            _ => Command::Unknown(line.trim().to_string()),
        };
        Some(command)
    }
}

/// Runs a non-stop command and returns the text to show the operator
pub async fn execute(ctx: &ProxyContext, command: Command) -> String {
    match command {
        Command::Stop => "Stopping".to_string(),
        Command::List => {
            let names = ctx.registry.usernames().await;
            format!("{} players online: {}", names.len(), names.join(", "))
        }
        Command::Transfer { player, server } => {
            let Some(target) = ctx.config.server(&server) else {
                return format!("Unknown server {}", server);
            };
            let Some(session) = ctx.registry.get_by_username(&player).await else {
                return format!("{} is not online", player);
            };
            if !session.notify(SessionEvent::Transfer(target.clone())) {
                return format!("{} is disconnecting", player);
            }
            info!("Requested transfer of {} to {}", player, target.name);
            format!("Transferring {} to {}", player, target.name)
        }
        Command::Kick { player, reason } => match ctx.registry.get_by_username(&player).await {
            Some(session) if session.notify(SessionEvent::Kick(reason)) => {
                format!("Kicked {}", player)
            }
            _ => format!("{} is not online", player),
        },
        Command::Unknown(line) => {
            format!("Unknown command {:?}. Try: list, transfer <player> <server>, kick <player> [reason], stop", line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendServer, ProxyConfig};
    use crate::registry::{ConnectionRegistry, SessionHandle};
    use std::sync::Arc;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("."), Some(Command::Stop));
        assert_eq!(Command::parse("  STOP "), Some(Command::Stop));
        assert_eq!(Command::parse("list"), Some(Command::List));
        assert_eq!(
            Command::parse("transfer Steve survival"),
            Some(Command::Transfer {
                player: "Steve".to_string(),
                server: "survival".to_string()
            })
        );
        assert_eq!(
            Command::parse("kick Steve too many creepers"),
            Some(Command::Kick {
                player: "Steve".to_string(),
                reason: "too many creepers".to_string()
            })
        );
        assert_eq!(
            Command::parse("transfer Steve"),
            Some(Command::Unknown("transfer Steve".to_string()))
        );
        assert_eq!(Command::parse("   "), None);
    }

    #[tokio::test]
    async fn test_transfer_reaches_session() {
        let survival = BackendServer::new("survival", "127.0.0.1:19135".parse().unwrap());
        let mut config = ProxyConfig::default();
        config.servers.push(survival.clone());
        let ctx = ProxyContext {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            registry: ConnectionRegistry::new(),
            config: Arc::new(config),
            guid: 1,
        };

        let (inbound, _inbound_rx) = mpsc::channel(1);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(
            ctx.registry.allocate_id(),
            "127.0.0.1:40000".parse().unwrap(),
            inbound,
            events,
            CancellationToken::new(),
        );
        ctx.registry.register(handle.clone()).await;
        ctx.registry.register_name("Steve", &handle).await;

        let reply = execute(&ctx, Command::parse("transfer steve Survival").unwrap()).await;
        assert_eq!(reply, "Transferring steve to survival");
        match events_rx.recv().await.unwrap() {
            SessionEvent::Transfer(server) => assert_eq!(server, survival),
            other => panic!("unexpected event {:?}", other),
        }

        let reply = execute(&ctx, Command::parse("transfer alex survival").unwrap()).await;
        assert_eq!(reply, "alex is not online");
        let reply = execute(&ctx, Command::parse("transfer steve creative").unwrap()).await;
        assert_eq!(reply, "Unknown server creative");

        let reply = execute(&ctx, Command::List).await;
        assert_eq!(reply, "1 players online: steve");
    }
}
