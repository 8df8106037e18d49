//! Runtime settings for the proxy.
//!
//! Defaults reproduce a single-backend setup on the standard MCPE port; the
//! backend list can also be read from a JSON file:
//!
//! ```json
//! [
//!   { "name": "lobby", "address": "127.0.0.1:19134" },
//!   { "name": "survival", "address": "10.0.0.5:19132" }
//! ]
//! ```

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendServer {
    pub name: String,
    pub address: SocketAddr,
}

impl BackendServer {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub servers: Vec<BackendServer>,
    /// Server new players join first
    pub default_server: String,
    pub motd: String,
    pub protocol_version: u32,
    pub game_version: String,
    pub max_players: u32,
    pub workers: usize,
    pub session_queue_capacity: usize,
    pub unannounced_queue_capacity: usize,
    pub session_tick: Duration,
    pub session_timeout: Duration,
    pub connector_tick: Duration,
    pub keepalive_interval: Duration,
    pub backend_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19132)),
            servers: vec![BackendServer::new(
                "lobby",
                SocketAddr::from(([127, 0, 0, 1], 19134)),
            )],
            default_server: "lobby".to_string(),
            motd: "Test".to_string(),
            protocol_version: 38,
            game_version: "0.13.0".to_string(),
            max_players: 25000,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            session_queue_capacity: 300,
            unannounced_queue_capacity: 20000,
            session_tick: Duration::from_millis(50),
            session_timeout: Duration::from_secs(10),
            connector_tick: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(5),
            backend_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    pub fn load_servers(path: impl AsRef<Path>) -> Result<Vec<BackendServer>> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse_servers(&raw)
    }

    pub fn parse_servers(raw: &str) -> Result<Vec<BackendServer>> {
        let servers: Vec<BackendServer> =
            serde_json::from_str(raw).map_err(|e| ProxyError::Config(e.to_string()))?;
        if servers.is_empty() {
            return Err(ProxyError::Config("server list is empty".to_string()));
        }
        Ok(servers)
    }

    pub fn server(&self, name: &str) -> Option<&BackendServer> {
        self.servers.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn default_backend(&self) -> Result<&BackendServer> {
        self.server(&self.default_server)
            .ok_or_else(|| ProxyError::NoBackend(self.default_server.clone()))
    }

    /// Checks that the default server exists and the worker pool is non-empty.
    pub fn validate(&self) -> Result<()> {
        self.default_backend()?;
        if self.workers == 0 {
            return Err(ProxyError::Config("at least one worker is required".to_string()));
        }
        Ok(())
    }

    /// Server list entry advertised in unconnected pongs.
    pub fn pong_name(&self, players: usize) -> String {
        format!(
            "MCPE;{};{};{};{};{}",
            self.motd, self.protocol_version, self.game_version, players, self.max_players
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr.port(), 19132);
        assert_eq!(config.default_backend().unwrap().name, "lobby");
        assert_eq!(config.session_queue_capacity, 300);
        assert_eq!(config.unannounced_queue_capacity, 20000);
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pong_name() {
        let config = ProxyConfig::default();
        assert_eq!(config.pong_name(3), "MCPE;Test;38;0.13.0;3;25000");
    }

    #[test]
    fn test_parse_servers() {
        let raw = r#"[
            {"name": "lobby", "address": "127.0.0.1:19134"},
            {"name": "Survival", "address": "10.0.0.5:19132"}
        ]"#;
        let servers = ProxyConfig::parse_servers(raw).unwrap();
        assert_eq!(servers.len(), 2);

        let config = ProxyConfig {
            servers,
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.server("survival").unwrap().address,
            "10.0.0.5:19132".parse().unwrap()
        );
        assert!(config.server("creative").is_none());
    }

    #[test]
    fn test_parse_servers_rejects_bad_input() {
        assert!(ProxyConfig::parse_servers("[]").is_err());
        assert!(ProxyConfig::parse_servers("{not json").is_err());
        assert!(ProxyConfig::parse_servers(r#"[{"name": "x", "address": "nope"}]"#).is_err());
    }

    #[test]
    fn test_missing_default_server() {
        let config = ProxyConfig {
            default_server: "hub".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::NoBackend(_))));
    }
}
