//! Proxy network layer: the public UDP socket and packet routing

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::registry::ConnectionRegistry;
use crate::session::SessionEvent;
use crate::unannounced::{UnannouncedConnectionHandler, UnannouncedPacket};
use bytes::Bytes;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const RECEIVE_BUFFER_SIZE: usize = 2048;
/// Longest the receive loop waits on one session's full queue
const DELIVERY_TIMEOUT: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// State shared by every task of a running proxy
#[derive(Debug)]
pub struct ProxyContext {
    pub socket: UdpSocket,
    pub registry: ConnectionRegistry,
    pub config: Arc<ProxyConfig>,
    /// Identity advertised to clients in pongs and open-connection replies
    pub guid: i64,
}

/// Asks every session to disconnect its client with `reason`
pub async fn disconnect_all(ctx: &ProxyContext, reason: &str) -> usize {
    let sessions = ctx.registry.sessions().await;
    let mut notified = 0;
    for session in sessions {
        if session.notify(SessionEvent::Kick(reason.to_string())) {
            notified += 1;
        } else {
            ctx.registry.remove_session(session.id()).await;
        }
    }
    notified
}

/// Receive loop of the proxy
///
/// Packets from endpoints with a session go to that session's queue; all
/// others go to the shared unannounced queue served by the worker pool.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    rng: StdRng,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub async fn bind(config: ProxyConfig, mut rng: StdRng) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("Proxy listening on {}", socket.local_addr()?);

        let ctx = ProxyContext {
            socket,
            registry: ConnectionRegistry::new(),
            config: Arc::new(config),
            guid: rng.gen(),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            rng,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ctx.socket.local_addr()?)
    }

    pub fn context(&self) -> Arc<ProxyContext> {
        Arc::clone(&self.ctx)
    }

    /// Token that stops [`ProxyServer::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let (unannounced_tx, unannounced_rx) =
            mpsc::channel(self.ctx.config.unannounced_queue_capacity);
        let handler = Arc::new(UnannouncedConnectionHandler::new(Arc::clone(&self.ctx)));
        let workers = handler.spawn_workers(unannounced_rx, self.ctx.config.workers, &mut self.rng);
        info!("Proxy started with {} workers", workers.len());

        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.ctx.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        let packet = Bytes::copy_from_slice(&buffer[..len]);
                        self.route(packet, source, &unannounced_tx).await;
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        drop(unannounced_tx);
        for worker in workers {
            worker.abort();
        }
        self.close().await;
        Ok(())
    }

    async fn route(
        &self,
        packet: Bytes,
        source: SocketAddr,
        unannounced: &mpsc::Sender<UnannouncedPacket>,
    ) {
        if let Some(session) = self.ctx.registry.get_by_endpoint(source).await {
            match timeout(DELIVERY_TIMEOUT, session.deliver(packet)).await {
                Ok(true) => {}
                Ok(false) => debug!("Session for {} is gone, dropping packet", source),
                Err(_) => warn!("Session queue for {} is full, dropping packet", source),
            }
            return;
        }

        let packet = UnannouncedPacket {
            data: packet,
            source,
        };
        if unannounced.send(packet).await.is_err() {
            error!("Unannounced queue closed");
        }
    }

    /// Disconnects every client and waits briefly for sessions to finish.
    async fn close(&self) {
        let notified = disconnect_all(&self.ctx, "Proxy closed").await;
        info!("Shutting down, disconnecting {} sessions", notified);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.ctx.registry.session_count().await > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        info!("Proxy stopped");
    }
}
