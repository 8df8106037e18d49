//! Handling of packets from endpoints that have no session yet
//!
//! A fixed pool of workers drains one shared queue. Each worker answers
//! server-list pings and the two open-connection requests; the second of
//! those creates, registers and spawns the client's session.

use crate::network::ProxyContext;
use crate::session::ClientSession;
use crate::utils::fork_rng;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use protocol::raknet::{
    OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2,
    UnconnectedPing, UnconnectedPong,
};
use protocol::{
    clamp_mtu, Packet, ID_OPEN_CONNECTION_REQUEST_1, ID_OPEN_CONNECTION_REQUEST_2,
    ID_UNCONNECTED_PING, ID_UNCONNECTED_PING_OPEN_CONNECTIONS, RAKNET_PROTOCOL_VERSION,
    UDP_HEADER_OVERHEAD,
};
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct UnannouncedPacket {
    pub data: Bytes,
    pub source: SocketAddr,
}

pub struct UnannouncedConnectionHandler {
    ctx: Arc<ProxyContext>,
}

impl UnannouncedConnectionHandler {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Starts `workers` tasks sharing `queue`, each with its own generator.
    pub fn spawn_workers(
        self: &Arc<Self>,
        queue: mpsc::Receiver<UnannouncedPacket>,
        workers: usize,
        rng: &mut StdRng,
    ) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));
        (0..workers.max(1))
            .map(|_| {
                let handler = Arc::clone(self);
                let queue = Arc::clone(&queue);
                let rng = fork_rng(rng);
                tokio::spawn(handler.run_worker(queue, rng))
            })
            .collect()
    }

    async fn run_worker(
        self: Arc<Self>,
        queue: Arc<Mutex<mpsc::Receiver<UnannouncedPacket>>>,
        mut rng: StdRng,
    ) {
        loop {
            let next = queue.lock().await.recv().await;
            match next {
                Some(packet) => self.handle(packet, &mut rng).await,
                None => break,
            }
        }
    }

    pub async fn handle(&self, packet: UnannouncedPacket, rng: &mut StdRng) {
        let Some(&id) = packet.data.first() else {
            return;
        };
        match id {
            ID_UNCONNECTED_PING | ID_UNCONNECTED_PING_OPEN_CONNECTIONS => {
                self.reply_ping(&packet).await
            }
            ID_OPEN_CONNECTION_REQUEST_1 => self.reply_open_request(&packet).await,
            ID_OPEN_CONNECTION_REQUEST_2 => self.accept_open_request(&packet, rng).await,
            _ => trace!("Ignoring packet {:#04x} from unknown {}", id, packet.source),
        }
    }

    async fn send(&self, data: &[u8], target: SocketAddr) {
        if let Err(e) = self.ctx.socket.send_to(data, target).await {
            error!("Failed to send to {}: {}", target, e);
        }
    }

    async fn reply_ping(&self, packet: &UnannouncedPacket) {
        let ping = match UnconnectedPing::parse(&packet.data) {
            Ok(ping) => ping,
            Err(e) => {
                debug!("Malformed ping from {}: {}", packet.source, e);
                return;
            }
        };
        let players = self.ctx.registry.player_count().await;
        let pong = UnconnectedPong {
            ping_id: ping.ping_id,
            server_guid: self.ctx.guid,
            name: self.ctx.config.pong_name(players),
        };
        self.send(&pong.encode(), packet.source).await;
    }

    async fn reply_open_request(&self, packet: &UnannouncedPacket) {
        let request = match OpenConnectionRequest1::decode(&packet.data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed open connection request from {}: {}", packet.source, e);
                return;
            }
        };
        if request.protocol != RAKNET_PROTOCOL_VERSION {
            debug!(
                "{} speaks RakNet protocol {}, expected {}",
                packet.source, request.protocol, RAKNET_PROTOCOL_VERSION
            );
        }
        // the request is padded to the client's MTU minus the IP/UDP headers;
        // 28 is the exact IPv4 + UDP size, not the looser +32 some servers add
        let mtu = clamp_mtu((packet.data.len() as u16).saturating_add(UDP_HEADER_OVERHEAD));
        let reply = OpenConnectionReply1 {
            server_guid: self.ctx.guid,
            secure: false,
            mtu,
        };
        self.send(&reply.encode(), packet.source).await;
    }

    async fn accept_open_request(&self, packet: &UnannouncedPacket, rng: &mut StdRng) {
        let request = match OpenConnectionRequest2::decode(&packet.data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed open connection request 2 from {}: {}", packet.source, e);
                return;
            }
        };
        let mtu = clamp_mtu(request.mtu);
        let (session, handle) =
            ClientSession::new(Arc::clone(&self.ctx), packet.source, mtu, fork_rng(rng));
        if !self.ctx.registry.register(handle.clone()).await {
            warn!("{} already has a session, ignoring request", packet.source);
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(session.run());
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Session {} for {} panicked", handle.id(), handle.endpoint());
                    ctx.registry.remove_session(handle.id()).await;
                }
            }
        });

        let reply = OpenConnectionReply2 {
            server_guid: self.ctx.guid,
            client_address: packet.source,
            mtu,
        };
        self.send(&reply.encode(), packet.source).await;
    }
}
