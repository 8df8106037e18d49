//! Outbound RakNet client that carries one player to one backend server
//!
//! The connector owns its own UDP socket, connected to the backend, and runs
//! as a separate task. It performs the client side of the RakNet handshake,
//! replays the player's login and then relays application payloads between
//! the backend and the owning session. It reports back only through the
//! session's event queue and never touches session state directly.

use crate::config::{BackendServer, ProxyConfig};
use crate::error::Result;
use crate::registry::SessionId;
use crate::session::SessionEvent;
use crate::utils::get_timestamp;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use protocol::mcpe::{self, Batch, Disconnect, StartGame};
use protocol::raknet::{
    ConnectedPing, ConnectedPong, ConnectionRequest, DisconnectNotification,
    NewIncomingConnection, OpenConnectionReply1, OpenConnectionRequest1, OpenConnectionRequest2,
};
use protocol::{
    clamp_mtu, is_datagram, AckKind, AckPacket, Packet, ReliableLink, RetransmitPlan, ID_ACK,
    ID_CONNECTED_PING, ID_CONNECTED_PONG, ID_CONNECTION_BANNED, ID_CONNECTION_REQUEST_ACCEPTED,
    ID_DISCONNECT_NOTIFICATION, ID_NAK, ID_NO_FREE_INCOMING_CONNECTIONS,
    ID_OPEN_CONNECTION_REPLY_1, ID_OPEN_CONNECTION_REPLY_2, RAKNET_PROTOCOL_VERSION,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type ConnectorId = u64;

const RECEIVE_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Unconnected,
    Identify,
    Connected,
}

/// The session's side of a running connector
#[derive(Debug)]
pub struct ConnectorHandle {
    id: ConnectorId,
    server: BackendServer,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ConnectorHandle {
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn server(&self) -> &BackendServer {
        &self.server
    }

    /// Queues a server-bound payload; waits while the queue is full.
    pub async fn forward(&self, payload: Bytes) -> bool {
        self.outbound.send(payload).await.is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// Everything a connector needs to know about the session it serves
#[derive(Debug, Clone)]
pub struct ConnectorParams {
    pub id: ConnectorId,
    pub session: SessionId,
    pub server: BackendServer,
    pub mtu: u16,
    /// The player's original login packet, replayed to the backend
    pub login: Bytes,
    /// Whether pre-game packets may be relayed to the client
    pub first_server: bool,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub config: Arc<ProxyConfig>,
}

pub struct BackendConnector {
    params: ConnectorParams,
    state: ConnectorState,
    socket: UdpSocket,
    link: ReliableLink,
    guid: i64,
    rng: StdRng,
    outbound_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    last_activity: Instant,
    closed: bool,
}

fn unspecified_for(address: &SocketAddr) -> SocketAddr {
    match address.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

impl BackendConnector {
    /// Opens a socket to the backend, sends the first handshake packet and
    /// spawns the connector task
    ///
    /// Errors here mean the backend could not even be addressed; failures
    /// after this point arrive as [`SessionEvent::BackendClosed`].
    pub async fn spawn(params: ConnectorParams, mut rng: StdRng) -> Result<ConnectorHandle> {
        let socket = UdpSocket::bind(unspecified_for(&params.server.address)).await?;
        socket.connect(params.server.address).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(params.config.session_queue_capacity);
        let cancel = CancellationToken::new();
        let handle = ConnectorHandle {
            id: params.id,
            server: params.server.clone(),
            outbound: outbound_tx,
            cancel: cancel.clone(),
        };

        let mut connector = BackendConnector {
            link: ReliableLink::new(clamp_mtu(params.mtu)),
            guid: rng.gen(),
            params,
            state: ConnectorState::Unconnected,
            socket,
            rng,
            outbound_rx,
            cancel,
            last_activity: Instant::now(),
            closed: false,
        };
        connector.connect().await?;
        tokio::spawn(connector.run());

        Ok(handle)
    }

    async fn connect(&mut self) -> Result<()> {
        let request = OpenConnectionRequest1 {
            protocol: RAKNET_PROTOCOL_VERSION,
            mtu: self.link.mtu(),
        };
        self.socket.send(&request.encode()).await?;
        self.state = ConnectorState::Identify;
        self.last_activity = Instant::now();
        info!(
            "Session {} connecting to {} ({})",
            self.params.session, self.params.server.name, self.params.server.address
        );
        Ok(())
    }

    async fn run(mut self) {
        let mut fast = interval(self.params.config.connector_tick);
        fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut slow = interval(self.params.config.keepalive_interval);
        slow.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

        while !self.closed {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv(&mut buffer) => match received {
                    Ok(len) => {
                        let packet = Bytes::copy_from_slice(&buffer[..len]);
                        self.handle_packet(packet).await;
                    }
                    Err(e) => self.fail(e.to_string()),
                },
                Some(payload) = self.outbound_rx.recv(), if self.state == ConnectorState::Connected => {
                    if let Err(e) = self.send_package(payload).await {
                        debug!("Failed to forward to {}: {}", self.params.server.name, e);
                    }
                }
                _ = fast.tick() => self.fast_tick().await,
                _ = slow.tick() => self.keepalive().await,
            }
        }

        self.close().await;
    }

    async fn close(&mut self) {
        self.closed = true;
        self.cancel.cancel();
        self.outbound_rx.close();
        if self.state != ConnectorState::Unconnected {
            if let Err(e) = self.send_package(DisconnectNotification.encode()).await {
                trace!("Goodbye to {} not sent: {}", self.params.server.name, e);
            }
        }
        self.state = ConnectorState::Unconnected;
        debug!(
            "Session {} closed its connection to {}",
            self.params.session, self.params.server.name
        );
    }

    /// Hands an event to the session; a session that is gone stops the connector.
    fn report(&mut self, event: SessionEvent) {
        if self.params.events.send(event).is_err() {
            debug!(
                "Session {} is gone, closing its connection to {}",
                self.params.session, self.params.server.name
            );
            self.closed = true;
        }
    }

    /// Tells the session this connector is finished and stops the loop.
    fn fail(&mut self, reason: String) {
        if self.closed {
            return;
        }
        let message = if self.state == ConnectorState::Connected {
            format!("Lost connection to {}: {}", self.params.server.name, reason)
        } else {
            format!("Unable to connect to {}: {}", self.params.server.name, reason)
        };
        warn!("Session {}: {}", self.params.session, message);
        self.report(SessionEvent::BackendClosed {
            connector: self.params.id,
            reason: message,
        });
        self.closed = true;
    }

    fn disconnected(&mut self, packet: &[u8]) {
        let message = match Disconnect::decode(packet) {
            Ok(disconnect) => disconnect.message,
            Err(e) => {
                debug!("Malformed disconnect from {}: {}", self.params.server.name, e);
                String::new()
            }
        };
        info!(
            "Session {} disconnected by {}: {}",
            self.params.session, self.params.server.name, message
        );
        self.report(SessionEvent::BackendClosed {
            connector: self.params.id,
            reason: format!("Disconnected from {}: {}", self.params.server.name, message),
        });
        self.closed = true;
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.socket.send(data).await?;
        Ok(())
    }

    async fn send_package(&mut self, payload: Bytes) -> Result<()> {
        let datagrams = self.link.fragment(payload, &mut self.rng)?;
        for datagram in datagrams {
            let encoded = datagram.encode();
            self.link.register(datagram);
            self.send_raw(&encoded).await?;
        }
        Ok(())
    }

    async fn resend(&self, plan: RetransmitPlan) {
        for datagram in plan.resend {
            if let Err(e) = self.send_raw(&datagram.encode()).await {
                debug!("Resend to {} failed: {}", self.params.server.name, e);
                self.link.forget(datagram.sequence);
            }
        }
    }

    async fn fast_tick(&mut self) {
        let now = Instant::now();
        self.link.collect_splits(now);
        let plan = self.link.poll_retransmit(now);
        self.resend(plan).await;
        if let Some(ack) = self.link.take_ack() {
            if let Err(e) = self.send_raw(&ack.encode()).await {
                debug!("ACK to {} failed: {}", self.params.server.name, e);
            }
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if idle > self.params.config.backend_timeout {
            self.fail(format!("timed out after {}s", idle.as_secs()));
        }
    }

    async fn keepalive(&mut self) {
        if self.state != ConnectorState::Connected {
            return;
        }
        let ping = ConnectedPing {
            timestamp: get_timestamp(),
        };
        if let Err(e) = self.send_package(ping.encode()).await {
            debug!("Keepalive to {} failed: {}", self.params.server.name, e);
        }
    }

    async fn handle_packet(&mut self, packet: Bytes) {
        self.last_activity = Instant::now();
        let Some(&id) = packet.first() else {
            return;
        };
        match id {
            ID_ACK | ID_NAK => self.handle_ack(&packet).await,
            _ if is_datagram(id) => self.handle_datagram(&packet).await,
            ID_OPEN_CONNECTION_REPLY_1 if self.state == ConnectorState::Identify => {
                self.handle_reply1(&packet).await
            }
            ID_OPEN_CONNECTION_REPLY_2 if self.state == ConnectorState::Identify => {
                self.handle_reply2().await
            }
            ID_NO_FREE_INCOMING_CONNECTIONS => self.fail("server is full".to_string()),
            ID_CONNECTION_BANNED => self.fail("banned".to_string()),
            ID_CONNECTED_PING => {
                if let Ok(ping) = ConnectedPing::decode(&packet) {
                    let pong = ConnectedPong {
                        ping_timestamp: ping.timestamp,
                        pong_timestamp: get_timestamp(),
                    };
                    if let Err(e) = self.send_raw(&pong.encode()).await {
                        debug!("Pong to {} failed: {}", self.params.server.name, e);
                    }
                }
            }
            _ => trace!(
                "Ignoring packet {:#04x} from {} in {:?}",
                id,
                self.params.server.name,
                self.state
            ),
        }
    }

    async fn handle_ack(&mut self, packet: &[u8]) {
        match AckPacket::decode(packet) {
            Ok(ack) if ack.kind == AckKind::Ack => {
                self.link.handle_ack(&ack.ranges);
            }
            Ok(nak) => {
                self.link.handle_nak(&nak.ranges);
            }
            Err(e) => debug!("Malformed ACK from {}: {}", self.params.server.name, e),
        }
    }

    async fn handle_reply1(&mut self, packet: &[u8]) {
        let reply = match OpenConnectionReply1::decode(packet) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Malformed reply 1 from {}: {}", self.params.server.name, e);
                return;
            }
        };
        let mtu = clamp_mtu(reply.mtu.min(self.link.mtu()));
        self.link.set_mtu(mtu);

        let request = OpenConnectionRequest2 {
            server_address: self.params.server.address,
            mtu,
            client_guid: self.guid,
        };
        if let Err(e) = self.send_raw(&request.encode()).await {
            self.fail(e.to_string());
        }
    }

    async fn handle_reply2(&mut self) {
        let request = ConnectionRequest {
            client_guid: self.guid,
            timestamp: get_timestamp(),
            secure: false,
        };
        if let Err(e) = self.send_package(request.encode()).await {
            self.fail(e.to_string());
        }
    }

    async fn handle_datagram(&mut self, packet: &[u8]) {
        let payloads = match self.link.receive(packet) {
            Ok(payloads) => payloads,
            Err(e) => {
                debug!("Malformed datagram from {}: {}", self.params.server.name, e);
                return;
            }
        };
        for payload in payloads {
            if self.closed {
                break;
            }
            match self.state {
                ConnectorState::Identify => self.handle_identify(payload).await,
                ConnectorState::Connected => self.handle_connected(payload).await,
                ConnectorState::Unconnected => {}
            }
        }
    }

    async fn reply_ping(&mut self, payload: &[u8]) {
        if let Ok(ping) = ConnectedPing::decode(payload) {
            let pong = ConnectedPong {
                ping_timestamp: ping.timestamp,
                pong_timestamp: get_timestamp(),
            };
            if let Err(e) = self.send_package(pong.encode()).await {
                debug!("Pong to {} failed: {}", self.params.server.name, e);
            }
        }
    }

    async fn handle_identify(&mut self, payload: Bytes) {
        let Some(&id) = payload.first() else {
            return;
        };
        match id {
            ID_CONNECTION_REQUEST_ACCEPTED => self.send_login().await,
            ID_CONNECTED_PING => self.reply_ping(&payload).await,
            ID_CONNECTED_PONG => {}
            ID_DISCONNECT_NOTIFICATION => self.fail("closed by server".to_string()),
            mcpe::ID_DISCONNECT => self.disconnected(&payload),
            _ => {
                if let Some(start_game) = mcpe::find_start_game(&payload) {
                    self.started(start_game, payload);
                } else if let Some(disconnect) = mcpe::find_packet(&payload, mcpe::ID_DISCONNECT) {
                    self.disconnected(&disconnect);
                } else if self.params.first_server {
                    self.report(SessionEvent::BackendPayload {
                        connector: self.params.id,
                        payload,
                    });
                } else {
                    trace!(
                        "Dropping pre-game packet {:#04x} from {}",
                        id,
                        self.params.server.name
                    );
                }
            }
        }
    }

    async fn send_login(&mut self) {
        let incoming = NewIncomingConnection {
            cookie: self.rng.gen(),
            secure: false,
            port: self.params.server.address.port(),
            session: [get_timestamp(), self.rng.gen()],
        };
        if let Err(e) = self.send_package(incoming.encode()).await {
            self.fail(e.to_string());
            return;
        }

        let login = match Batch::new(vec![self.params.login.clone()]).encode() {
            Ok(login) => login,
            Err(e) => {
                self.fail(format!("cannot compress login: {}", e));
                return;
            }
        };
        match self.send_package(login).await {
            Ok(()) => debug!(
                "Session {} sent its login to {}",
                self.params.session, self.params.server.name
            ),
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn started(&mut self, start_game: StartGame, payload: Bytes) {
        self.state = ConnectorState::Connected;
        info!(
            "Session {} joined {} as entity {}",
            self.params.session, self.params.server.name, start_game.entity_id
        );
        self.report(SessionEvent::BackendReady {
            connector: self.params.id,
            start_game,
            payload,
        });
    }

    async fn handle_connected(&mut self, payload: Bytes) {
        match payload.first() {
            Some(&ID_CONNECTED_PING) => self.reply_ping(&payload).await,
            Some(&ID_CONNECTED_PONG) => {}
            Some(&ID_DISCONNECT_NOTIFICATION) => self.fail("closed by server".to_string()),
            Some(&mcpe::ID_DISCONNECT) => self.disconnected(&payload),
            Some(_) => self.report(SessionEvent::BackendPayload {
                connector: self.params.id,
                payload,
            }),
            None => {}
        }
    }
}
