//! Per-client connection state machine
//!
//! A [`ClientSession`] runs as its own task once the client completes the
//! open-connection handshake. It owns the RakNet reliability state for the
//! client, answers the client's RakNet handshake itself, reads the login and
//! then bridges application traffic to a [`BackendConnector`].
//!
//! ## Lifecycle
//!
//! ```text
//!   Identify ──login──▶ Connecting ──StartGame from backend──▶ Connected
//!      │                    │                                      │
//!      └────────────────────┴──── abandon (timeout, kick, error) ──┘
//! ```
//!
//! Every input, whether a raw packet from the client, an event from a
//! connector or a timer tick, goes through the one run loop, so session
//! state is never shared.

use crate::config::BackendServer;
use crate::connector::{BackendConnector, ConnectorHandle, ConnectorId, ConnectorParams};
use crate::error::Result;
use crate::network::ProxyContext;
use crate::registry::{SessionHandle, SessionId};
use crate::rewriter::EntityIdRewriter;
use crate::utils::{fork_rng, get_timestamp};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use protocol::mcpe::{self, Batch, Disconnect, Login, Respawn, StartGame, Text};
use protocol::raknet::{
    ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted,
    DisconnectNotification,
};
use protocol::{
    is_datagram, AckKind, AckPacket, Packet, ReliableLink, RetransmitPlan, ID_ACK,
    ID_CONNECTED_PING, ID_CONNECTED_PONG, ID_CONNECTION_REQUEST, ID_DISCONNECT_NOTIFICATION,
    ID_NAK, ID_NEW_INCOMING_CONNECTION,
};
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// RakNet handshake and login
    Identify,
    /// Logged in, waiting for the first backend to start the game
    Connecting,
    Connected,
}

/// Messages delivered to a session from other tasks
#[derive(Debug)]
pub enum SessionEvent {
    /// A connector finished its handshake and the backend started the game
    BackendReady {
        connector: ConnectorId,
        start_game: StartGame,
        payload: Bytes,
    },
    /// A client-bound application payload
    BackendPayload {
        connector: ConnectorId,
        payload: Bytes,
    },
    /// A connector gave up; `reason` is shown to the player
    BackendClosed {
        connector: ConnectorId,
        reason: String,
    },
    Transfer(BackendServer),
    Kick(String),
}

pub struct ClientSession {
    id: SessionId,
    endpoint: SocketAddr,
    state: SessionState,
    ctx: Arc<ProxyContext>,
    link: ReliableLink,
    rng: StdRng,
    handle: SessionHandle,
    inbound_rx: mpsc::Receiver<Bytes>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    username: Option<String>,
    login: Option<Bytes>,
    backend: Option<ConnectorHandle>,
    pending_backend: Option<ConnectorHandle>,
    next_connector: ConnectorId,
    rewriter: Option<EntityIdRewriter>,
    last_activity: Instant,
    abandoned: bool,
}

impl ClientSession {
    /// Creates a session for `endpoint` together with the handle the
    /// registry stores for it
    pub fn new(
        ctx: Arc<ProxyContext>,
        endpoint: SocketAddr,
        mtu: u16,
        rng: StdRng,
    ) -> (Self, SessionHandle) {
        let id = ctx.registry.allocate_id();
        let (inbound_tx, inbound_rx) = mpsc::channel(ctx.config.session_queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = SessionHandle::new(id, endpoint, inbound_tx, events_tx.clone(), cancel.clone());

        let session = ClientSession {
            id,
            endpoint,
            state: SessionState::Identify,
            ctx,
            link: ReliableLink::new(mtu),
            rng,
            handle: handle.clone(),
            inbound_rx,
            events_rx,
            events_tx,
            cancel,
            username: None,
            login: None,
            backend: None,
            pending_backend: None,
            next_connector: 0,
            rewriter: None,
            last_activity: Instant::now(),
            abandoned: false,
        };
        (session, handle)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.ctx.config.session_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Session {} started for {}", self.id, self.endpoint);

        while !self.abandoned {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(packet) = self.inbound_rx.recv() => self.handle_packet(packet).await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.abandon().await;
    }

    /// Tears the session down without telling the client
    ///
    /// Returns false if the session was already abandoned.
    pub async fn abandon(&mut self) -> bool {
        if self.abandoned {
            return false;
        }
        self.abandoned = true;
        self.ctx
            .registry
            .unregister(self.id, self.endpoint, self.username.as_deref())
            .await;
        self.cancel.cancel();
        self.inbound_rx.close();
        if let Some(backend) = self.backend.take() {
            backend.close();
        }
        if let Some(pending) = self.pending_backend.take() {
            pending.close();
        }
        info!(
            "Session {} for {} ({}) closed",
            self.id,
            self.endpoint,
            self.username.as_deref().unwrap_or("not logged in")
        );
        true
    }

    /// Shows `reason` to the client, says goodbye at the RakNet level and
    /// abandons the session
    pub async fn abandon_with_reason(&mut self, reason: &str) {
        if self.abandoned {
            return;
        }
        info!("Disconnecting {}: {}", self.endpoint, reason);
        let disconnect = Disconnect {
            message: reason.to_string(),
        };
        if let Err(e) = self.send_package(disconnect.encode()).await {
            debug!("Disconnect message to {} not sent: {}", self.endpoint, e);
        }
        if let Err(e) = self.send_package(DisconnectNotification.encode()).await {
            debug!("Disconnect notification to {} not sent: {}", self.endpoint, e);
        }
        self.abandon().await;
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.ctx.socket.send_to(data, self.endpoint).await?;
        Ok(())
    }

    /// Sends one application payload reliably, split as the MTU requires.
    async fn send_package(&mut self, payload: Bytes) -> Result<()> {
        let datagrams = self.link.fragment(payload, &mut self.rng)?;
        for datagram in datagrams {
            let encoded = datagram.encode();
            self.link.register(datagram);
            self.send_raw(&encoded).await?;
        }
        Ok(())
    }

    async fn send_text(&mut self, message: String) {
        if let Err(e) = self.send_package(Text::raw(message).encode()).await {
            debug!("Text to {} not sent: {}", self.endpoint, e);
        }
    }

    async fn resend(&self, plan: RetransmitPlan) {
        for datagram in plan.resend {
            if let Err(e) = self.send_raw(&datagram.encode()).await {
                debug!("Resend to {} failed: {}", self.endpoint, e);
                self.link.forget(datagram.sequence);
            }
        }
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        self.link.collect_splits(now);
        let plan = self.link.poll_retransmit(now);
        self.resend(plan).await;
        if let Some(ack) = self.link.take_ack() {
            if let Err(e) = self.send_raw(&ack.encode()).await {
                debug!("ACK to {} failed: {}", self.endpoint, e);
            }
        }

        if now.saturating_duration_since(self.last_activity) > self.ctx.config.session_timeout {
            warn!("Session {} for {} timed out", self.id, self.endpoint);
            self.abandon_with_reason("Ping timeout").await;
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
            ID_CONNECTED_PING => self.reply_ping(&packet, false).await,
            ID_DISCONNECT_NOTIFICATION => {
                info!("{} closed the connection", self.endpoint);
                self.abandon().await;
            }
            _ => debug!(
                "Unexpected packet {:#04x} from {} in {:?}",
                id, self.endpoint, self.state
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
            Err(e) => debug!("Malformed ACK from {}: {}", self.endpoint, e),
        }
    }

    async fn handle_datagram(&mut self, packet: &[u8]) {
        let payloads = match self.link.receive(packet) {
            Ok(payloads) => payloads,
            Err(e) => {
                debug!("Malformed datagram from {}: {}", self.endpoint, e);
                return;
            }
        };
        for payload in payloads {
            if self.abandoned {
                break;
            }
            self.dispatch(payload).await;
        }
    }

    /// Routes one reassembled payload according to the session state.
    async fn dispatch(&mut self, payload: Bytes) {
        match self.state {
            SessionState::Identify | SessionState::Connecting => {
                if payload.first() == Some(&mcpe::ID_BATCH) {
                    match Batch::decode(&payload) {
                        Ok(batch) => {
                            for packet in batch.packets {
                                if self.abandoned {
                                    break;
                                }
                                self.handle_identify(packet).await;
                            }
                        }
                        Err(e) => debug!("Malformed batch from {}: {}", self.endpoint, e),
                    }
                } else {
                    self.handle_identify(payload).await;
                }
            }
            SessionState::Connected => self.handle_connected(payload).await,
        }
    }

    /// Handles pings and goodbyes, which mean the same in every state.
    async fn handle_control(&mut self, payload: &[u8]) -> bool {
        match payload.first() {
            Some(&ID_CONNECTED_PING) => self.reply_ping(payload, true).await,
            Some(&ID_CONNECTED_PONG) => {}
            Some(&ID_DISCONNECT_NOTIFICATION) => {
                info!("{} closed the connection", self.endpoint);
                self.abandon().await;
            }
            _ => return false,
        }
        true
    }

    async fn reply_ping(&mut self, payload: &[u8], reliable: bool) {
        let ping = match ConnectedPing::decode(payload) {
            Ok(ping) => ping,
            Err(e) => {
                debug!("Malformed ping from {}: {}", self.endpoint, e);
                return;
            }
        };
        let pong = ConnectedPong {
            ping_timestamp: ping.timestamp,
            pong_timestamp: get_timestamp(),
        }
        .encode();
        let sent = if reliable {
            self.send_package(pong).await
        } else {
            self.send_raw(&pong).await
        };
        if let Err(e) = sent {
            debug!("Pong to {} failed: {}", self.endpoint, e);
        }
    }

    async fn handle_identify(&mut self, payload: Bytes) {
        if self.handle_control(&payload).await {
            return;
        }
        match payload.first() {
            Some(&ID_CONNECTION_REQUEST) => self.accept_connection(&payload).await,
            Some(&ID_NEW_INCOMING_CONNECTION) => {
                debug!("{} completed the RakNet handshake", self.endpoint)
            }
            Some(&mcpe::ID_LOGIN) => self.handle_login(payload).await,
            Some(id) => trace!(
                "Dropping packet {:#04x} from {} in {:?}",
                id,
                self.endpoint,
                self.state
            ),
            None => {}
        }
    }

    async fn accept_connection(&mut self, payload: &[u8]) {
        let request = match ConnectionRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed connection request from {}: {}", self.endpoint, e);
                return;
            }
        };
        let accepted = ConnectionRequestAccepted {
            client_address: self.endpoint,
            request_timestamp: request.timestamp,
            accepted_timestamp: get_timestamp(),
        };
        if let Err(e) = self.send_package(accepted.encode()).await {
            warn!("Failed to accept connection from {}: {}", self.endpoint, e);
            self.abandon().await;
        }
    }

    async fn handle_login(&mut self, payload: Bytes) {
        if self.state != SessionState::Identify {
            debug!("Ignoring repeated login from {}", self.endpoint);
            return;
        }
        let login = match Login::decode(&payload) {
            Ok(login) => login,
            Err(e) => {
                warn!("Malformed login from {}: {}", self.endpoint, e);
                self.abandon_with_reason("Invalid login").await;
                return;
            }
        };
        if !self.ctx.registry.register_name(&login.username, &self.handle).await {
            self.abandon_with_reason("Already logged in").await;
            return;
        }

        info!(
            "{} ({}) logged in from {}",
            login.username, login.client_uuid, self.endpoint
        );
        self.username = Some(login.username);
        self.login = Some(payload);
        self.state = SessionState::Connecting;

        let server = match self.ctx.config.default_backend() {
            Ok(server) => server.clone(),
            Err(e) => {
                self.abandon_with_reason(&e.to_string()).await;
                return;
            }
        };
        self.connect(server).await;
    }

    async fn handle_connected(&mut self, payload: Bytes) {
        if self.handle_control(&payload).await {
            return;
        }
        let Some(backend) = &self.backend else {
            return;
        };
        let payload = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite_server_bound(payload),
            None => payload,
        };
        if !backend.forward(payload).await {
            debug!("Backend {} no longer accepts packets", backend.server().name);
        }
    }

    /// Starts a connector to `server`
    ///
    /// The first connector becomes the backend directly; later ones wait in
    /// `pending_backend` until the new server starts the game.
    async fn connect(&mut self, server: BackendServer) {
        let Some(login) = self.login.clone() else {
            return;
        };
        let first_server = self.backend.is_none();
        self.next_connector += 1;
        let params = ConnectorParams {
            id: self.next_connector,
            session: self.id,
            server: server.clone(),
            mtu: self.link.mtu(),
            login,
            first_server,
            events: self.events_tx.clone(),
            config: Arc::clone(&self.ctx.config),
        };

        match BackendConnector::spawn(params, fork_rng(&mut self.rng)).await {
            Ok(handle) if first_server => self.backend = Some(handle),
            Ok(handle) => {
                if let Some(previous) = self.pending_backend.replace(handle) {
                    previous.close();
                }
            }
            Err(e) => {
                let reason = format!("Unable to connect to {}: {}", server.name, e);
                warn!("Session {}: {}", self.id, reason);
                if first_server {
                    self.abandon_with_reason(&reason).await;
                } else {
                    self.send_text(reason).await;
                }
            }
        }
    }

    fn is_backend(&self, connector: ConnectorId) -> bool {
        self.backend.as_ref().map(|b| b.id()) == Some(connector)
    }

    fn is_pending(&self, connector: ConnectorId) -> bool {
        self.pending_backend.as_ref().map(|b| b.id()) == Some(connector)
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::BackendReady {
                connector,
                start_game,
                payload,
            } => self.backend_ready(connector, start_game, payload).await,
            SessionEvent::BackendPayload { connector, payload } => {
                if !self.is_backend(connector) {
                    trace!("Dropping payload from stale connector {}", connector);
                    return;
                }
                let payload = match &self.rewriter {
                    Some(rewriter) => rewriter.rewrite_client_bound(payload),
                    None => payload,
                };
                if let Err(e) = self.send_package(payload).await {
                    debug!("Relay to {} failed: {}", self.endpoint, e);
                }
            }
            SessionEvent::BackendClosed { connector, reason } => {
                if self.is_backend(connector) {
                    self.abandon_with_reason(&reason).await;
                } else if self.is_pending(connector) {
                    if let Some(pending) = self.pending_backend.take() {
                        pending.close();
                    }
                    self.send_text(reason).await;
                }
            }
            SessionEvent::Transfer(server) => self.transfer(server).await,
            SessionEvent::Kick(reason) => self.abandon_with_reason(&reason).await,
        }
    }

    async fn backend_ready(&mut self, connector: ConnectorId, start_game: StartGame, payload: Bytes) {
        if self.is_backend(connector) {
            self.rewriter = Some(EntityIdRewriter::new(start_game.entity_id));
            if let Err(e) = self.send_package(payload).await {
                debug!("StartGame to {} failed: {}", self.endpoint, e);
            }
            self.state = SessionState::Connected;
            return;
        }
        if !self.is_pending(connector) {
            trace!("Ignoring stale connector {}", connector);
            return;
        }

        let Some(pending) = self.pending_backend.take() else {
            return;
        };
        if let Some(previous) = self.backend.replace(pending) {
            previous.close();
        }
        self.rewriter
            .get_or_insert_with(|| EntityIdRewriter::new(start_game.entity_id))
            .set_new_server_id(start_game.entity_id);
        let respawn = Respawn {
            location: start_game.location,
        };
        if let Err(e) = self.send_package(respawn.encode()).await {
            debug!("Respawn to {} failed: {}", self.endpoint, e);
        }
        self.state = SessionState::Connected;
        if let Some(backend) = &self.backend {
            info!(
                "{} transferred to {}",
                self.username.as_deref().unwrap_or("?"),
                backend.server().name
            );
        }
    }

    async fn transfer(&mut self, server: BackendServer) {
        if self.state != SessionState::Connected {
            debug!("Session {} cannot transfer in {:?}", self.id, self.state);
            return;
        }
        if self.backend.as_ref().map(|b| b.server()) == Some(&server) {
            self.send_text(format!("Already connected to {}", server.name)).await;
            return;
        }
        info!(
            "Transferring {} to {}",
            self.username.as_deref().unwrap_or("?"),
            server.name
        );
        self.connect(server).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::registry::ConnectionRegistry;
    use rand::SeedableRng;
    use tokio::net::UdpSocket;

    async fn create_test_context() -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            registry: ConnectionRegistry::new(),
            config: Arc::new(ProxyConfig::default()),
            guid: 1,
        })
    }

    #[tokio::test]
    async fn test_new_session_starts_in_identify() {
        let ctx = create_test_context().await;
        let endpoint: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (session, handle) = ClientSession::new(ctx, endpoint, 1400, StdRng::seed_from_u64(1));

        assert_eq!(session.state(), SessionState::Identify);
        assert_eq!(session.id(), handle.id());
        assert_eq!(handle.endpoint(), endpoint);
    }

    #[tokio::test]
    async fn test_abandon_unregisters_once() {
        let ctx = create_test_context().await;
        let endpoint: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let (mut session, handle) =
            ClientSession::new(Arc::clone(&ctx), endpoint, 1400, StdRng::seed_from_u64(2));
        assert!(ctx.registry.register(handle.clone()).await);

        assert!(session.abandon().await);
        assert!(!session.abandon().await);

        assert!(ctx.registry.get_by_endpoint(endpoint).await.is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_kick_sends_disconnect() {
        let ctx = create_test_context().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = client.local_addr().unwrap();
        let (session, handle) =
            ClientSession::new(Arc::clone(&ctx), endpoint, 1400, StdRng::seed_from_u64(3));
        ctx.registry.register(handle.clone()).await;
        let task = tokio::spawn(session.run());

        assert!(handle.notify(SessionEvent::Kick("Proxy closed".to_string())));

        let receiver = ReliableLink::new(1400);
        let mut buffer = [0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.recv_from(&mut buffer),
        )
        .await
        .unwrap()
        .unwrap();
        let payloads = receiver.receive(&buffer[..len]).unwrap();
        let disconnect = Disconnect::decode(&payloads[0]).unwrap();
        assert_eq!(disconnect.message, "Proxy closed");

        task.await.unwrap();
        assert!(ctx.registry.get_by_endpoint(endpoint).await.is_none());
    }
}
