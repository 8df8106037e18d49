//! Lookup of live client sessions by network endpoint and by player name
//!
//! Sessions are owned by their own tasks. The registry only stores
//! [`SessionHandle`]s: cheap, cloneable references holding the session's
//! stable id, its inbound packet queue, its event queue and its cancellation
//! token. Every other component reaches a session through these handles, so
//! nothing holds a pointer back into session state.

use crate::session::SessionEvent;
use bytes::Bytes;
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

/// Cloneable reference to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    endpoint: SocketAddr,
    inbound: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        endpoint: SocketAddr,
        inbound: mpsc::Sender<Bytes>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            endpoint,
            inbound,
            events,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Queues a raw packet from the client; waits while the queue is full.
    pub async fn deliver(&self, packet: Bytes) -> bool {
        self.inbound.send(packet).await.is_ok()
    }

    pub fn notify(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Stops the session loop without a goodbye to the client.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.inbound.is_closed()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_endpoint: HashMap<SocketAddr, SessionHandle>,
    by_username: HashMap<String, SessionHandle>,
}

/// Concurrent index of sessions
///
/// Reads (packet routing, ping replies) vastly outnumber writes (session
/// creation and teardown), so both maps sit behind one async read-write lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
}

fn username_key(username: &str) -> String {
    username.to_lowercase()
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next stable session id
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds a session under its endpoint
    ///
    /// Returns false without modifying the registry if the endpoint already
    /// has a session.
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_endpoint.contains_key(&handle.endpoint) {
            debug!("Endpoint {} already has a session", handle.endpoint);
            return false;
        }
        info!("Session {} registered for {}", handle.id, handle.endpoint);
        inner.by_endpoint.insert(handle.endpoint, handle);
        true
    }

    /// Adds the player name index for an already registered session
    ///
    /// Names compare case-insensitively. Returns false if the name is taken.
    pub async fn register_name(&self, username: &str, handle: &SessionHandle) -> bool {
        let key = username_key(username);
        let mut inner = self.inner.write().await;
        if inner.by_username.contains_key(&key) {
            debug!("Player name {} is already in use", username);
            return false;
        }
        inner.by_username.insert(key, handle.clone());
        true
    }

    /// Removes a session from both indexes
    ///
    /// Entries are only removed when they still belong to session `id`, so a
    /// late teardown cannot evict a newer session on the same endpoint.
    pub async fn unregister(&self, id: SessionId, endpoint: SocketAddr, username: Option<&str>) {
        let mut inner = self.inner.write().await;
        if inner.by_endpoint.get(&endpoint).map(|h| h.id) == Some(id) {
            inner.by_endpoint.remove(&endpoint);
            info!("Session {} unregistered for {}", id, endpoint);
        }
        if let Some(username) = username {
            let key = username_key(username);
            if inner.by_username.get(&key).map(|h| h.id) == Some(id) {
                inner.by_username.remove(&key);
            }
        }
    }

    /// Drops every entry of session `id`, whatever name or endpoint it used.
    pub async fn remove_session(&self, id: SessionId) {
        let mut inner = self.inner.write().await;
        inner.by_endpoint.retain(|_, h| h.id != id);
        inner.by_username.retain(|_, h| h.id != id);
    }

    pub async fn get_by_endpoint(&self, endpoint: SocketAddr) -> Option<SessionHandle> {
        self.inner.read().await.by_endpoint.get(&endpoint).cloned()
    }

    pub async fn get_by_username(&self, username: &str) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .by_username
            .get(&username_key(username))
            .cloned()
    }

    /// Logged-in players, as advertised in the server list
    pub async fn player_count(&self) -> usize {
        self.inner.read().await.by_username.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_endpoint.len()
    }

    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.read().await.by_endpoint.values().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.by_username.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn create_test_handle(registry: &ConnectionRegistry, port: u16) -> SessionHandle {
        let (inbound, _) = mpsc::channel(1);
        let (events, _) = mpsc::unbounded_channel();
        SessionHandle::new(
            registry.allocate_id(),
            create_test_addr(port),
            inbound,
            events,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let handle = create_test_handle(&registry, 8080);

        assert!(registry.register(handle.clone()).await);

        let found = registry.get_by_endpoint(create_test_addr(8080)).await.unwrap();
        assert_eq!(found.id(), handle.id());
        assert!(registry.get_by_endpoint(create_test_addr(8081)).await.is_none());
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_rejected() {
        let registry = ConnectionRegistry::new();
        let first = create_test_handle(&registry, 8080);
        let second = create_test_handle(&registry, 8080);

        assert!(registry.register(first.clone()).await);
        assert!(!registry.register(second).await);

        let found = registry.get_by_endpoint(create_test_addr(8080)).await.unwrap();
        assert_eq!(found.id(), first.id());
    }

    #[tokio::test]
    async fn test_register_name_case_insensitive() {
        let registry = ConnectionRegistry::new();
        let steve = create_test_handle(&registry, 8080);
        let other = create_test_handle(&registry, 8081);
        registry.register(steve.clone()).await;
        registry.register(other.clone()).await;

        assert!(registry.register_name("Steve", &steve).await);
        assert!(!registry.register_name("steve", &other).await);

        assert_eq!(registry.get_by_username("STEVE").await.unwrap().id(), steve.id());
        assert_eq!(registry.player_count().await, 1);
        assert_eq!(registry.usernames().await, vec!["steve".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_removes_both_indexes() {
        let registry = ConnectionRegistry::new();
        let handle = create_test_handle(&registry, 8080);
        registry.register(handle.clone()).await;
        registry.register_name("Alex", &handle).await;

        registry
            .unregister(handle.id(), handle.endpoint(), Some("Alex"))
            .await;

        assert!(registry.get_by_endpoint(handle.endpoint()).await.is_none());
        assert!(registry.get_by_username("Alex").await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_session() {
        let registry = ConnectionRegistry::new();
        let old = create_test_handle(&registry, 8080);
        let new = create_test_handle(&registry, 8080);

        registry.register(old.clone()).await;
        registry.unregister(old.id(), old.endpoint(), None).await;
        registry.register(new.clone()).await;
        registry.unregister(old.id(), old.endpoint(), None).await;

        let found = registry.get_by_endpoint(new.endpoint()).await.unwrap();
        assert_eq!(found.id(), new.id());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let registry = ConnectionRegistry::new();
        let handle = create_test_handle(&registry, 8080);
        let other = create_test_handle(&registry, 8081);
        registry.register(handle.clone()).await;
        registry.register(other.clone()).await;
        registry.register_name("Alex", &handle).await;

        registry.remove_session(handle.id()).await;

        assert!(registry.get_by_username("alex").await.is_none());
        assert_eq!(registry.session_count().await, 1);
        assert!(registry.get_by_endpoint(other.endpoint()).await.is_some());
    }

    #[test]
    fn test_allocated_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_closed_handle() {
        let registry = ConnectionRegistry::new();
        let handle = create_test_handle(&registry, 8080);
        // the receivers were dropped in create_test_handle
        assert!(handle.is_closed());
        assert!(!handle.deliver(Bytes::from_static(b"x")).await);
    }
}
