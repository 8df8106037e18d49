//! # MCPE Proxy Library
//!
//! A transparent UDP proxy for Minecraft: Pocket Edition. Players connect to
//! the proxy as if it were a game server; the proxy terminates their RakNet
//! connection, reads the login and opens its own RakNet connection to a
//! backend server on the player's behalf. Players can later be moved between
//! backends without reconnecting their client.
//!
//! ## Core Responsibilities
//!
//! ### Server List Presence
//! Unconnected pings are answered directly with the proxy's name, version and
//! current player count, so the proxy shows up in the client's server list.
//!
//! ### Connection Termination
//! The proxy speaks both sides of RakNet: it accepts clients with the
//! open-connection handshake and connects to backends with the same
//! handshake, each side with its own reliability state (ACKs, retransmission,
//! split reassembly).
//!
//! ### Backend Switching
//! A transfer opens a second backend connection while the player stays on
//! the first. Once the new backend starts the game, the old connection is
//! dropped, the client receives a respawn and entity ids are translated
//! between what the client knows and what the new backend uses.
//!
//! ## Architecture Design
//!
//! ### One Task per Connection
//! Each client session and each backend connector runs as its own tokio
//! task and owns its state outright. Tasks talk through queues only: the
//! receive loop feeds a session's inbound queue, connectors send
//! [`session::SessionEvent`]s back. No task holds a reference into another.
//!
//! ### Registry Lookups
//! The [`registry::ConnectionRegistry`] maps endpoints and player names to
//! session handles. Routing, the ping reply and the operator console all go
//! through it.
//!
//! ### Worker Pool for Strangers
//! Packets from endpoints without a session are handled by a small pool of
//! workers sharing one bounded queue, which keeps handshake floods from
//! stalling the receive loop.

pub mod config;
pub mod connector;
pub mod console;
pub mod error;
pub mod network;
pub mod registry;
pub mod rewriter;
pub mod session;
pub mod unannounced;
pub mod utils;

pub use config::{BackendServer, ProxyConfig};
pub use error::{ProxyError, Result};
pub use network::{ProxyContext, ProxyServer};
