//! WebSocket signaling relay.
//!
//! Peers connect to `/{session}` and are grouped by session name. Every
//! frame a peer sends is forwarded to the other members of its session, and
//! the relay pushes a control message with politeness and the current roster
//! whenever membership changes.

pub mod api;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::{Cli, ConnectionConfig, ServerConfig, SessionConfig};
pub use connection::{ConnectionError, ConnectionHandle, ConnectionMeta, ConnectionState};
pub use registry::SessionRegistry;
pub use server::{router, serve, AppState};
pub use session::{Membership, Session, SessionError};
