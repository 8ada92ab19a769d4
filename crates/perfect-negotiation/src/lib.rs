//! Peer side of beach signaling: a relay client with automatic reconnect and
//! a perfect-negotiation controller that drives any [`PeerTransport`].

pub mod backoff;
pub mod client;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod negotiator;
pub mod politeness;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{SignalSink, SignalingClient, SignalingConfig, SignalingError};
pub use negotiator::{NegotiationError, NegotiationHandle, Negotiator, PerfectNegotiation};
pub use politeness::{Politeness, PolitenessMode};
pub use transport::{PeerEvent, PeerTransport, SignalingState, TransportError};
