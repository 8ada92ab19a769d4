//! Capability the negotiation controller drives. Implemented by the webrtc-rs
//! adapter in `beach-peer` and, behind the `test-util` feature, by
//! `mock::MockPeer`.

use std::fmt;

use async_trait::async_trait;
use signal_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Notifications emitted by a peer transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// A gathered local candidate; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    SignalingStateChange(SignalingState),
    ConnectionStateChange(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation invalid in signaling state {state}: {operation}")]
    InvalidState {
        state: SignalingState,
        operation: &'static str,
    },
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("peer connection is closed")]
    Closed,
    #[error("event stream already taken")]
    EventsTaken,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Applies a local description. `None` lets the transport derive one from
    /// its signaling state: an answer after a remote offer, otherwise an offer.
    async fn set_local_description(
        &self,
        description: Option<SessionDescription>,
    ) -> Result<(), TransportError>;

    /// Applies a remote description. Applying an offer while a local offer is
    /// outstanding rolls the local offer back first.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    /// Takes the event stream. Only the first call succeeds.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransportError>;
}
