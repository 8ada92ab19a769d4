//! Deterministic in-memory [`PeerTransport`] for negotiation tests.
//!
//! `MockPeer` follows the signaling state machine of a WebRTC peer
//! connection, including the implicit rollback of an outstanding local offer
//! when a remote offer is applied. SDP bodies are derived only from the peer
//! id and the offer counter, so runs are reproducible.

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{PeerEvent, PeerTransport, SignalingState, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct MockSnapshot {
    pub state: SignalingState,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
}

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    offers_created: u32,
    candidates_gathered: u32,
}

pub struct MockPeer {
    id: String,
    state: Mutex<MockState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl MockPeer {
    /// `id` doubles as the ICE username fragment of every local description.
    pub fn new(id: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                pending_local: None,
                current_local: None,
                pending_remote: None,
                current_remote: None,
                remote_candidates: Vec::new(),
                offers_created: 0,
                candidates_gathered: 0,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires a negotiation-needed event, as adding a track or channel would.
    pub fn negotiation_needed(&self) {
        self.emit(PeerEvent::NegotiationNeeded);
    }

    /// Emits a new local host candidate and returns it.
    pub fn gather_candidate(&self) -> IceCandidate {
        let index = {
            let mut state = self.state.lock();
            state.candidates_gathered += 1;
            state.candidates_gathered
        };
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{index} 1 udp 2130706431 127.0.0.1 {} typ host",
                50_000 + index
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.id.clone()),
        };
        self.emit(PeerEvent::IceCandidate(Some(candidate.clone())));
        candidate
    }

    pub fn end_of_candidates(&self) {
        self.emit(PeerEvent::IceCandidate(None));
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    pub fn snapshot(&self) -> MockSnapshot {
        let state = self.state.lock();
        MockSnapshot {
            state: state.signaling,
            local: state
                .pending_local
                .clone()
                .or_else(|| state.current_local.clone()),
            remote: state
                .pending_remote
                .clone()
                .or_else(|| state.current_remote.clone()),
            remote_candidates: state.remote_candidates.clone(),
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn offer_sdp(&self, version: u32) -> String {
        format!(
            "v=0\r\no=mock-{id} {version} 1 IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:{id}\r\na=setup:actpass\r\n",
            id = self.id
        )
    }

    /// Answers are a pure function of the offer they reply to.
    fn answer_sdp(&self, offer: &SessionDescription) -> String {
        let origin = offer
            .sdp
            .lines()
            .find(|line| line.starts_with("o="))
            .unwrap_or("o=-");
        format!(
            "v=0\r\no=mock-{id} 0 1 IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:{id}\r\na=setup:active\r\na=x-answers:{origin}\r\n",
            id = self.id
        )
    }

    fn transition(&self, state: &mut MockState, next: SignalingState) {
        if state.signaling != next {
            debug!(peer = %self.id, from = %state.signaling, to = %next, "signaling state change");
            state.signaling = next;
            self.emit(PeerEvent::SignalingStateChange(next));
        }
    }

    fn apply_local(
        &self,
        state: &mut MockState,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let current = state.signaling;
        let invalid = move |operation: &'static str| TransportError::InvalidState {
            state: current,
            operation,
        };
        match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.pending_local = Some(description);
                self.transition(state, SignalingState::HaveLocalOffer);
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                state.current_local = Some(description);
                state.pending_local = None;
                state.current_remote = state.pending_remote.take();
                self.transition(state, SignalingState::Stable);
            }
            (SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                state.pending_local = Some(description);
                self.transition(state, SignalingState::HaveLocalPranswer);
            }
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                state.pending_local = None;
                self.transition(state, SignalingState::Stable);
            }
            (SdpType::Offer, _) => return Err(invalid("set local offer")),
            (SdpType::Answer, _) => return Err(invalid("set local answer")),
            (SdpType::Pranswer, _) => return Err(invalid("set local pranswer")),
            (SdpType::Rollback, _) => return Err(invalid("rollback local description")),
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                state.offers_created += 1;
                Ok(SessionDescription::offer(self.offer_sdp(state.offers_created)))
            }
            other => Err(TransportError::InvalidState {
                state: other,
                operation: "create offer",
            }),
        }
    }

    async fn set_local_description(
        &self,
        description: Option<SessionDescription>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let description = match description {
            Some(description) => description,
            None => match state.signaling {
                SignalingState::HaveRemoteOffer => {
                    let offer = state
                        .pending_remote
                        .clone()
                        .ok_or(TransportError::Other("remote offer missing".into()))?;
                    SessionDescription::answer(self.answer_sdp(&offer))
                }
                SignalingState::Stable | SignalingState::HaveLocalOffer => {
                    state.offers_created += 1;
                    SessionDescription::offer(self.offer_sdp(state.offers_created))
                }
                other => {
                    return Err(TransportError::InvalidState {
                        state: other,
                        operation: "set implicit local description",
                    })
                }
            },
        };
        self.apply_local(&mut state, description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                debug!(peer = %self.id, "rolling back local offer for remote offer");
                state.pending_local = None;
                self.transition(&mut state, SignalingState::Stable);
                state.pending_remote = Some(description);
                self.transition(&mut state, SignalingState::HaveRemoteOffer);
            }
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                state.pending_remote = Some(description);
                self.transition(&mut state, SignalingState::HaveRemoteOffer);
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer) => {
                state.current_remote = Some(description);
                state.pending_remote = None;
                state.current_local = state.pending_local.take();
                self.transition(&mut state, SignalingState::Stable);
            }
            (SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                state.pending_remote = Some(description);
                self.transition(&mut state, SignalingState::HaveRemotePranswer);
            }
            (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                state.pending_remote = None;
                self.transition(&mut state, SignalingState::Stable);
            }
            (sdp_type, current) => {
                return Err(TransportError::InvalidState {
                    state: current,
                    operation: match sdp_type {
                        SdpType::Offer => "set remote offer",
                        SdpType::Answer => "set remote answer",
                        SdpType::Pranswer => "set remote pranswer",
                        SdpType::Rollback => "rollback remote description",
                    },
                })
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let remote_ufrag = state
            .pending_remote
            .as_ref()
            .or(state.current_remote.as_ref())
            .map(|remote| remote.ice_ufrag().map(str::to_string));
        match (remote_ufrag, candidate.username_fragment.as_deref()) {
            (None, _) => Err(TransportError::CandidateRejected(
                "no remote description".into(),
            )),
            (Some(Some(expected)), Some(ufrag)) if expected != ufrag => {
                Err(TransportError::CandidateRejected(format!(
                    "ufrag {ufrag} does not match remote {expected}"
                )))
            }
            _ => {
                state.remote_candidates.push(candidate);
                Ok(())
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransportError> {
        self.events_rx.lock().take().ok_or(TransportError::EventsTaken)
    }
}
