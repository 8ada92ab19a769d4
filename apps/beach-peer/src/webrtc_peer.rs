//! `PeerTransport` over a webrtc-rs `RTCPeerConnection`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use perfect_negotiation::{PeerEvent, PeerTransport, SignalingState, TransportError};
use signal_proto::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl WebRtcPeer {
    /// Builds a peer connection using `ice_urls` as STUN/TURN servers and
    /// wires its callbacks into the event stream returned by `subscribe`.
    pub async fn new(ice_urls: Vec<String>) -> Result<Self, webrtc::Error> {
        let api = APIBuilder::new().build();
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                info!("negotiation needed");
                let _ = tx.send(PeerEvent::NegotiationNeeded);
            })
        }));

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            info!(candidate = %init.candidate, "found new candidate");
                            Some(from_rtc_candidate(init))
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to encode local candidate");
                            return;
                        }
                    },
                    None => {
                        info!("candidate gathering concluded");
                        None
                    }
                };
                let _ = tx.send(PeerEvent::IceCandidate(candidate));
            })
        }));

        let tx = events_tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let tx = tx.clone();
            Box::pin(async move {
                let state = from_rtc_state(state);
                info!(%state, "signaling state has changed");
                let _ = tx.send(PeerEvent::SignalingStateChange(state));
            })
        }));

        let tx = events_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(%state, "connection state has changed");
                let _ = tx.send(PeerEvent::ConnectionStateChange(state.to_string()));
            })
        }));

        Ok(Self {
            pc,
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub async fn close(&self) -> Result<(), webrtc::Error> {
        self.pc.close().await
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        // An empty body is rejected before the rollback type is looked at.
        let sdp = self
            .pc
            .pending_local_description()
            .await
            .map(|description| description.sdp)
            .unwrap_or_default();
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = sdp;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_error)?;
        from_rtc_description(offer).ok_or_else(|| TransportError::Other("created offer has no type".into()))
    }

    async fn set_local_description(
        &self,
        description: Option<SessionDescription>,
    ) -> Result<(), TransportError> {
        let description = match description {
            Some(description) => to_rtc_description(description)?,
            None => match self.pc.signaling_state() {
                RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                    self.pc.create_answer(None).await.map_err(transport_error)?
                }
                RTCSignalingState::Closed => return Err(TransportError::Closed),
                _ => self.pc.create_offer(None).await.map_err(transport_error)?,
            },
        };
        self.pc
            .set_local_description(description)
            .await
            .map_err(transport_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if description.is_offer() && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            debug!("rolling back local offer before applying remote offer");
            self.rollback().await?;
        }
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(transport_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| TransportError::CandidateRejected(err.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    fn signaling_state(&self) -> SignalingState {
        from_rtc_state(self.pc.signaling_state())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransportError> {
        self.events.lock().take().ok_or(TransportError::EventsTaken)
    }
}

fn transport_error(err: webrtc::Error) -> TransportError {
    match err {
        webrtc::Error::ErrConnectionClosed => TransportError::Closed,
        other => TransportError::Other(other.to_string()),
    }
}

fn from_rtc_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            return Ok(rollback);
        }
    };
    parsed.map_err(transport_error)
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
