//! Glare-free offer/answer negotiation over a [`PeerTransport`].
//!
//! Exactly one side of a session is impolite. When both sides offer at once,
//! the impolite side drops the incoming offer and keeps its own, while the
//! polite side lets its transport roll back and answers.

use std::sync::Arc;

use signal_proto::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{SignalSink, SignalingClient, SignalingError};
use crate::politeness::{Politeness, PolitenessMode};
use crate::transport::{PeerEvent, PeerTransport, SignalingState, TransportError};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("transport has no local description to send")]
    MissingLocalDescription,
}

pub struct Negotiator {
    peer: Arc<dyn PeerTransport>,
    signals: Arc<dyn SignalSink>,
    politeness: Arc<Politeness>,
    making_offer: bool,
    ignore_offer: bool,
    setting_remote_answer_pending: bool,
}

impl Negotiator {
    pub fn new(
        peer: Arc<dyn PeerTransport>,
        signals: Arc<dyn SignalSink>,
        politeness: Arc<Politeness>,
    ) -> Self {
        Self {
            peer,
            signals,
            politeness,
            making_offer: false,
            ignore_offer: false,
            setting_remote_answer_pending: false,
        }
    }

    pub fn politeness(&self) -> &Arc<Politeness> {
        &self.politeness
    }

    /// Whether the last remote offer was dropped as a collision.
    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    /// Creates an offer, applies it locally and sends it to the relay.
    pub async fn handle_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        info!("negotiation needed");
        self.making_offer = true;
        let result = self.send_offer().await;
        self.making_offer = false;
        result
    }

    async fn send_offer(&self) -> Result<(), NegotiationError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(Some(offer)).await?;
        self.send_local_description().await
    }

    async fn send_local_description(&self) -> Result<(), NegotiationError> {
        let local = self
            .peer
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        debug!(sdp_type = %local.sdp_type, "sending local description");
        self.signals
            .send_signal(SignalingMessage::description(local))
            .await?;
        Ok(())
    }

    pub async fn handle_signaling_message(
        &mut self,
        message: SignalingMessage,
    ) -> Result<(), NegotiationError> {
        if let Some(description) = message.description {
            self.handle_description(description).await
        } else if let Some(candidate) = message.candidate {
            self.handle_candidate(candidate).await
        } else if let Some(control) = message.control {
            if let Some(polite) = control.polite {
                self.politeness.assign(polite);
            }
            info!(
                connection_id = ?control.connection_id,
                members = ?control.member_ids(),
                "session roster updated"
            );
            Ok(())
        } else {
            debug!("ignoring empty signaling message");
            Ok(())
        }
    }

    async fn handle_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let polite = self.politeness.get();
        let state = self.peer.signaling_state();
        let ready_for_offer = !self.making_offer
            && (state == SignalingState::Stable || self.setting_remote_answer_pending);
        let offer_collision = description.is_offer() && !ready_for_offer;

        self.ignore_offer = !polite && offer_collision;
        if self.ignore_offer {
            info!(%state, "ignoring colliding remote offer");
            return Ok(());
        }
        if offer_collision {
            info!(%state, "yielding to colliding remote offer");
        }

        let sdp_type = description.sdp_type;
        self.setting_remote_answer_pending = sdp_type == SdpType::Answer;
        let applied = self.peer.set_remote_description(description).await;
        self.setting_remote_answer_pending = false;
        applied?;

        if sdp_type == SdpType::Offer {
            self.peer.set_local_description(None).await?;
            self.send_local_description().await?;
        }
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        match self.peer.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) if self.ignore_offer => {
                debug!(error = %err, "dropping candidate for ignored offer");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), NegotiationError> {
        match event {
            PeerEvent::NegotiationNeeded => self.handle_negotiation_needed().await,
            PeerEvent::IceCandidate(Some(candidate)) => {
                debug!(candidate = %candidate.candidate, "found local candidate");
                self.signals
                    .send_signal(SignalingMessage::candidate(candidate))
                    .await?;
                Ok(())
            }
            PeerEvent::IceCandidate(None) => {
                info!("candidate gathering concluded");
                Ok(())
            }
            PeerEvent::SignalingStateChange(state) => {
                info!(%state, "signaling state changed");
                Ok(())
            }
            PeerEvent::ConnectionStateChange(state) => {
                info!(%state, "connection state changed");
                Ok(())
            }
        }
    }

    /// Processes peer events and remote messages one at a time until either
    /// stream ends. A failed step is logged and the loop keeps going.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        loop {
            let result = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => break,
                },
                message = inbound.recv() => match message {
                    Some(message) => self.handle_signaling_message(message).await,
                    None => break,
                },
            };
            if let Err(err) = result {
                error!(error = %err, "negotiation step failed");
            }
        }
        debug!("negotiation loop stopped");
    }

    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> NegotiationHandle {
        let politeness = Arc::clone(&self.politeness);
        NegotiationHandle {
            task: tokio::spawn(self.run(events, inbound)),
            politeness,
        }
    }
}

/// Owns a running negotiation loop. Dropping it stops negotiation; the peer
/// transport and signaling client stay open.
pub struct NegotiationHandle {
    task: JoinHandle<()>,
    politeness: Arc<Politeness>,
}

impl NegotiationHandle {
    pub fn politeness(&self) -> Option<bool> {
        self.politeness.peek()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for NegotiationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wires a peer transport to a signaling client.
pub struct PerfectNegotiation;

impl PerfectNegotiation {
    /// Registers the signaling observers and starts the negotiation loop.
    /// Call before connecting so the first relay message is observed.
    pub fn start(
        peer: Arc<dyn PeerTransport>,
        client: &SignalingClient,
        mode: PolitenessMode,
    ) -> Result<NegotiationHandle, NegotiationError> {
        let events = peer.subscribe()?;
        let politeness = Arc::new(Politeness::new(mode));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        if mode == PolitenessMode::ServerAssigned {
            let politeness = Arc::clone(&politeness);
            client.on_connect(move |message| {
                match message.control.as_ref().and_then(|control| control.polite) {
                    Some(polite) => {
                        politeness.assign(polite);
                    }
                    None => warn!("first relay message carried no politeness"),
                }
            });
        }
        client.on_message(move |message| {
            let _ = inbound_tx.send(message.clone());
        });

        let negotiator = Negotiator::new(peer, Arc::new(client.clone()), politeness);
        Ok(negotiator.spawn(events, inbound_rx))
    }
}
