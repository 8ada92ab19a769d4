use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use signal_proto::{
    ControlMessage, MessageKind, SessionSummary, SignalingMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::ConnectionHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has been retired")]
    Retired,
    #[error("session routing task has stopped")]
    Closed,
}

/// A message read from one member, queued for fan-out to the others.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub sender: u64,
    pub message: SignalingMessage,
}

/// Result of joining a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub member_id: u64,
    pub polite: bool,
}

struct Member {
    handle: Arc<ConnectionHandle>,
    polite: bool,
}

#[derive(Default)]
struct Members {
    next_id: u64,
    entries: BTreeMap<u64, Member>,
    retired: bool,
}

/// Hub of one named session: membership, politeness assignment and routing.
pub struct Session {
    name: String,
    created: DateTime<Utc>,
    inbound: mpsc::Sender<RoutedMessage>,
    members: Mutex<Members>,
    retired: CancellationToken,
}

impl Session {
    /// Creates the session and starts its routing task.
    pub fn spawn(name: impl Into<String>, config: &SessionConfig) -> Arc<Self> {
        let (inbound, rx) = mpsc::channel(config.inbound_buffer);
        let session = Arc::new(Self {
            name: name.into(),
            created: Utc::now(),
            inbound,
            members: Mutex::new(Members::default()),
            retired: CancellationToken::new(),
        });
        tokio::spawn(route_loop(Arc::clone(&session), rx));
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn is_retired(&self) -> bool {
        self.members.lock().retired
    }

    pub fn len(&self) -> usize {
        self.members.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn member_handle(&self, member_id: u64) -> Option<Arc<ConnectionHandle>> {
        self.members
            .lock()
            .entries
            .get(&member_id)
            .map(|member| Arc::clone(&member.handle))
    }

    /// Adds a connection. It is polite exactly when an impolite member is
    /// already present, and every member receives the updated roster.
    pub fn join(&self, handle: Arc<ConnectionHandle>) -> Result<Membership, SessionError> {
        let mut members = self.members.lock();
        if members.retired {
            return Err(SessionError::Retired);
        }
        let member_id = members.next_id;
        members.next_id += 1;
        let polite = members.entries.values().any(|member| !member.polite);
        members.entries.insert(member_id, Member { handle, polite });
        info!(session = %self.name, member_id, polite, "member joined");
        self.broadcast_control(&members);
        Ok(Membership { member_id, polite })
    }

    /// Removes a member and returns how many remain. The last leave retires
    /// the session; otherwise the survivors receive the shrunken roster.
    pub fn leave(&self, member_id: u64) -> usize {
        let mut members = self.members.lock();
        if members.entries.remove(&member_id).is_none() {
            return members.entries.len();
        }
        let remaining = members.entries.len();
        info!(session = %self.name, member_id, remaining, "member left");
        if remaining == 0 {
            members.retired = true;
            self.retired.cancel();
        } else {
            self.broadcast_control(&members);
        }
        remaining
    }

    /// Queues a message for delivery to every member except its sender.
    pub async fn route(&self, routed: RoutedMessage) -> Result<(), SessionError> {
        if self.retired.is_cancelled() {
            return Err(SessionError::Retired);
        }
        self.inbound
            .send(routed)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn summary(&self) -> SessionSummary {
        let members = self.members.lock();
        SessionSummary {
            name: self.name.clone(),
            created: self.created,
            connections: members
                .entries
                .iter()
                .map(|(id, member)| member.handle.info(*id))
                .collect(),
        }
    }

    /// Closes every member connection and waits for them to finish.
    pub async fn close(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .members
            .lock()
            .entries
            .values()
            .map(|member| Arc::clone(&member.handle))
            .collect();
        join_all(handles.iter().map(|handle| async move {
            if let Err(err) = handle.close().await {
                debug!(remote = %handle.meta().remote, error = %err, "close skipped");
            }
        }))
        .await;
    }

    fn broadcast_control(&self, members: &Members) {
        let roster: Vec<_> = members
            .entries
            .iter()
            .map(|(id, member)| member.handle.info(*id))
            .collect();
        for (id, member) in &members.entries {
            let control = SignalingMessage::control(ControlMessage {
                polite: Some(member.polite),
                connection_id: Some(*id),
                connections: Some(roster.clone()),
            });
            let frame = match control.to_json() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(session = %self.name, member_id = id, error = %err, "failed to encode control message");
                    continue;
                }
            };
            if let Err(err) = member.handle.try_send(frame) {
                counter!("signaling_control_delivery_failures_total", 1);
                warn!(session = %self.name, member_id = id, error = %err, "failed to deliver control message");
            }
        }
    }
}

async fn route_loop(session: Arc<Session>, mut rx: mpsc::Receiver<RoutedMessage>) {
    loop {
        let routed = tokio::select! {
            _ = session.retired.cancelled() => break,
            routed = rx.recv() => match routed {
                Some(routed) => routed,
                None => break,
            },
        };
        deliver(&session, routed).await;
    }
    debug!(session = %session.name, "routing task stopped");
}

async fn deliver(session: &Session, routed: RoutedMessage) {
    let RoutedMessage { sender, message } = routed;
    record_message(&message);

    let frame = match message.to_json() {
        Ok(frame) => frame,
        Err(err) => {
            warn!(session = %session.name, sender, error = %err, "failed to encode signaling message");
            return;
        }
    };

    let targets: Vec<(u64, Arc<ConnectionHandle>)> = session
        .members
        .lock()
        .entries
        .iter()
        .filter(|(id, _)| **id != sender)
        .map(|(id, member)| (*id, Arc::clone(&member.handle)))
        .collect();

    for (id, handle) in targets {
        if let Err(err) = handle.send(frame.clone()).await {
            debug!(session = %session.name, member_id = id, error = %err, "skipping member");
        }
    }
}

fn record_message(message: &SignalingMessage) {
    let Ok(kind) = message.kind() else {
        return;
    };
    counter!("signaling_messages_total", 1, "kind" => kind.as_str());
    if kind == MessageKind::Candidate {
        if let Some(candidate) = &message.candidate {
            counter!(
                "signaling_candidates_total",
                1,
                "type" => candidate.candidate_type().unwrap_or("unknown").to_string(),
                "protocol" => candidate.protocol().unwrap_or_else(|| "unknown".to_string()),
                "tcp_type" => candidate.tcp_type().unwrap_or("").to_string()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionMeta;
    use signal_proto::IceCandidate;

    fn handle() -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
        ConnectionHandle::new(
            ConnectionMeta::new("127.0.0.1:9", "test"),
            &ConnectionConfig::default(),
        )
    }

    fn control(rx: &mut mpsc::Receiver<String>) -> ControlMessage {
        let frame = rx.try_recv().expect("control frame queued");
        SignalingMessage::from_json(&frame)
            .unwrap()
            .control
            .expect("control payload")
    }

    #[test_timeout::tokio_timeout_test]
    async fn first_member_is_impolite_and_second_is_polite() {
        let session = Session::spawn("room", &SessionConfig::default());
        let (a, mut a_rx) = handle();
        let (b, mut b_rx) = handle();

        let first = session.join(a).unwrap();
        assert_eq!(first, Membership { member_id: 0, polite: false });
        let a_control = control(&mut a_rx);
        assert_eq!(a_control.polite, Some(false));
        assert_eq!(a_control.member_ids(), vec![0]);

        let second = session.join(b).unwrap();
        assert_eq!(second, Membership { member_id: 1, polite: true });
        let a_control = control(&mut a_rx);
        let b_control = control(&mut b_rx);
        assert_eq!(a_control.connection_id, Some(0));
        assert_eq!(a_control.polite, Some(false));
        assert_eq!(b_control.connection_id, Some(1));
        assert_eq!(b_control.polite, Some(true));
        assert_eq!(a_control.member_ids(), vec![0, 1]);
        assert_eq!(b_control.member_ids(), vec![0, 1]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn ids_are_not_reused_and_politeness_follows_survivors() {
        let session = Session::spawn("room", &SessionConfig::default());
        let (a, _a_rx) = handle();
        let (b, _b_rx) = handle();
        let (c, _c_rx) = handle();

        session.join(a).unwrap();
        session.join(b).unwrap();
        assert_eq!(session.leave(0), 1);

        // Only a polite member remains, so the newcomer is impolite.
        let third = session.join(c).unwrap();
        assert_eq!(third, Membership { member_id: 2, polite: false });
    }

    #[test_timeout::tokio_timeout_test]
    async fn messages_reach_everyone_but_the_sender() {
        let session = Session::spawn("room", &SessionConfig::default());
        let (a, mut a_rx) = handle();
        let (b, mut b_rx) = handle();
        let (c, mut c_rx) = handle();
        session.join(a).unwrap();
        session.join(b).unwrap();
        session.join(c).unwrap();
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}
        while c_rx.try_recv().is_ok() {}

        let message = SignalingMessage::candidate(IceCandidate::new(
            "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
        ));
        session
            .route(RoutedMessage {
                sender: 1,
                message: message.clone(),
            })
            .await
            .unwrap();

        let a_frame = a_rx.recv().await.unwrap();
        let c_frame = c_rx.recv().await.unwrap();
        assert_eq!(SignalingMessage::from_json(&a_frame).unwrap(), message);
        assert_eq!(SignalingMessage::from_json(&c_frame).unwrap(), message);
        tokio::task::yield_now().await;
        assert!(b_rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn last_leave_retires_the_session() {
        let session = Session::spawn("room", &SessionConfig::default());
        let (a, _a_rx) = handle();
        let (late, _late_rx) = handle();
        session.join(a).unwrap();

        assert_eq!(session.leave(0), 0);
        assert!(session.is_retired());
        assert_eq!(session.join(late).unwrap_err(), SessionError::Retired);
        let refused = session
            .route(RoutedMessage {
                sender: 0,
                message: SignalingMessage::default(),
            })
            .await;
        assert_eq!(refused, Err(SessionError::Retired));
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_member_queue_does_not_block_roster_updates() {
        let session = Session::spawn("room", &SessionConfig::default());
        let config = ConnectionConfig {
            outbound_buffer: 1,
            ..ConnectionConfig::default()
        };
        let (a, mut a_rx) = ConnectionHandle::new(ConnectionMeta::new("a", "test"), &config);
        let (b, mut b_rx) = handle();
        let (c, _c_rx) = handle();

        session.join(a).unwrap();
        // a's single slot now holds its first roster; later ones are dropped.
        session.join(b).unwrap();
        session.join(c).unwrap();

        assert_eq!(control(&mut a_rx).member_ids(), vec![0]);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(control(&mut b_rx).member_ids(), vec![0, 1]);
        assert_eq!(control(&mut b_rx).member_ids(), vec![0, 1, 2]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn summary_lists_members_in_id_order() {
        let session = Session::spawn("lobby", &SessionConfig::default());
        let (a, _a_rx) = handle();
        let (b, _b_rx) = handle();
        session.join(a).unwrap();
        session.join(b).unwrap();

        let summary = session.summary();
        assert_eq!(summary.name, "lobby");
        let ids: Vec<u64> = summary.connections.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
