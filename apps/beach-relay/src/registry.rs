use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use signal_proto::SessionSummary;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::connection::ConnectionHandle;
use crate::session::{Membership, Session, SessionError};

/// Name-keyed directory of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(name).cloned()
    }

    /// Returns the live session for `name`, creating it when absent or retired.
    pub fn get_or_create(&self, name: &str) -> Arc<Session> {
        let mut sessions = self.inner.sessions.lock();
        if let Some(existing) = sessions.get(name) {
            if !existing.is_retired() {
                return Arc::clone(existing);
            }
        }
        let session = Session::spawn(name, &self.inner.config);
        sessions.insert(name.to_string(), Arc::clone(&session));
        counter!("signaling_sessions_total", 1);
        gauge!("signaling_active_sessions", sessions.len() as f64);
        info!(session = %name, "session created");
        session
    }

    /// Joins `name`, retrying against a fresh session if the one found was
    /// retired between lookup and join.
    pub fn join(&self, name: &str, handle: Arc<ConnectionHandle>) -> (Arc<Session>, Membership) {
        loop {
            let session = self.get_or_create(name);
            match session.join(Arc::clone(&handle)) {
                Ok(membership) => return (session, membership),
                Err(SessionError::Retired) | Err(SessionError::Closed) => {
                    debug!(session = %name, "session retired during join; retrying");
                    self.remove_if_current(&session);
                }
            }
        }
    }

    /// Leaves `session` and drops it from the registry once empty.
    pub fn leave(&self, session: &Arc<Session>, member_id: u64) {
        if session.leave(member_id) == 0 {
            self.remove_if_current(session);
        }
    }

    /// Removes the entry only if it still refers to this exact session.
    fn remove_if_current(&self, session: &Arc<Session>) {
        let mut sessions = self.inner.sessions.lock();
        let current = sessions
            .get(session.name())
            .is_some_and(|entry| Arc::ptr_eq(entry, session));
        if current && session.is_retired() {
            sessions.remove(session.name());
            gauge!("signaling_active_sessions", sessions.len() as f64);
            info!(session = %session.name(), "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions ordered by name.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> =
            sessions.iter().map(|session| session.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Closes every connection of every session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        info!(sessions = sessions.len(), "closing all sessions");
        join_all(sessions.iter().map(|session| session.close())).await;
    }
}
