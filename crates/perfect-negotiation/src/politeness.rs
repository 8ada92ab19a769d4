use std::sync::OnceLock;

use tracing::{info, warn};

/// Where a peer's politeness comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolitenessMode {
    /// Taken from the first relay control message that carries `polite`.
    #[default]
    ServerAssigned,
    /// Fixed by configuration; relay assignments are ignored.
    Static(bool),
}

/// Set-once politeness flag shared by the signaling observers and the
/// negotiation controller.
#[derive(Debug, Default)]
pub struct Politeness {
    value: OnceLock<bool>,
}

impl Politeness {
    pub fn new(mode: PolitenessMode) -> Self {
        let politeness = Self::default();
        if let PolitenessMode::Static(polite) = mode {
            let _ = politeness.value.set(polite);
        }
        politeness
    }

    /// Records a relay assignment. Returns false when a value was already
    /// fixed, warning if the new assignment disagrees.
    pub fn assign(&self, polite: bool) -> bool {
        match self.value.set(polite) {
            Ok(()) => {
                info!(polite, "politeness assigned");
                true
            }
            Err(_) => {
                if let Some(current) = self.value.get().filter(|current| **current != polite) {
                    warn!(
                        current = *current,
                        assigned = polite,
                        "ignoring politeness change after it was fixed"
                    );
                }
                false
            }
        }
    }

    /// Reads the flag, fixing it as impolite if nothing was assigned yet.
    pub fn get(&self) -> bool {
        *self.value.get_or_init(|| {
            warn!("no politeness assigned before negotiation; acting impolite");
            false
        })
    }

    /// Reads the flag without fixing it.
    pub fn peek(&self) -> Option<bool> {
        self.value.get().copied()
    }
}
