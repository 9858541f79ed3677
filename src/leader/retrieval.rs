use super::{LeaderAddress, LeaderRetrievalError, LeaderRetrievalListener, LeaderRetrievalService};
use parking_lot::Mutex;
use std::sync::Arc;

/// Retrieval service driven by explicit calls, for static deployments and
/// for embedders that learn about leaders through their own channel. The
/// latest address is replayed to a listener when it starts.
#[derive(Default)]
pub struct SettableLeaderRetrieval {
    state: Mutex<SettableState>,
}

#[derive(Default)]
struct SettableState {
    listener: Option<Arc<dyn LeaderRetrievalListener>>,
    latest: Option<LeaderAddress>,
}

impl SettableLeaderRetrieval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leader(leader: LeaderAddress) -> Self {
        let retrieval = Self::default();
        retrieval.state.lock().latest = Some(leader);
        retrieval
    }

    pub fn notify(&self, leader: LeaderAddress) {
        let listener = {
            let mut state = self.state.lock();
            state.latest = Some(leader.clone());
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.notify_leader_address(leader);
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let listener = self.state.lock().listener.clone();
        if let Some(listener) = listener {
            listener.handle_error(LeaderRetrievalError::Failed(reason.into()));
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().listener.is_some()
    }
}

impl LeaderRetrievalService for SettableLeaderRetrieval {
    fn start(
        &self,
        listener: Arc<dyn LeaderRetrievalListener>,
    ) -> Result<(), LeaderRetrievalError> {
        let latest = {
            let mut state = self.state.lock();
            if state.listener.is_some() {
                return Err(LeaderRetrievalError::AlreadyStarted);
            }
            state.listener = Some(listener.clone());
            state.latest.clone()
        };
        if let Some(leader) = latest {
            listener.notify_leader_address(leader);
        }
        Ok(())
    }

    /// Detaches the listener. The service can be started again afterwards.
    fn stop(&self) {
        self.state.lock().listener = None;
    }
}
