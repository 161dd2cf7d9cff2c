//! Open/closed state shared between a handle and its callbacks

use std::sync::{Arc, Mutex, PoisonError};

/// Lifecycle of a connection or channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    /// Usable
    Open,
    /// A local close is in progress
    Closing,
    /// Closed locally or by the peer. Final
    Closed,
}

/// Shared lifecycle flag. Cloning shares the state.
#[derive(Clone, Debug)]
pub(crate) struct Liveness {
    #[doc(hidden)]
    state: Arc<Mutex<LinkState>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState::Open)),
        }
    }
}

impl Liveness {
    /// Whether the link can still be used
    pub fn is_open(&self) -> bool {
        *self.lock() == LinkState::Open
    }

    /// Move from open to closing. Returns false if another close
    /// already started or the link is closed
    pub fn begin_close(&self) -> bool {
        let mut state = self.lock();
        if *state == LinkState::Open {
            *state = LinkState::Closing;
            true
        } else {
            false
        }
    }

    /// Mark the link closed. Returns true only for the first caller
    pub fn mark_closed(&self) -> bool {
        let mut state = self.lock();
        let first = *state != LinkState::Closed;
        *state = LinkState::Closed;
        first
    }

    /// The state lock. A panic while holding it can't leave the
    /// state inconsistent
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
