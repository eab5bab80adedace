/// Sync event broadcast.
pub mod events;
/// Autosave scheduler.
pub mod scheduler;
/// Session clock.
pub mod session_clock;
/// Session timeout state machine.
pub mod session_timeout;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{dao::progress_store::ProgressStore, error::ServiceError};

pub use self::events::{SyncEvent, SyncEventHub};
pub use self::scheduler::{FlushOutcome, SchedulerHandle, SchedulerState};
pub use self::session_clock::SessionClock;
pub use self::session_timeout::{ActivityKind, SessionTimeoutHandle, SessionTimerState};

/// Server state shared by every handler.
pub type SharedState = Arc<AppState>;

/// Server state: the installed progress store and the degraded flag derived from it.
pub struct AppState {
    progress_store: RwLock<Option<Arc<dyn ProgressStore>>>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The server starts in degraded mode until a store is installed.
    pub fn new() -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            progress_store: RwLock::new(None),
            degraded: degraded_tx,
        })
    }

    /// Construct a state with `store` already installed.
    pub fn with_store(store: Arc<dyn ProgressStore>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            progress_store: RwLock::new(Some(store)),
            degraded: degraded_tx,
        })
    }

    /// Obtain a handle to the current progress store, if one is installed.
    pub async fn progress_store(&self) -> Option<Arc<dyn ProgressStore>> {
        let guard = self.progress_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current store or [`ServiceError::Degraded`].
    pub async fn require_progress_store(&self) -> Result<Arc<dyn ProgressStore>, ServiceError> {
        self.progress_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new store implementation and leave degraded mode.
    pub async fn install_progress_store(&self, store: Arc<dyn ProgressStore>) {
        {
            let mut guard = self.progress_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_progress_store(&self) {
        {
            let mut guard = self.progress_store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::progress_store::MemoryProgressStore;

    #[tokio::test]
    async fn installing_a_store_leaves_degraded_mode() {
        let state = AppState::new();
        let mut watcher = state.degraded_watcher();
        assert!(state.is_degraded());
        assert!(matches!(
            state.require_progress_store().await,
            Err(ServiceError::Degraded)
        ));

        state
            .install_progress_store(Arc::new(MemoryProgressStore::new()))
            .await;
        assert!(!state.is_degraded());
        assert!(watcher.has_changed().unwrap());
        assert!(!*watcher.borrow_and_update());
        assert!(state.require_progress_store().await.is_ok());

        state.clear_progress_store().await;
        assert!(state.is_degraded());
        assert!(state.progress_store().await.is_none());
    }
}
