//! Cooperative cancellation for pipeline runs
//!
//! Cancellation is best-effort, not guaranteed termination: the local
//! processor kills its child process, the remote processor tears down the
//! command channel and resets the connection, and virtual functions are
//! dropped at their next await point.

use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation token threaded through `run`/`exec` calls
///
/// Cloning is cheap; all clones observe the same signal. The default token
/// never fires.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation to every holder of this token
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation has been signalled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first, so a token cancelled
        // before this call resolves immediately
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
