//! Relay shutdown: one token shared by the listener and every socket.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancellation shared by the listener, upgrade handlers and sessions.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun; new upgrades are refused from then on.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown and wait up to `timeout` for the listener task.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn drain(&self, mut listener: JoinHandle<()>, timeout: Duration) -> bool {
        self.shutdown();
        info!(timeout_ms = timeout.as_millis(), "draining listener");

        if tokio::time::timeout(timeout, &mut listener).await.is_ok() {
            return true;
        }
        warn!(?timeout, "listener did not drain, aborting");
        listener.abort();
        false
    }
}
