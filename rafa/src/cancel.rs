//! Cooperative cancellation shared between the executor, the agent process
//! watcher, and signal handlers.

use tokio_util::sync::CancellationToken;

/// Cloneable cancellation flag. All clones observe the same state.
///
/// Thin synchronous view over a [`CancellationToken`]; async callers can
/// await [`CancelToken::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`CancelToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
