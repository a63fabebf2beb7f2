use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Background tasks owned by one call. Every task gets a child token of the
/// group, so it can be cancelled alone or together with the rest.
#[derive(Clone, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` in the current span. The returned token cancels it.
    ///
    /// A cancelled task stops at its next await point and is dropped quietly.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> CancellationToken
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let cancelled = token.clone();
        self.tracker.spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => {
                        tracing::debug!(task = name, "Background task cancelled");
                    }
                    _ = fut => {}
                }
            }
            .in_current_span(),
        );
        token
    }

    /// Cancel every task and wait until all of them have finished.
    pub async fn cancel_all(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
