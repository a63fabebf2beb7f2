use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::livekit::LiveKitApi;
use crate::session::AgentSession;

/// The room and platform access for one call job.
pub struct JobContext {
    pub room_name: String,
    pub job_id: String,
    pub api: Arc<dyn LiveKitApi>,
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(room_name: String, job_id: String, api: Arc<dyn LiveKitApi>) -> Self {
        Self {
            room_name,
            job_id,
            api,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ask the job to wind down. Finalization runs once the runner notices.
    pub fn shutdown(&self, reason: &str) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(reason, "Job shutdown requested");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// What a component needs to end the call on its own.
#[derive(Clone)]
pub struct CallControl {
    pub job: Arc<JobContext>,
    pub session: Arc<dyn AgentSession>,
}

impl CallControl {
    pub fn new(job: Arc<JobContext>, session: Arc<dyn AgentSession>) -> Self {
        Self { job, session }
    }

    /// End the call: delete the room, stop the job, stop the session.
    ///
    /// Each step runs even when an earlier one failed. With `strict` the
    /// session is torn down without letting queued speech finish.
    pub async fn hangup(&self, reason: &str, strict: bool) {
        tracing::info!(reason, strict, "Hangup initiated");

        if let Err(e) = self.job.api.delete_room(&self.job.room_name).await {
            tracing::error!(room = %self.job.room_name, "Failed to delete room during hangup: {e}");
        }
        self.job.shutdown(reason);
        self.session.shutdown(!strict);
    }
}
