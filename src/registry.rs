use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::call::hangup::JobContext;

/// A call job currently running in this process.
#[derive(Clone)]
pub struct ActiveCall {
    pub job_id: String,
    pub destination: Option<String>,
    pub started_at: DateTime<Utc>,
    job: Arc<JobContext>,
}

impl ActiveCall {
    pub fn new(job: Arc<JobContext>, destination: Option<String>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            destination,
            started_at: Utc::now(),
            job,
        }
    }
}

/// Registry of active calls, keyed by room name.
///
/// Lets the server refuse a second job for a busy room and ask every job
/// to wind down on shutdown.
#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<Mutex<HashMap<String, ActiveCall>>>,
    drained: Arc<Notify>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Returns false if the room already has one.
    pub async fn register(&self, room: String, call: ActiveCall) -> bool {
        let mut calls = self.inner.lock().await;
        if calls.contains_key(&room) {
            tracing::warn!(room = %room, "Room already has an active call");
            return false;
        }
        tracing::info!(
            room = %room,
            job_id = %call.job_id,
            destination = call.destination.as_deref().unwrap_or("-"),
            "Call registered"
        );
        calls.insert(room, call);
        true
    }

    /// Deregister a call when it ends.
    pub async fn deregister(&self, room: &str) {
        let mut calls = self.inner.lock().await;
        if calls.remove(room).is_some() {
            tracing::info!(room = %room, "Call deregistered");
        }
        if calls.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Ask every active job to shut down. Returns how many were signalled.
    pub async fn shutdown_all(&self, reason: &str) -> usize {
        let calls = self.inner.lock().await;
        for (room, call) in calls.iter() {
            tracing::info!(
                room = %room,
                job_id = %call.job_id,
                destination = call.destination.as_deref().unwrap_or("-"),
                active_secs = (Utc::now() - call.started_at).num_seconds(),
                "Stopping active call"
            );
            call.job.shutdown(reason);
        }
        calls.len()
    }

    /// Wait until no calls remain. Returns false on timeout.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.inner.lock().await.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
