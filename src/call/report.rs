use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::call::hangup::JobContext;
use crate::call::metrics::{MetricsEvent, MetricsLog, UsageSummary};
use crate::call::tasks::TaskGroup;
use crate::call::transcript::{ConversationLogEntry, Transcript};
use crate::config::ReportConfig;
use crate::context::{EgressState, SharedContext};
use crate::livekit::ApiError;
use crate::session::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report request failed: {0}")]
    Request(String),
    #[error("Report endpoint returned HTTP {0}")]
    Status(u16),
}

/// End-of-call payload posted to the workflow webhook.
#[derive(Debug, Serialize)]
pub struct CallReport {
    pub room_name: String,
    pub job_id: String,
    pub call_context: Map<String, Value>,
    pub usage_summary: UsageSummary,
    pub metrics: Vec<MetricsEvent>,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub session_duration_seconds: Option<f64>,
    pub call_start: Option<DateTime<Utc>>,
    pub call_end: Option<DateTime<Utc>>,
    pub call_duration_seconds: Option<f64>,
    pub session_config: Option<SessionConfig>,
    pub egress: Option<EgressState>,
    pub transcript: Vec<ConversationLogEntry>,
}

/// Posts reports to the configured webhook, if any.
#[derive(Clone)]
pub struct ReportClient {
    client: reqwest::Client,
    webhook_url: Option<String>,
    timeout: Duration,
}

impl ReportClient {
    pub fn new(config: &ReportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone().filter(|u| !u.is_empty()),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_url.is_some()
    }

    pub async fn send(&self, report: &CallReport) -> Result<(), ReportError> {
        let Some(ref url) = self.webhook_url else {
            return Ok(());
        };

        let resp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(report)
            .send()
            .await
            .map_err(|e| ReportError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// State gathered over one call, consumed by finalization.
pub struct CallRecord {
    pub ctx: SharedContext,
    pub transcript: Transcript,
    pub metrics: MetricsLog,
    pub tasks: TaskGroup,
    pub session_config: Option<SessionConfig>,
    pub session_start: Option<DateTime<Utc>>,
    pub call_start: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub fn new(ctx: SharedContext) -> Self {
        Self {
            ctx,
            transcript: Transcript::new(),
            metrics: MetricsLog::new(),
            tasks: TaskGroup::new(),
            session_config: None,
            session_start: None,
            call_start: None,
        }
    }

    /// Wind the call down and report it.
    ///
    /// Runs every step even when earlier ones fail: cancel background tasks,
    /// summarise usage, stop the recording, then deliver the report. Never
    /// returns an error.
    pub async fn finalize(self, job: &JobContext, reporter: &ReportClient) {
        self.tasks.cancel_all().await;

        let usage_summary = self.metrics.summary();
        tracing::info!(usage = ?usage_summary, "Call usage");
        let session_end = Utc::now();

        stop_recording(job, &self.ctx).await;

        if !reporter.is_configured() {
            tracing::debug!("N8N_WEBHOOK_URL not configured; skipping end-of-call report");
            return;
        }

        let (call_context, egress) = self.ctx.read(|c| (c.snapshot(), c.egress().cloned()));
        let report = CallReport {
            room_name: job.room_name.clone(),
            job_id: job.job_id.clone(),
            call_context,
            usage_summary,
            metrics: self.metrics.events(),
            session_start: self.session_start,
            session_end: Some(session_end),
            session_duration_seconds: seconds_between(self.session_start, session_end),
            call_start: self.call_start,
            call_end: Some(session_end),
            call_duration_seconds: seconds_between(self.call_start, session_end),
            session_config: self.session_config,
            egress,
            transcript: self.transcript.entries(),
        };

        match reporter.send(&report).await {
            Ok(()) => tracing::info!(
                entries = report.transcript.len(),
                "End-of-call report delivered"
            ),
            Err(e) => tracing::error!("Failed to send end-of-call report: {e}"),
        }
    }
}

async fn stop_recording(job: &JobContext, ctx: &SharedContext) {
    let Some(egress_id) = ctx.read(|c| {
        c.egress()
            .map(|e| e.egress_id.clone())
            .or_else(|| c.text("egress_id"))
            .filter(|id| !id.is_empty())
    }) else {
        return;
    };

    let result = job.api.stop_egress(&egress_id).await;
    ctx.update(|c| {
        if c.egress().is_none() {
            c.set_egress(EgressState {
                egress_id: egress_id.clone(),
                ..EgressState::default()
            });
        }
        let Some(egress) = c.egress_mut() else {
            return;
        };
        match result {
            Ok(ref info) => {
                egress.stopped_at = Some(Utc::now());
                if let Some(status) = info.status_text() {
                    egress.status = Some(status);
                }
                egress.error = info.error_text();
                egress.duration = info.duration();
                egress.results = Some(info.file_results.clone());
                tracing::info!(
                    %egress_id,
                    status = egress.status.as_deref().unwrap_or("-"),
                    error = egress.error.as_deref().unwrap_or("-"),
                    "Stopped call recording"
                );
            }
            Err(ref e) => {
                egress.error = Some(match e {
                    ApiError::Twirp { message, .. } => message.clone(),
                    other => other.to_string(),
                });
                tracing::error!(%egress_id, "Failed to stop egress: {e}");
            }
        }
    });
}

fn seconds_between(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<f64> {
    start.map(|s| (end - s).num_milliseconds() as f64 / 1000.0)
}
