//! One outbound call job, from dispatch metadata to the end-of-call report.
//!
//! Components share a [`SharedContext`] and a [`CallControl`]; every
//! background task they start lives in the call's [`TaskGroup`], which the
//! finalizer cancels as a unit.

pub mod duration;
pub mod hangup;
pub mod metrics;
pub mod outbound;
pub mod report;
pub mod tasks;
pub mod tools;
pub mod transcript;
pub mod transfer;
pub mod voicemail;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::context::{CallContext, SharedContext};
use crate::livekit::LiveKitApi;
use crate::registry::{ActiveCall, CallRegistry};
use crate::session::{
    resolve_session_config, SessionConnector, SessionEvent, SessionHandle, SessionStart,
};

use duration::{resolve_duration_settings, DurationMonitor, HttpOverride, OverrideSource};
use hangup::{CallControl, JobContext};
use metrics::MetricsLog;
use report::{CallRecord, ReportClient};
use tasks::TaskGroup;
use transcript::Transcript;
use voicemail::VoicemailArbitrator;

const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(8);

/// A dispatched job as handed to the runner.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    pub room_name: String,
    pub metadata: Option<String>,
}

/// Process-wide collaborators shared by every call job.
#[derive(Clone)]
pub struct CallRuntime {
    pub config: Arc<Config>,
    pub api: Arc<dyn LiveKitApi>,
    pub connector: Arc<dyn SessionConnector>,
    pub reporter: ReportClient,
    pub registry: CallRegistry,
}

/// Run one call job to completion inside a `call` span.
pub async fn run_call_job(runtime: CallRuntime, request: JobRequest) {
    let span = tracing::info_span!(
        "call",
        room = %request.room_name,
        job_id = %request.job_id
    );
    run(runtime, request).instrument(span).await
}

async fn run(runtime: CallRuntime, request: JobRequest) {
    let config = Arc::clone(&runtime.config);
    let job = Arc::new(JobContext::new(
        request.room_name.clone(),
        request.job_id.clone(),
        Arc::clone(&runtime.api),
    ));
    let ctx = SharedContext::new(CallContext::from_metadata(request.metadata.as_deref()));

    let destination = ctx.read(|c| c.text("destination"));
    let active = ActiveCall::new(Arc::clone(&job), destination);
    if !runtime.registry.register(request.room_name.clone(), active).await {
        return;
    }

    let mut record = CallRecord::new(ctx.clone());
    let session_config = ctx.read(|c| resolve_session_config(c, &config.models));
    tracing::info!(config = ?session_config, "Session configuration");
    record.session_config = Some(session_config.clone());

    let start = SessionStart {
        room: request.room_name.clone(),
        instructions: config.agent.instructions.clone(),
        config: session_config,
        tools: tools::tool_specs(),
    };
    record.session_start = Some(Utc::now());
    let session_started = Instant::now();

    let SessionHandle { session, events } = match runtime.connector.connect(start).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("Failed to start speech session: {e}");
            record.finalize(&job, &runtime.reporter).await;
            runtime.registry.deregister(&request.room_name).await;
            return;
        }
    };
    let control = CallControl::new(Arc::clone(&job), Arc::clone(&session));

    let arbitrator = VoicemailArbitrator::new(
        ctx.clone(),
        control.clone(),
        record.transcript.clone(),
        record.tasks.clone(),
    );
    arbitrator.start_silence_timer(
        Duration::try_from_secs_f64(config.voicemail.silence_timeout_secs)
            .unwrap_or(DEFAULT_SILENCE_TIMEOUT),
    );

    let router = EventRouter {
        arbitrator,
        transcript: record.transcript.clone(),
        metrics: record.metrics.clone(),
        tasks: record.tasks.clone(),
        ctx: ctx.clone(),
        control: control.clone(),
    };
    record.tasks.spawn("session-events", router.run(events));

    let settings = ctx.read(|c| resolve_duration_settings(c, &config.duration));
    // Written back even when it came from config, so the monitor and the
    // report both see the effective limit.
    ctx.update(|c| c.set_max_call_duration_seconds(settings.limit_secs));

    let connected_at =
        outbound::initiate_outbound_call(&job, &ctx, &config.sip, &config.egress).await;
    record.call_start = connected_at;

    if !job.is_shutting_down() {
        let monitor_start = if connected_at.is_some() {
            Instant::now()
        } else {
            session_started
        };
        let source = settings
            .override_url
            .as_deref()
            .map(|url| Arc::new(HttpOverride::new(url)) as Arc<dyn OverrideSource>);
        let monitor =
            DurationMonitor::new(ctx.clone(), control.clone(), source, settings.poll_interval);
        let limit = ctx.read(|c| c.max_call_duration_seconds());
        record.tasks.spawn("duration-monitor", async move {
            let exit = monitor.run(limit, monitor_start).await;
            tracing::debug!(?exit, "Call duration monitor finished");
        });
    }

    job.wait_for_shutdown().await;
    tracing::info!("Finalizing call");
    record.finalize(&job, &runtime.reporter).await;
    session.shutdown(true);
    runtime.registry.deregister(&request.room_name).await;
}

/// Fans session events out to the components that consume them.
struct EventRouter {
    arbitrator: Arc<VoicemailArbitrator>,
    transcript: Transcript,
    metrics: MetricsLog,
    tasks: TaskGroup,
    ctx: SharedContext,
    control: CallControl,
}

impl EventRouter {
    async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.route(event);
        }
        tracing::info!("Speech session event stream ended");
        self.control.job.shutdown("speech session ended");
    }

    /// Handlers never await; slow work goes to the task group.
    fn route(&self, event: SessionEvent) {
        match event {
            SessionEvent::UserInputTranscribed {
                transcript,
                is_final,
                language,
            } => self
                .arbitrator
                .on_user_transcribed(&transcript, is_final, language),
            SessionEvent::SpeechCreated { speech_id, source } => {
                if !self.arbitrator.is_decided() {
                    tracing::debug!(
                        %speech_id,
                        source = source.as_deref().unwrap_or("-"),
                        "Speech created"
                    );
                }
            }
            SessionEvent::ConversationItemAdded { item } => {
                if item.role != "assistant" {
                    return;
                }
                let text = item.text_content();
                if !text.is_empty() {
                    self.transcript.push_assistant(&text);
                }
            }
            SessionEvent::MetricsCollected { metrics } => self.metrics.collect(metrics),
            SessionEvent::FunctionToolCalled {
                call_id,
                name,
                arguments,
            } => {
                self.tasks.spawn(
                    "tool-call",
                    tools::handle_tool_call(
                        call_id,
                        name,
                        arguments,
                        self.ctx.clone(),
                        self.control.clone(),
                    ),
                );
            }
        }
    }
}
