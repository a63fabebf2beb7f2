use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::call::hangup::CallControl;
use crate::config::DurationConfig;
use crate::context::{
    coerce_non_negative_int, coerce_positive_float, value_text, CallContext, SharedContext,
};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const OVERRIDE_TIMEOUT: Duration = Duration::from_secs(5);
const LIMIT_REACHED_REASON: &str = "Maximum call duration reached";

/// Keys recognised in an override response, first match wins.
const OVERRIDE_KEYS: [&str; 4] = [
    "max_duration_seconds",
    "max_call_duration_seconds",
    "maxDurationSeconds",
    "maxCallDurationSeconds",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DurationSettings {
    /// Seconds; 0 disables enforcement.
    pub limit_secs: u64,
    pub override_url: Option<String>,
    pub poll_interval: Duration,
}

/// Duration settings from `session_options`, the top-level context and
/// the configured defaults.
pub fn resolve_duration_settings(ctx: &CallContext, cfg: &DurationConfig) -> DurationSettings {
    let limit_secs = ctx
        .session_option("max_call_duration_seconds")
        .and_then(coerce_non_negative_int)
        .unwrap_or(cfg.max_call_duration_secs);

    let override_url = ["max_call_duration_override_url", "call_duration_override_url"]
        .iter()
        .find_map(|k| ctx.session_option(k).and_then(value_text))
        .or_else(|| cfg.override_url.clone().filter(|u| !u.is_empty()));

    let poll_secs = [
        "max_call_duration_poll_seconds",
        "call_duration_override_poll_seconds",
    ]
    .iter()
    .find_map(|k| ctx.session_option(k).and_then(coerce_positive_float))
    .unwrap_or(cfg.override_poll_secs);

    DurationSettings {
        limit_secs,
        override_url,
        poll_interval: Duration::try_from_secs_f64(poll_secs).unwrap_or(MIN_POLL_INTERVAL),
    }
}

/// Remote source of a replacement duration limit.
#[async_trait]
pub trait OverrideSource: Send + Sync {
    /// The new limit in seconds, or `None` when nothing usable came back.
    async fn fetch(&self) -> Option<u64>;
}

/// Polls an operator-supplied URL for `{"max_call_duration_seconds": N}`.
pub struct HttpOverride {
    client: reqwest::Client,
    url: String,
}

impl HttpOverride {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl OverrideSource for HttpOverride {
    async fn fetch(&self) -> Option<u64> {
        let response = match self
            .client
            .get(&self.url)
            .timeout(OVERRIDE_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url = %self.url, "Failed to fetch call duration override: {e}");
                return None;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => parse_override(&body),
            Err(e) => {
                tracing::warn!("Call duration override response was not valid JSON: {e}");
                None
            }
        }
    }
}

/// Extract an override limit from a response body.
pub fn parse_override(body: &Value) -> Option<u64> {
    for key in OVERRIDE_KEYS {
        if let Some(value) = body.get(key) {
            let limit = coerce_non_negative_int(value);
            if limit.is_none() {
                tracing::warn!(key, "Override value could not be parsed; ignoring");
            }
            return limit;
        }
    }
    tracing::debug!("Call duration override response did not contain a recognised key");
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Disabled,
    TransferInProgress,
    LimitReached,
    DisabledByOverride,
}

/// Hangs the call up once its duration limit has passed.
pub struct DurationMonitor {
    ctx: SharedContext,
    control: CallControl,
    source: Option<Arc<dyn OverrideSource>>,
    poll_interval: Duration,
}

impl DurationMonitor {
    pub fn new(
        ctx: SharedContext,
        control: CallControl,
        source: Option<Arc<dyn OverrideSource>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            control,
            source,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Run until the limit is reached, a transfer starts or enforcement is
    /// turned off. The deadline is always `start + limit`, so a changed limit
    /// moves it relative to the call start rather than to now. A limit too
    /// large for the clock leaves no deadline, but overrides are still polled.
    pub async fn run(self, initial_limit: Option<u64>, start: Instant) -> MonitorExit {
        let Some(mut limit) = initial_limit.filter(|l| *l > 0) else {
            tracing::debug!(limit = ?initial_limit, "Call duration monitor disabled");
            return MonitorExit::Disabled;
        };

        let mut deadline = deadline_for(start, limit);
        tracing::info!(
            limit_secs = limit,
            poll_secs = self.poll_interval.as_secs_f64(),
            override_source = self.source.is_some(),
            "Call duration limit set"
        );

        loop {
            let now = Instant::now();
            if self.ctx.read(|c| c.transfer_in_progress()) {
                tracing::info!(
                    limit_secs = limit,
                    elapsed_secs = now.duration_since(start).as_secs_f64(),
                    "Call duration monitor stopping due to active transfer"
                );
                return MonitorExit::TransferInProgress;
            }
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    tracing::warn!(limit_secs = limit, "Maximum call duration reached; hanging up");
                    self.control.hangup(LIMIT_REACHED_REASON, false).await;
                    return MonitorExit::LimitReached;
                }
                Some(deadline) => (deadline - now).min(self.poll_interval),
                None => self.poll_interval,
            };

            tokio::time::sleep(wait).await;

            let mut updated = self.ctx.read(|c| c.max_call_duration_seconds());
            if let Some(ref source) = self.source {
                if let Some(remote) = source.fetch().await {
                    self.ctx.update(|c| c.set_max_call_duration_seconds(remote));
                    updated = Some(remote);
                }
            }

            let updated = updated.unwrap_or(limit);
            if updated != limit {
                limit = updated;
                if limit == 0 {
                    tracing::info!("Call duration limit disabled via override; stopping monitor");
                    return MonitorExit::DisabledByOverride;
                }
                deadline = deadline_for(start, limit);
                tracing::info!(limit_secs = limit, "Call duration limit updated");
            }
        }
    }
}

/// `start + limit`, or `None` when that instant is past what the clock can hold.
fn deadline_for(start: Instant, limit: u64) -> Option<Instant> {
    let deadline = start.checked_add(Duration::from_secs(limit));
    if deadline.is_none() {
        tracing::warn!(limit_secs = limit, "Call duration limit out of range; not enforcing");
    }
    deadline
}
