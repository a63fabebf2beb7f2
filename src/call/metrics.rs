use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `metrics_collected` payload as it appears in the report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Totals across every usage-bearing metric of a call.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageSummary {
    pub llm_prompt_tokens: u64,
    pub llm_prompt_cached_tokens: u64,
    pub llm_completion_tokens: u64,
    pub tts_characters_count: u64,
    pub tts_audio_duration: f64,
    pub stt_audio_duration: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UsageSample {
    LlmMetrics {
        #[serde(default)]
        prompt_tokens: u64,
        #[serde(default)]
        prompt_cached_tokens: u64,
        #[serde(default)]
        completion_tokens: u64,
    },
    TtsMetrics {
        #[serde(default)]
        characters_count: u64,
        #[serde(default)]
        audio_duration: f64,
    },
    SttMetrics {
        #[serde(default)]
        audio_duration: f64,
    },
}

impl UsageSummary {
    fn add(&mut self, sample: UsageSample) {
        match sample {
            UsageSample::LlmMetrics {
                prompt_tokens,
                prompt_cached_tokens,
                completion_tokens,
            } => {
                self.llm_prompt_tokens += prompt_tokens;
                self.llm_prompt_cached_tokens += prompt_cached_tokens;
                self.llm_completion_tokens += completion_tokens;
            }
            UsageSample::TtsMetrics {
                characters_count,
                audio_duration,
            } => {
                self.tts_characters_count += characters_count;
                self.tts_audio_duration += audio_duration;
            }
            UsageSample::SttMetrics { audio_duration } => {
                self.stt_audio_duration += audio_duration;
            }
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    events: Vec<MetricsEvent>,
    summary: UsageSummary,
}

/// Raw metrics log plus running usage totals.
#[derive(Debug, Clone, Default)]
pub struct MetricsLog {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&self, metrics: Value) {
        let kind = metrics
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tracing::debug!(kind = %kind, metrics = %metrics, "Pipeline metrics");

        let sample = serde_json::from_value::<UsageSample>(metrics.clone()).ok();
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sample) = sample {
            state.summary.add(sample);
        }
        state.events.push(MetricsEvent {
            kind,
            data: metrics,
        });
    }

    pub fn summary(&self) -> UsageSummary {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary
            .clone()
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }
}
