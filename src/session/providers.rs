use serde::Serialize;
use serde_json::Value;

use crate::config::ModelDefaults;
use crate::context::{coerce_bool, value_text, CallContext};

/// Models and voice applied to one call's speech pipeline.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionConfig {
    pub llm: String,
    pub stt: String,
    pub tts: TtsBackend,
    pub preemptive_generation: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum TtsBackend {
    /// Direct Cartesia plugin.
    Cartesia { model: String, voice: String },
    /// Gateway descriptor such as `cartesia/sonic-2:<voice>`.
    Inference { value: String },
}

/// Resolve the session configuration from `session_options`, the
/// top-level context and the configured defaults.
pub fn resolve_session_config(ctx: &CallContext, defaults: &ModelDefaults) -> SessionConfig {
    let option_text = |keys: &[&str]| -> Option<String> {
        first_present(ctx, keys).and_then(value_text)
    };

    let llm = option_text(&["llm", "llm_model"]).unwrap_or_else(|| defaults.llm.clone());
    let stt = option_text(&["stt", "stt_model"]).unwrap_or_else(|| defaults.stt.clone());
    let preemptive_generation = coerce_bool(
        first_present(ctx, &["preemptive_generation", "enable_preemptive_generation"]),
        false,
    );

    let mut voice = option_text(&["cartesia_voice", "tts_voice"])
        .unwrap_or_else(|| defaults.cartesia_voice.clone());
    let mut model =
        option_text(&["cartesia_model"]).unwrap_or_else(|| defaults.cartesia_model.clone());

    let has_cartesia_key = defaults
        .cartesia_api_key
        .as_deref()
        .is_some_and(|k| !k.is_empty());
    let mut use_cartesia = has_cartesia_key;
    let mut descriptor: Option<String> = None;

    match first_present(ctx, &["tts_backend", "tts"]) {
        Some(Value::Object(spec)) => {
            let provider = ["provider", "type"]
                .iter()
                .find_map(|k| spec.get(*k).filter(|v| !v.is_null()))
                .and_then(value_text)
                .unwrap_or_default()
                .to_lowercase();
            if !provider.is_empty() && provider != "cartesia" {
                use_cartesia = false;
                descriptor = Some(
                    ["value", "id", "model"]
                        .iter()
                        .find_map(|k| spec.get(*k).filter(|v| !v.is_null()))
                        .and_then(value_text)
                        .unwrap_or_default(),
                );
            } else {
                if let Some(v) = spec.get("voice").and_then(value_text) {
                    voice = v;
                }
                if let Some(m) = spec.get("model").and_then(value_text) {
                    model = m;
                }
            }
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            let lower = trimmed.to_lowercase();
            if !trimmed.is_empty() && lower != "cartesia" && lower != "cartesia_plugin" {
                use_cartesia = false;
                descriptor = Some(trimmed.to_string());
            }
        }
        Some(other) => {
            use_cartesia = false;
            descriptor = Some(other.to_string());
        }
        None => {}
    }

    let tts = if use_cartesia {
        TtsBackend::Cartesia { model, voice }
    } else {
        TtsBackend::Inference {
            value: descriptor.unwrap_or_else(|| format!("cartesia/{model}:{voice}")),
        }
    };

    SessionConfig {
        llm,
        stt,
        tts,
        preemptive_generation,
    }
}

fn first_present<'a>(ctx: &'a CallContext, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| ctx.session_option(k))
}
