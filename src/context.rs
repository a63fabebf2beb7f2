use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Per-call record built from dispatch metadata and mutated by every stage
/// of the call.
///
/// Free-form metadata keys live in `fields`. Runtime state is written
/// through the typed setters below, each owned by one component:
///
/// - outbound initiator: `sip_participant_identity`, `from_identity`,
///   `call_connected_at`, recording state
/// - voicemail arbitrator: `voicemail_detected`, `voicemail_reason`
/// - transfer coordinator: `transfer_in_progress`, `transfer_initiated_at`
/// - duration monitor: `max_call_duration_seconds`
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    fields: Map<String, Value>,
    egress: Option<EgressState>,
}

/// Recording handle and its last known status.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EgressState {
    pub egress_id: String,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub duration: Option<Value>,
    pub results: Option<Vec<Value>>,
}

impl CallContext {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            egress: None,
        }
    }

    /// Build a context from raw job metadata. Anything that is not a JSON
    /// object yields an empty context.
    pub fn from_metadata(raw: Option<&str>) -> Self {
        Self::new(parse_metadata(raw))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty textual value for `key`. Numbers are rendered as strings.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_text)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    /// Look up `key` in `session_options` first, then at the top level.
    pub fn session_option(&self, key: &str) -> Option<&Value> {
        self.fields
            .get("session_options")
            .and_then(Value::as_object)
            .and_then(|opts| opts.get(key))
            .filter(|v| !v.is_null())
            .or_else(|| self.get(key))
    }

    pub fn voicemail_detected(&self) -> bool {
        self.flag("voicemail_detected")
    }

    pub fn mark_voicemail(&mut self, reason: &str) {
        self.set("voicemail_detected", true);
        self.set("voicemail_reason", reason);
    }

    pub fn transfer_in_progress(&self) -> bool {
        self.flag("transfer_in_progress")
    }

    pub fn begin_transfer(&mut self, at: DateTime<Utc>) {
        self.set("transfer_in_progress", true);
        self.set("transfer_initiated_at", at.to_rfc3339());
    }

    pub fn abort_transfer(&mut self) {
        self.set("transfer_in_progress", false);
    }

    pub fn set_call_connected_at(&mut self, at: DateTime<Utc>) {
        self.set("call_connected_at", at.to_rfc3339());
    }

    pub fn max_call_duration_seconds(&self) -> Option<u64> {
        self.get("max_call_duration_seconds")
            .and_then(coerce_non_negative_int)
    }

    pub fn set_max_call_duration_seconds(&mut self, secs: u64) {
        self.set("max_call_duration_seconds", secs);
    }

    pub fn egress(&self) -> Option<&EgressState> {
        self.egress.as_ref()
    }

    pub fn egress_mut(&mut self) -> Option<&mut EgressState> {
        self.egress.as_mut()
    }

    pub fn set_egress(&mut self, egress: EgressState) {
        self.set("egress_id", egress.egress_id.clone());
        self.egress = Some(egress);
    }

    /// Copy of every field, with the recording state under `egress`.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut fields = self.fields.clone();
        if let Some(ref egress) = self.egress {
            if let Ok(value) = serde_json::to_value(egress) {
                fields.insert("egress".to_string(), value);
            }
        }
        fields
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Call context shared between the components of one call job.
///
/// Accesses are short field reads and writes; the lock is never held across
/// an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<Mutex<CallContext>>,
}

impl SharedContext {
    pub fn new(ctx: CallContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ctx)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&CallContext) -> R) -> R {
        f(&self.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut CallContext) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, CallContext> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse job metadata into a JSON object, ignoring anything else.
pub fn parse_metadata(raw: Option<&str>) -> Map<String, Value> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Map::new();
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => {
            tracing::debug!(keys = map.len(), "Parsed job metadata");
            map
        }
        Ok(_) => {
            tracing::warn!("Job metadata is not a JSON object; ignoring");
            Map::new()
        }
        Err(e) => {
            tracing::warn!("Failed to parse job metadata as JSON: {e}");
            Map::new()
        }
    }
}

/// Non-empty string form of a scalar JSON value.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer >= 0 from a number or a numeric string.
pub fn coerce_non_negative_int(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<i64>().ok().and_then(|n| u64::try_from(n).ok()),
        _ => None,
    }
}

/// Float > 0 from a number or a numeric string.
pub fn coerce_positive_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (number.is_finite() && number > 0.0).then_some(number)
}

pub fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => true,
            "false" | "0" | "no" | "n" | "off" => false,
            _ => default,
        },
        _ => default,
    }
}
