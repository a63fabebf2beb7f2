use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::context::{coerce_non_negative_int, coerce_positive_float};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub livekit: LiveKitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub voicemail: VoicemailConfig,
    #[serde(default)]
    pub duration: DurationConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub models: ModelDefaults,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8089
}

/// Media platform credentials. `url` may be given as ws(s):// or http(s)://.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LiveKitConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// WebSocket URL of the speech pipeline sidecar.
    #[serde(default)]
    pub pipeline_url: Option<String>,
    /// Execute dispatched call jobs inside this process.
    #[serde(default = "default_true")]
    pub run_jobs_locally: bool,
    #[serde(default = "default_instructions")]
    pub instructions: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            pipeline_url: None,
            run_jobs_locally: true,
            instructions: default_instructions(),
        }
    }
}

fn default_agent_name() -> String {
    "nehos-outbound-agent".to_string()
}

fn default_instructions() -> String {
    "You are a friendly outbound sales agent. Keep replies short and conversational, \
     transfer interested callers with transfer_call and end finished calls with hangUp."
        .to_string()
}

fn default_true() -> bool {
    true
}

/// Trunk and caller-identity defaults used when the call context has none.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SipConfig {
    #[serde(default)]
    pub trunk_id: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default)]
    pub from_identity: Option<String>,
    #[serde(default)]
    pub default_caller_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoicemailConfig {
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_secs: f64,
}

impl Default for VoicemailConfig {
    fn default() -> Self {
        Self {
            silence_timeout_secs: default_silence_timeout(),
        }
    }
}

fn default_silence_timeout() -> f64 {
    8.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct DurationConfig {
    /// 0 disables duration enforcement.
    #[serde(default = "default_max_call_duration")]
    pub max_call_duration_secs: u64,
    #[serde(default)]
    pub override_url: Option<String>,
    #[serde(default = "default_poll_secs")]
    pub override_poll_secs: f64,
}

impl Default for DurationConfig {
    fn default() -> Self {
        Self {
            max_call_duration_secs: default_max_call_duration(),
            override_url: None,
            override_poll_secs: default_poll_secs(),
        }
    }
}

fn default_max_call_duration() -> u64 {
    120
}

fn default_poll_secs() -> f64 {
    30.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct EgressConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    #[serde(default)]
    pub room_prefix: Option<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: None,
            access_key: None,
            secret_key: None,
            path_prefix: default_path_prefix(),
            region: default_region(),
            force_path_style: true,
            room_prefix: None,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn default_path_prefix() -> String {
    "call-recordings".to_string()
}

fn default_region() -> String {
    "us-004".to_string()
}

/// Object storage target, only available when every credential is present.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageTarget<'a> {
    pub endpoint: &'a str,
    pub bucket: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

impl EgressConfig {
    pub fn storage(&self) -> Option<StorageTarget<'_>> {
        Some(StorageTarget {
            endpoint: present(&self.endpoint)?,
            bucket: present(&self.bucket)?,
            access_key: present(&self.access_key)?,
            secret_key: present(&self.secret_key)?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// End-of-call webhook. Reporting is skipped when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_report_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_report_timeout(),
        }
    }
}

fn default_report_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelDefaults {
    #[serde(default = "default_llm")]
    pub llm: String,
    #[serde(default = "default_stt")]
    pub stt: String,
    #[serde(default)]
    pub cartesia_api_key: Option<String>,
    #[serde(default = "default_cartesia_model")]
    pub cartesia_model: String,
    #[serde(default = "default_cartesia_voice")]
    pub cartesia_voice: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            llm: default_llm(),
            stt: default_stt(),
            cartesia_api_key: None,
            cartesia_model: default_cartesia_model(),
            cartesia_voice: default_cartesia_voice(),
        }
    }
}

fn default_llm() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_stt() -> String {
    "assemblyai/universal-streaming:en".to_string()
}

fn default_cartesia_model() -> String {
    "sonic-2".to_string()
}

fn default_cartesia_voice() -> String {
    "9626c31c-bec5-4cca-baa8-f8ba9e84c8bc".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Bearer token for /dispatch. When empty the route is open.
    #[serde(default)]
    pub token: String,
}

/// Langfuse trace export. Off unless all three values are set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub langfuse_public_key: Option<String>,
    #[serde(default)]
    pub langfuse_secret_key: Option<String>,
    #[serde(default)]
    pub langfuse_host: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        let mut config: Config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!("Loading config from {}", path.display());
                toml::from_str(&contents)
                    .map_err(|e| format!("Invalid config at {}: {e}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No config file at {}, using defaults and environment",
                    path.display()
                );
                Config::default()
            }
            Err(e) => {
                return Err(format!("Failed to read config at {}: {e}", path.display()).into())
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides. `lookup` returns the raw variable value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LIVEKIT_URL") {
            self.livekit.url = v;
        }
        if let Some(v) = get("LIVEKIT_API_KEY") {
            self.livekit.api_key = v;
        }
        if let Some(v) = get("LIVEKIT_API_SECRET") {
            self.livekit.api_secret = v;
        }
        if let Some(v) = get("AGENT_NAME") {
            self.agent.name = v;
        }
        if let Some(v) = get("PIPELINE_URL") {
            self.agent.pipeline_url = Some(v);
        }
        if let Some(v) = get("SIP_TRUNK_ID") {
            self.sip.trunk_id = Some(v);
        }
        if let Some(v) = get("SIP_FROM_NUMBER") {
            self.sip.from_number = Some(v);
        }
        if let Some(v) = get("SIP_FROM_IDENTITY") {
            self.sip.from_identity = Some(v);
        }
        if let Some(v) = get("DEFAULT_CALLER_ID") {
            self.sip.default_caller_id = Some(v);
        }
        if let Some(v) = get("SIP_DISPLAY_NAME") {
            self.sip.display_name = Some(v);
        }

        if let Some(v) = get("VOICEMAIL_SILENCE_TIMEOUT") {
            match coerce_positive_float(&Value::String(v.clone())) {
                Some(secs) => self.voicemail.silence_timeout_secs = secs,
                None => tracing::warn!(value = %v, "Ignoring invalid VOICEMAIL_SILENCE_TIMEOUT"),
            }
        }
        if let Some(v) = get("MAX_CALL_DURATION_SECONDS") {
            match coerce_non_negative_int(&Value::String(v.clone())) {
                Some(secs) => self.duration.max_call_duration_secs = secs,
                None => tracing::warn!(value = %v, "Ignoring invalid MAX_CALL_DURATION_SECONDS"),
            }
        }
        if let Some(v) = get("CALL_DURATION_OVERRIDE_URL").or_else(|| get("N8N_TIMEOUT_OVERRIDE_URL"))
        {
            self.duration.override_url = Some(v);
        }
        if let Some(v) = get("CALL_DURATION_OVERRIDE_POLL_SECONDS") {
            match coerce_positive_float(&Value::String(v.clone())) {
                Some(secs) => self.duration.override_poll_secs = secs,
                None => tracing::warn!(
                    value = %v,
                    "Ignoring invalid CALL_DURATION_OVERRIDE_POLL_SECONDS"
                ),
            }
        }
        if let Some(v) = get("N8N_WEBHOOK_URL") {
            self.report.webhook_url = Some(v);
        }

        if let Some(v) = get("EGRESS_ENDPOINT") {
            self.egress.endpoint = Some(v);
        }
        if let Some(v) = get("EGRESS_BUCKET") {
            self.egress.bucket = Some(v);
        }
        if let Some(v) = get("EGRESS_ACCESS_KEY") {
            self.egress.access_key = Some(v);
        }
        if let Some(v) = get("EGRESS_SECRET_KEY") {
            self.egress.secret_key = Some(v);
        }
        if let Some(v) = get("EGRESS_PATH_PREFIX") {
            self.egress.path_prefix = v;
        }
        if let Some(v) = get("EGRESS_REGION") {
            self.egress.region = v;
        }
        if let Some(v) = get("EGRESS_FORCE_PATH_STYLE") {
            self.egress.force_path_style =
                matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = get("EGRESS_ROOM_PREFIX") {
            self.egress.room_prefix = Some(v);
        }

        if let Some(v) = get("DEFAULT_LLM_MODEL") {
            self.models.llm = v;
        }
        if let Some(v) = get("DEFAULT_STT_MODEL") {
            self.models.stt = v;
        }
        if let Some(v) = get("CARTESIA_API_KEY") {
            self.models.cartesia_api_key = Some(v);
        }
        if let Some(v) = get("CARTESIA_MODEL") {
            self.models.cartesia_model = v;
        }
        if let Some(v) = get("CARTESIA_VOICE_ID") {
            self.models.cartesia_voice = v;
        }
        if let Some(v) = get("OUTBOUND_AGENT_API_TOKEN") {
            self.api.token = v;
        }

        if let Some(v) = get("LANGFUSE_PUBLIC_KEY") {
            self.telemetry.langfuse_public_key = Some(v);
        }
        if let Some(v) = get("LANGFUSE_SECRET_KEY") {
            self.telemetry.langfuse_secret_key = Some(v);
        }
        if let Some(v) = get("LANGFUSE_HOST") {
            self.telemetry.langfuse_host = Some(v);
        }
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("OUTBOUND_AGENT_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".outbound-agent")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("OUTBOUND_AGENT_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
