pub mod client;
pub mod token;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side calls made against the media platform.
#[async_trait]
pub trait LiveKitApi: Send + Sync {
    /// Dial out and, with `wait_until_answered`, return once the callee picks up.
    async fn create_sip_participant(
        &self,
        req: CreateSipParticipantRequest,
    ) -> Result<SipParticipantInfo, ApiError>;

    async fn transfer_sip_participant(
        &self,
        req: TransferSipParticipantRequest,
    ) -> Result<(), ApiError>;

    async fn delete_room(&self, room: &str) -> Result<(), ApiError>;

    async fn start_room_composite_egress(
        &self,
        req: RoomCompositeEgressRequest,
    ) -> Result<EgressInfo, ApiError>;

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, ApiError>;

    async fn create_dispatch(&self, req: CreateAgentDispatchRequest)
        -> Result<AgentDispatch, ApiError>;
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct CreateSipParticipantRequest {
    pub sip_trunk_id: String,
    pub sip_call_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sip_number: Option<String>,
    pub room_name: String,
    pub participant_identity: String,
    pub participant_metadata: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub wait_until_answered: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SipParticipantInfo {
    #[serde(default)]
    pub participant_id: String,
    #[serde(default)]
    pub participant_identity: String,
    #[serde(default)]
    pub sip_call_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferSipParticipantRequest {
    pub room_name: String,
    pub participant_identity: String,
    pub transfer_to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoomCompositeEgressRequest {
    pub room_name: String,
    pub layout: String,
    pub audio_only: bool,
    pub file_outputs: Vec<EncodedFileOutput>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EncodedFileOutput {
    pub file_type: EncodedFileType,
    pub filepath: String,
    pub s3: S3Upload,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncodedFileType {
    Mp3,
    Mp4,
}

impl EncodedFileType {
    pub fn extension(self) -> &'static str {
        match self {
            EncodedFileType::Mp3 => "mp3",
            EncodedFileType::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct S3Upload {
    pub access_key: String,
    pub secret: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub force_path_style: bool,
}

/// Egress status as returned by start/stop. Status enums arrive as strings
/// (`EGRESS_ACTIVE`) or numbers depending on the server's JSON encoding.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EgressInfo {
    #[serde(default)]
    pub egress_id: String,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub file_results: Vec<Value>,
}

impl EgressInfo {
    pub fn status_text(&self) -> Option<String> {
        match self.status.as_ref()? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn error_text(&self) -> Option<String> {
        self.error.clone().filter(|e| !e.is_empty())
    }

    /// Recorded duration of the first output file, when reported.
    pub fn duration(&self) -> Option<Value> {
        self.file_results.first()?.get("duration").cloned()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateAgentDispatchRequest {
    pub agent_name: String,
    pub room: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentDispatch {
    #[serde(default, alias = "dispatch_id")]
    pub id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub state: Option<AgentDispatchState>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentDispatchState {
    #[serde(default)]
    pub jobs: Vec<DispatchedJob>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DispatchedJob {
    #[serde(default)]
    pub id: String,
}

impl AgentDispatch {
    pub fn job_id(&self) -> Option<&str> {
        self.state
            .as_ref()?
            .jobs
            .first()
            .map(|j| j.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("LiveKit API error {code} (HTTP {status}): {message}")]
    Twirp {
        status: u16,
        code: String,
        message: String,
        meta: HashMap<String, String>,
    },
    #[error("Failed to parse LiveKit response: {0}")]
    Parse(String),
    #[error("Failed to sign access token: {0}")]
    Token(String),
}

impl ApiError {
    /// Error metadata reported by the server, e.g. `sip_status_code`.
    pub fn meta(&self, key: &str) -> Option<&str> {
        match self {
            ApiError::Twirp { meta, .. } => meta.get(key).map(String::as_str),
            _ => None,
        }
    }
}
