pub mod providers;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub use providers::{resolve_session_config, SessionConfig, TtsBackend};

/// Handle to the speech pipeline (STT -> LLM -> TTS) driving one call.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Ask the model to say something. The handle resolves once it has played.
    async fn generate_reply(&self, instructions: &str) -> Result<SpeechHandle, SessionError>;

    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<(), SessionError>;

    /// Stop the session. With `drain`, speech in flight finishes first.
    /// Never blocks; calling it twice is a no-op.
    fn shutdown(&self, drain: bool);
}

/// Creates a session for a room and returns its event stream.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, start: SessionStart) -> Result<SessionHandle, SessionError>;
}

/// Everything the pipeline needs to start talking in a room.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub room: String,
    pub instructions: String,
    pub config: SessionConfig,
    pub tools: Vec<ToolSpec>,
}

pub struct SessionHandle {
    pub session: Arc<dyn AgentSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Function tool advertised to the language model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Resolves when an utterance has finished playing to the caller.
pub struct SpeechHandle {
    pub id: String,
    playout: oneshot::Receiver<()>,
}

impl SpeechHandle {
    pub fn new(id: String) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, playout: rx }, tx)
    }

    /// Wait for playout. Also returns if the session goes away first.
    pub async fn wait_for_playout(self) {
        if self.playout.await.is_err() {
            tracing::debug!(speech_id = %self.id, "Speech dropped before playout finished");
        }
    }
}

/// Events published by the speech pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    UserInputTranscribed {
        transcript: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        language: Option<String>,
    },
    SpeechCreated {
        #[serde(default)]
        speech_id: String,
        #[serde(default)]
        source: Option<String>,
    },
    ConversationItemAdded {
        item: ChatItem,
    },
    MetricsCollected {
        metrics: Value,
    },
    FunctionToolCalled {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatItem {
    pub role: String,
    #[serde(default)]
    pub content: Option<ChatContent>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContentPart {
    Text(String),
    Object {
        #[serde(default)]
        text: Option<String>,
    },
}

impl ChatItem {
    /// Spoken text of the item; parts are trimmed and joined with spaces.
    pub fn text_content(&self) -> String {
        match &self.content {
            Some(ChatContent::Text(s)) => s.trim().to_string(),
            Some(ChatContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text(s) => Some(s.as_str()),
                    ContentPart::Object { text } => text.as_deref(),
                })
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            None => self
                .text
                .as_deref()
                .map(|t| t.trim().to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to connect to speech pipeline: {0}")]
    Connect(String),
    #[error("Speech pipeline session closed")]
    Closed,
    #[error("Speech pipeline protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_transcript_event() {
        let ev: SessionEvent = serde_json::from_value(json!({
            "event": "user_input_transcribed",
            "transcript": "hello there",
            "is_final": true,
            "language": "en"
        }))
        .unwrap();
        assert_eq!(
            ev,
            SessionEvent::UserInputTranscribed {
                transcript: "hello there".into(),
                is_final: true,
                language: Some("en".into()),
            }
        );
    }

    #[test]
    fn chat_item_text_from_parts() {
        let item: ChatItem = serde_json::from_value(json!({
            "role": "assistant",
            "content": [" Hi, ", {"text": "this is TM Mobile"}, {"audio": "x"}, ""]
        }))
        .unwrap();
        assert_eq!(item.text_content(), "Hi, this is TM Mobile");
    }

    #[test]
    fn chat_item_text_from_string_or_text_field() {
        let item: ChatItem =
            serde_json::from_value(json!({"role": "assistant", "content": "  Goodbye. "})).unwrap();
        assert_eq!(item.text_content(), "Goodbye.");

        let item: ChatItem =
            serde_json::from_value(json!({"role": "assistant", "text": "Fallback"})).unwrap();
        assert_eq!(item.text_content(), "Fallback");
    }

    #[tokio::test]
    async fn speech_handle_returns_when_sender_dropped() {
        let (handle, tx) = SpeechHandle::new("sp_1".into());
        drop(tx);
        handle.wait_for_playout().await;
    }
}
