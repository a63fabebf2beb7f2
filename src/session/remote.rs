use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::Instrument;

use super::{
    AgentSession, SessionConnector, SessionError, SessionEvent, SessionHandle, SessionStart,
    SpeechHandle,
};

const EVENT_BUFFER: usize = 64;

/// Connects to a speech pipeline sidecar speaking JSON over WebSocket.
pub struct RemoteConnector {
    url: String,
}

impl RemoteConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

/// Commands sent to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    Start(SessionStart),
    GenerateReply { speech_id: String, instructions: String },
    ToolResult { call_id: String, output: String },
    Shutdown { drain: bool },
}

type PendingPlayouts = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

pub struct RemoteSession {
    commands: mpsc::UnboundedSender<Command>,
    pending: PendingPlayouts,
    closed: AtomicBool,
}

#[async_trait]
impl SessionConnector for RemoteConnector {
    async fn connect(&self, start: SessionStart) -> Result<SessionHandle, SessionError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        tracing::info!(url = %self.url, room = %start.room, "Speech pipeline connected");

        let (mut sink, mut stream) = socket.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_BUFFER);
        let pending: PendingPlayouts = Arc::new(Mutex::new(HashMap::new()));

        command_tx
            .send(Command::Start(start))
            .map_err(|_| SessionError::Closed)?;

        // Writer: forward queued commands until shutdown.
        tokio::spawn(
            async move {
                while let Some(command) = command_rx.recv().await {
                    let is_shutdown = matches!(command, Command::Shutdown { .. });
                    let text = match serde_json::to_string(&command) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!("Failed to encode pipeline command: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send pipeline command: {e}");
                        break;
                    }
                    if is_shutdown {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        // Reader: resolve playouts locally, forward everything else.
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(
            async move {
                while let Some(frame) = stream.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => {
                            tracing::info!("Speech pipeline closed the session");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!("Speech pipeline socket error: {e}");
                            break;
                        }
                    };

                    match decode_frame(text.as_str()) {
                        Ok(Frame::PlayoutFinished(speech_id)) => {
                            let tx = reader_pending
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&speech_id);
                            if let Some(tx) = tx {
                                let _ = tx.send(());
                            }
                        }
                        Ok(Frame::Closed(reason)) => {
                            tracing::info!(reason = ?reason, "Speech pipeline ended the session");
                            break;
                        }
                        Ok(Frame::Event(event)) => {
                            if event_tx.send(event).await.is_err() {
                                tracing::debug!("Session event dropped; no subscriber");
                            }
                        }
                        Err(e) => tracing::warn!("Failed to parse pipeline event: {e}"),
                    }
                }
                // Unblock anyone still waiting on playout.
                reader_pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            }
            .in_current_span(),
        );

        let session = RemoteSession {
            commands: command_tx,
            pending,
            closed: AtomicBool::new(false),
        };

        Ok(SessionHandle {
            session: Arc::new(session),
            events: event_rx,
        })
    }
}

#[async_trait]
impl AgentSession for RemoteSession {
    async fn generate_reply(&self, instructions: &str) -> Result<SpeechHandle, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let speech_id = format!("speech_{}", uuid::Uuid::new_v4().simple());
        let (handle, done) = SpeechHandle::new(speech_id.clone());
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(speech_id.clone(), done);

        let command = Command::GenerateReply {
            speech_id: speech_id.clone(),
            instructions: instructions.to_string(),
        };
        if self.commands.send(command).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&speech_id);
            return Err(SessionError::Closed);
        }
        Ok(handle)
    }

    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<(), SessionError> {
        self.commands
            .send(Command::ToolResult {
                call_id: call_id.to_string(),
                output: output.to_string(),
            })
            .map_err(|_| SessionError::Closed)
    }

    fn shutdown(&self, drain: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(drain, "Shutting down speech pipeline session");
        let _ = self.commands.send(Command::Shutdown { drain });
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    PlayoutFinished(String),
    Closed(Option<String>),
    Event(SessionEvent),
}

fn decode_frame(text: &str) -> Result<Frame, SessionError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))?;

    match value.get("event").and_then(Value::as_str) {
        Some("playout_finished") => value
            .get("speech_id")
            .and_then(Value::as_str)
            .map(|id| Frame::PlayoutFinished(id.to_string()))
            .ok_or_else(|| SessionError::Protocol("playout_finished without speech_id".into())),
        Some("closed") => Ok(Frame::Closed(
            value.get("reason").and_then(Value::as_str).map(String::from),
        )),
        _ => serde_json::from_value(value)
            .map(Frame::Event)
            .map_err(|e| SessionError::Protocol(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, TtsBackend};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn start() -> SessionStart {
        SessionStart {
            room: "outbound-abc".into(),
            instructions: "be brief".into(),
            config: SessionConfig {
                llm: "openai/gpt-4o-mini".into(),
                stt: "assemblyai/universal-streaming:en".into(),
                tts: TtsBackend::Inference {
                    value: "cartesia/sonic-2:v".into(),
                },
                preemptive_generation: false,
            },
            tools: Vec::new(),
        }
    }

    #[test]
    fn decodes_control_and_session_frames() {
        assert_eq!(
            decode_frame(r#"{"event":"playout_finished","speech_id":"sp1"}"#).unwrap(),
            Frame::PlayoutFinished("sp1".into())
        );
        assert_eq!(
            decode_frame(r#"{"event":"closed","reason":"participant left"}"#).unwrap(),
            Frame::Closed(Some("participant left".into()))
        );
        assert!(matches!(
            decode_frame(r#"{"event":"metrics_collected","metrics":{"type":"llm_metrics"}}"#).unwrap(),
            Frame::Event(SessionEvent::MetricsCollected { .. })
        ));
        assert!(decode_frame(r#"{"event":"unknown_thing"}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn commands_are_tagged() {
        let value = serde_json::to_value(Command::Shutdown { drain: false }).unwrap();
        assert_eq!(value, json!({"command": "shutdown", "drain": false}));

        let value = serde_json::to_value(Command::Start(start())).unwrap();
        assert_eq!(value["command"], json!("start"));
        assert_eq!(value["room"], json!("outbound-abc"));
        assert_eq!(value["config"]["tts"]["provider"], json!("inference"));
    }

    #[tokio::test]
    async fn session_round_trip_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let first: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            };
            assert_eq!(first["command"], json!("start"));

            let event = json!({"event": "user_input_transcribed", "transcript": "hi", "is_final": true});
            ws.send(Message::Text(event.to_string().into())).await.unwrap();

            let reply: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            };
            assert_eq!(reply["command"], json!("generate_reply"));
            let done = json!({"event": "playout_finished", "speech_id": reply["speech_id"]});
            ws.send(Message::Text(done.to_string().into())).await.unwrap();

            let shutdown: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            };
            assert_eq!(shutdown, json!({"command": "shutdown", "drain": true}));
        });

        let connector = RemoteConnector::new(&format!("ws://{addr}"));
        let SessionHandle {
            session,
            mut events,
        } = connector.connect(start()).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::UserInputTranscribed { is_final: true, .. }));

        let speech = session.generate_reply("say hello").await.unwrap();
        speech.wait_for_playout().await;

        session.shutdown(true);
        session.shutdown(true);
        server.await.unwrap();

        assert!(matches!(
            session.generate_reply("again").await,
            Err(SessionError::Closed)
        ));
    }
}
