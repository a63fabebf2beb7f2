//! In-memory stand-ins for the media platform and speech pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::livekit::{
    AgentDispatch, AgentDispatchState, ApiError, CreateAgentDispatchRequest,
    CreateSipParticipantRequest, DispatchedJob, EgressInfo, LiveKitApi,
    RoomCompositeEgressRequest, SipParticipantInfo, TransferSipParticipantRequest,
};
use crate::session::{
    AgentSession, SessionConnector, SessionError, SessionEvent, SessionHandle, SessionStart,
    SpeechHandle,
};

/// Ordered log shared between fakes to assert cross-component ordering.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn twirp(code: &str, message: &str) -> ApiError {
    ApiError::Twirp {
        status: 400,
        code: code.into(),
        message: message.into(),
        meta: HashMap::new(),
    }
}

#[derive(Default)]
pub struct FakeApi {
    pub journal: Journal,
    sip_requests: Mutex<Vec<CreateSipParticipantRequest>>,
    transfers: Mutex<Vec<TransferSipParticipantRequest>>,
    deleted_rooms: Mutex<Vec<String>>,
    egress_starts: Mutex<Vec<RoomCompositeEgressRequest>>,
    egress_stops: Mutex<Vec<String>>,
    dispatches: Mutex<Vec<CreateAgentDispatchRequest>>,
    sip_error: Mutex<Option<ApiError>>,
    fail_transfer: AtomicBool,
    fail_delete_room: AtomicBool,
    fail_stop_egress: AtomicBool,
    dispatch_error: Mutex<Option<ApiError>>,
}

impl FakeApi {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn fail_sip(&self, err: ApiError) {
        *self.sip_error.lock().unwrap() = Some(err);
    }

    pub fn fail_transfer(&self) {
        self.fail_transfer.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete_room(&self) {
        self.fail_delete_room.store(true, Ordering::SeqCst);
    }

    pub fn fail_stop_egress(&self) {
        self.fail_stop_egress.store(true, Ordering::SeqCst);
    }

    pub fn fail_dispatch(&self, err: ApiError) {
        *self.dispatch_error.lock().unwrap() = Some(err);
    }

    pub fn sip_requests(&self) -> Vec<CreateSipParticipantRequest> {
        self.sip_requests.lock().unwrap().clone()
    }

    pub fn transfers(&self) -> Vec<TransferSipParticipantRequest> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn deleted_rooms(&self) -> Vec<String> {
        self.deleted_rooms.lock().unwrap().clone()
    }

    pub fn egress_starts(&self) -> Vec<RoomCompositeEgressRequest> {
        self.egress_starts.lock().unwrap().clone()
    }

    pub fn egress_stops(&self) -> Vec<String> {
        self.egress_stops.lock().unwrap().clone()
    }

    pub fn dispatches(&self) -> Vec<CreateAgentDispatchRequest> {
        self.dispatches.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveKitApi for FakeApi {
    async fn create_sip_participant(
        &self,
        req: CreateSipParticipantRequest,
    ) -> Result<SipParticipantInfo, ApiError> {
        self.journal.push("create_sip_participant");
        self.sip_requests.lock().unwrap().push(req.clone());
        if let Some(err) = self.sip_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(SipParticipantInfo {
            participant_id: "PA_test".into(),
            participant_identity: req.participant_identity,
            sip_call_id: "SCL_test".into(),
        })
    }

    async fn transfer_sip_participant(
        &self,
        req: TransferSipParticipantRequest,
    ) -> Result<(), ApiError> {
        self.journal.push(format!("transfer:{}", req.transfer_to));
        self.transfers.lock().unwrap().push(req);
        if self.fail_transfer.load(Ordering::SeqCst) {
            return Err(twirp("unavailable", "transfer rejected"));
        }
        Ok(())
    }

    async fn delete_room(&self, room: &str) -> Result<(), ApiError> {
        self.journal.push("delete_room");
        self.deleted_rooms.lock().unwrap().push(room.to_string());
        if self.fail_delete_room.load(Ordering::SeqCst) {
            return Err(ApiError::Request("connection refused".into()));
        }
        Ok(())
    }

    async fn start_room_composite_egress(
        &self,
        req: RoomCompositeEgressRequest,
    ) -> Result<EgressInfo, ApiError> {
        self.egress_starts.lock().unwrap().push(req);
        Ok(EgressInfo {
            egress_id: "EG_test".into(),
            status: Some(json!("EGRESS_STARTING")),
            error: None,
            file_results: Vec::new(),
        })
    }

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, ApiError> {
        self.egress_stops.lock().unwrap().push(egress_id.to_string());
        if self.fail_stop_egress.load(Ordering::SeqCst) {
            return Err(twirp("not_found", "egress not found"));
        }
        Ok(EgressInfo {
            egress_id: egress_id.to_string(),
            status: Some(json!("EGRESS_COMPLETE")),
            error: None,
            file_results: vec![json!({"filename": "call.mp3", "duration": "42000000000"})],
        })
    }

    async fn create_dispatch(
        &self,
        req: CreateAgentDispatchRequest,
    ) -> Result<AgentDispatch, ApiError> {
        self.dispatches.lock().unwrap().push(req.clone());
        if let Some(err) = self.dispatch_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(AgentDispatch {
            id: "AD_test".into(),
            agent_name: req.agent_name,
            room: req.room,
            state: Some(AgentDispatchState {
                jobs: vec![DispatchedJob {
                    id: "AJ_test".into(),
                }],
            }),
        })
    }
}

pub struct FakeSession {
    pub journal: Journal,
    playout_delay: Duration,
    replies: Mutex<Vec<String>>,
    tool_results: Mutex<Vec<(String, String)>>,
    shutdowns: Mutex<Vec<bool>>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::with_journal(Journal::default())
    }
}

impl FakeSession {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            playout_delay: Duration::from_secs(2),
            replies: Mutex::new(Vec::new()),
            tool_results: Mutex::new(Vec::new()),
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().unwrap().clone()
    }

    pub fn tool_results(&self) -> Vec<(String, String)> {
        self.tool_results.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> Vec<bool> {
        self.shutdowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentSession for FakeSession {
    async fn generate_reply(&self, instructions: &str) -> Result<SpeechHandle, SessionError> {
        self.journal.push("reply");
        self.replies.lock().unwrap().push(instructions.to_string());

        let (handle, done) = SpeechHandle::new(format!("speech_{}", self.replies().len()));
        let delay = self.playout_delay;
        let journal = self.journal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            journal.push("playout_finished");
            let _ = done.send(());
        });
        Ok(handle)
    }

    async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<(), SessionError> {
        self.tool_results
            .lock()
            .unwrap()
            .push((call_id.to_string(), output.to_string()));
        Ok(())
    }

    fn shutdown(&self, drain: bool) {
        self.journal.push(format!("shutdown:drain={drain}"));
        self.shutdowns.lock().unwrap().push(drain);
    }
}

/// Hands out one prepared session and keeps the event sender for the test.
pub struct FakeConnector {
    pub session: Arc<FakeSession>,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    starts: Mutex<Vec<SessionStart>>,
}

impl FakeConnector {
    pub fn new(session: Arc<FakeSession>) -> (Self, mpsc::Sender<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                session,
                events: Mutex::new(Some(rx)),
                starts: Mutex::new(Vec::new()),
            },
            tx,
        )
    }

    pub fn starts(&self) -> Vec<SessionStart> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, start: SessionStart) -> Result<SessionHandle, SessionError> {
        self.starts.lock().unwrap().push(start);
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Connect("already connected".into()))?;
        Ok(SessionHandle {
            session: self.session.clone(),
            events,
        })
    }
}
