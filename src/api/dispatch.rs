use std::collections::HashMap;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::call::{run_call_job, JobRequest};
use crate::livekit::{ApiError, CreateAgentDispatchRequest};
use crate::AppState;

const DEFAULT_ROOM_PREFIX: &str = "outbound";

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    /// Destination phone number in E.164 format.
    pub destination: String,
    /// Sent as the `X-Account-Code` header on the outbound leg.
    pub account_code: String,
    pub transfer_target: Option<String>,
    pub caller_id: Option<String>,
    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub room_prefix: Option<String>,
    /// Extra fields merged over the composed metadata.
    pub metadata: Option<Map<String, Value>>,
    pub session_options: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub dispatch_id: String,
    pub job_id: Option<String>,
    pub room: String,
    pub agent_name: String,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct PlatformErrorResponse {
    message: String,
    code: String,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Dispatch metadata: the call fields without nulls, `session_options`
/// nested under its own key, then the caller's `metadata` merged on top.
pub fn compose_metadata(req: &DispatchRequest) -> Map<String, Value> {
    let mut out = Map::new();
    let fields = [
        ("destination", Some(&req.destination)),
        ("account_code", Some(&req.account_code)),
        ("transfer_target", req.transfer_target.as_ref()),
        ("caller_id", req.caller_id.as_ref()),
        ("caller_number", req.caller_number.as_ref()),
        ("caller_name", req.caller_name.as_ref()),
    ];
    for (key, value) in fields {
        if let Some(v) = value {
            out.insert(key.to_string(), Value::String(v.clone()));
        }
    }
    if let Some(options) = &req.session_options {
        out.insert("session_options".to_string(), Value::Object(options.clone()));
    }
    if let Some(extra) = &req.metadata {
        for (key, value) in extra {
            if value.is_null() {
                out.remove(key);
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// `<prefix>-<10 hex chars>`.
pub fn room_name(prefix: Option<&str>) -> String {
    let prefix = prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_ROOM_PREFIX);
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..10])
}

/// POST /dispatch: create a call job for the configured agent.
///
/// Request body:
/// ```json
/// {
///   "destination": "+61123456789",
///   "account_code": "ACC1",
///   "transfer_target": "+61402012298"
/// }
/// ```
pub async fn dispatch_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DispatchRequest>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }

    let agent_name = state.config.agent.name.clone();
    let metadata = compose_metadata(&req);
    let room = room_name(req.room_prefix.as_deref());
    let encoded = Value::Object(metadata.clone()).to_string();

    tracing::info!(
        destination = %req.destination,
        room = %room,
        agent = %agent_name,
        "Dispatch requested"
    );

    let request = CreateAgentDispatchRequest {
        agent_name: agent_name.clone(),
        room: room.clone(),
        metadata: encoded.clone(),
    };
    let dispatch = match state.api.create_dispatch(request).await {
        Ok(dispatch) => dispatch,
        Err(ApiError::Twirp {
            code, message, meta, ..
        }) => {
            tracing::error!(code = %code, "Dispatch rejected by media platform: {message}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(PlatformErrorResponse {
                    message,
                    code,
                    metadata: meta,
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to create dispatch: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let job_id = dispatch.job_id().map(str::to_string);
    let room = if dispatch.room.is_empty() {
        room
    } else {
        dispatch.room.clone()
    };

    let mut job_state = None;
    if let Some(runtime) = state.jobs.clone() {
        let request = JobRequest {
            job_id: job_id.clone().unwrap_or_else(|| dispatch.id.clone()),
            room_name: room.clone(),
            metadata: Some(encoded),
        };
        tokio::spawn(run_call_job(runtime, request));
        job_state = Some("running");
    }

    tracing::info!(dispatch_id = %dispatch.id, room = %room, "Dispatch created");
    (
        StatusCode::OK,
        Json(DispatchResponse {
            dispatch_id: dispatch.id,
            job_id,
            room,
            agent_name,
            metadata,
            state: job_state,
        }),
    )
        .into_response()
}

/// GET /healthz
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[allow(clippy::result_large_err)]
fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), axum::response::Response> {
    if expected_token.is_empty() {
        return Ok(());
    }

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected_token => Ok(()),
        _ => {
            tracing::warn!("Unauthorized dispatch request");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing bearer token".to_string(),
                }),
            )
                .into_response())
        }
    }
}
