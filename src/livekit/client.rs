use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::token::service_token;
use super::{
    AgentDispatch, ApiError, CreateAgentDispatchRequest, CreateSipParticipantRequest, EgressInfo,
    LiveKitApi, RoomCompositeEgressRequest, SipParticipantInfo, TransferSipParticipantRequest,
};
use crate::config::LiveKitConfig;

/// Twirp JSON client for the LiveKit server API.
pub struct LiveKitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct TwirpErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    meta: HashMap<String, String>,
}

impl LiveKitClient {
    pub fn new(config: &LiveKitConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: http_base_url(&config.url),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        }
    }

    async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        body: &Req,
    ) -> Result<Resp, ApiError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/twirp/livekit.{service}/{method}", self.base_url);
        let token = service_token(&self.api_key, &self.api_secret)?;

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let parsed: TwirpErrorBody =
                serde_json::from_str(&text).unwrap_or_else(|_| TwirpErrorBody {
                    code: "unknown".to_string(),
                    msg: text,
                    meta: HashMap::new(),
                });
            return Err(ApiError::Twirp {
                status: status.as_u16(),
                code: parsed.code,
                message: parsed.msg,
                meta: parsed.meta,
            });
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait]
impl LiveKitApi for LiveKitClient {
    async fn create_sip_participant(
        &self,
        req: CreateSipParticipantRequest,
    ) -> Result<SipParticipantInfo, ApiError> {
        self.call("SIP", "CreateSIPParticipant", &req).await
    }

    async fn transfer_sip_participant(
        &self,
        req: TransferSipParticipantRequest,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self.call("SIP", "TransferSIPParticipant", &req).await?;
        Ok(())
    }

    async fn delete_room(&self, room: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .call("RoomService", "DeleteRoom", &json!({ "room": room }))
            .await?;
        Ok(())
    }

    async fn start_room_composite_egress(
        &self,
        req: RoomCompositeEgressRequest,
    ) -> Result<EgressInfo, ApiError> {
        self.call("Egress", "StartRoomCompositeEgress", &req).await
    }

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, ApiError> {
        self.call("Egress", "StopEgress", &json!({ "egress_id": egress_id }))
            .await
    }

    async fn create_dispatch(
        &self,
        req: CreateAgentDispatchRequest,
    ) -> Result<AgentDispatch, ApiError> {
        self.call("AgentDispatchService", "CreateDispatch", &req)
            .await
    }
}

/// The server URL is usually configured as the client-facing ws(s):// URL.
fn http_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}
