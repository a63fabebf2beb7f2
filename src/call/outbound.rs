use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::call::hangup::JobContext;
use crate::config::{EgressConfig, SipConfig};
use crate::context::{EgressState, SharedContext};
use crate::livekit::{
    ApiError, CreateSipParticipantRequest, EncodedFileOutput, EncodedFileType,
    RoomCompositeEgressRequest, S3Upload,
};
use crate::resolve::{destination_fields, resolve_caller_identity, resolve_caller_number};

const ACCOUNT_CODE_HEADER: &str = "X-Account-Code";
const RECORDING_LAYOUT: &str = "speaker-dark";

/// Dial the destination in the call context and wait for an answer.
///
/// Returns the connect time on success. Every failure is logged and yields
/// `None`; a missing trunk or a failed dial also shuts the job down.
pub async fn initiate_outbound_call(
    job: &JobContext,
    ctx: &SharedContext,
    sip: &SipConfig,
    egress: &EgressConfig,
) -> Option<DateTime<Utc>> {
    let Some(destination) = ctx.read(|c| c.text("destination")) else {
        tracing::warn!("No destination in call context; not placing a call");
        return None;
    };

    let Some(trunk_id) = sip.trunk_id.clone().filter(|t| !t.is_empty()) else {
        tracing::error!("SIP_TRUNK_ID is required for outbound SIP calls");
        job.shutdown("missing SIP trunk id");
        return None;
    };

    let (request, account_code) = ctx.update(|c| {
        let identity = resolve_caller_identity(c, sip, &destination);
        c.set("sip_participant_identity", identity.clone());
        c.set_default("from_identity", identity.clone());

        let account_code = c.text("account_code");
        let field = |key: &str| c.get(key).cloned().unwrap_or(Value::Null);
        let metadata = json!({
            "destination": destination,
            "account_code": field("account_code"),
            "transfer_target": field("transfer_target"),
            "from_identity": identity,
            "caller_number": field("caller_number"),
            "caller_name": field("caller_name"),
            "caller_id": field("caller_id"),
        });

        let mut headers = BTreeMap::new();
        if let Some(ref code) = account_code {
            headers.insert(ACCOUNT_CODE_HEADER.to_string(), code.clone());
        }

        let request = destination_fields(&destination).map(|fields| CreateSipParticipantRequest {
            sip_trunk_id: trunk_id.clone(),
            sip_call_to: fields.sip_call_to,
            sip_number: resolve_caller_number(c, sip),
            room_name: job.room_name.clone(),
            participant_identity: identity,
            participant_metadata: metadata.to_string(),
            headers,
            display_name: c
                .text("caller_name")
                .or_else(|| sip.display_name.clone().filter(|n| !n.is_empty())),
            wait_until_answered: true,
        });
        (request, account_code)
    });

    let Some(request) = request else {
        tracing::error!(%destination, "Destination did not resolve to a valid SIP target");
        return None;
    };
    tracing::debug!(
        %destination,
        sip_call_to = %request.sip_call_to,
        account_code = account_code.as_deref().unwrap_or(""),
        "Dialing destination"
    );

    match job.api.create_sip_participant(request).await {
        Ok(_) => {
            let connected_at = Utc::now();
            ctx.update(|c| c.set_call_connected_at(connected_at));
            start_recording(job, ctx, egress, true).await;
            tracing::info!(%destination, trunk = %trunk_id, "Outbound SIP call connected");
            Some(connected_at)
        }
        Err(e @ ApiError::Twirp { .. }) => {
            tracing::error!(
                sip_status_code = e.meta("sip_status_code").unwrap_or("-"),
                sip_status = e.meta("sip_status").unwrap_or("-"),
                "Failed to create SIP participant: {e}"
            );
            job.shutdown("SIP participant creation failed");
            None
        }
        Err(e) => {
            tracing::error!("Unexpected error creating SIP participant: {e}");
            job.shutdown("SIP participant creation failed");
            None
        }
    }
}

/// Start a room recording when object storage is configured. Failures are
/// logged and leave the context without an egress record.
pub async fn start_recording(
    job: &JobContext,
    ctx: &SharedContext,
    egress: &EgressConfig,
    audio_only: bool,
) {
    let Some(storage) = egress.storage() else {
        tracing::warn!("EGRESS_* settings incomplete; skipping recording");
        return;
    };

    let file_type = if audio_only {
        EncodedFileType::Mp3
    } else {
        EncodedFileType::Mp4
    };
    let segment = egress
        .room_prefix
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(&job.room_name);

    let request = RoomCompositeEgressRequest {
        room_name: job.room_name.clone(),
        layout: RECORDING_LAYOUT.to_string(),
        audio_only,
        file_outputs: vec![EncodedFileOutput {
            file_type,
            filepath: format!(
                "{}/{segment}_{{time}}.{}",
                egress.path_prefix,
                file_type.extension()
            ),
            s3: S3Upload {
                access_key: storage.access_key.to_string(),
                secret: storage.secret_key.to_string(),
                bucket: storage.bucket.to_string(),
                endpoint: storage.endpoint.to_string(),
                region: egress.region.clone(),
                force_path_style: egress.force_path_style,
            },
        }],
    };

    let info = match job.api.start_room_composite_egress(request).await {
        Ok(info) => info,
        Err(e) => {
            tracing::error!("Failed to start egress: {e}");
            return;
        }
    };

    tracing::info!(
        egress_id = %info.egress_id,
        room = %job.room_name,
        status = info.status_text().as_deref().unwrap_or("-"),
        "Started call recording"
    );
    ctx.update(|c| {
        c.set_egress(EgressState {
            egress_id: info.egress_id.clone(),
            status: info.status_text(),
            started_at: Some(Utc::now()),
            error: info.error_text(),
            ..EgressState::default()
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::call::testing::FakeApi;
    use crate::context::CallContext;

    fn setup(metadata: Value) -> (Arc<FakeApi>, JobContext, SharedContext) {
        let api = Arc::new(FakeApi::default());
        let job = JobContext::new("outbound-abc123".into(), "AJ_1".into(), api.clone());
        let ctx = SharedContext::new(CallContext::new(metadata.as_object().cloned().unwrap()));
        (api, job, ctx)
    }

    fn trunk() -> SipConfig {
        SipConfig {
            trunk_id: Some("ST_trunk".into()),
            ..SipConfig::default()
        }
    }

    fn storage() -> EgressConfig {
        EgressConfig {
            endpoint: Some("https://s3.example.com".into()),
            bucket: Some("calls".into()),
            access_key: Some("ak".into()),
            secret_key: Some("sk".into()),
            ..EgressConfig::default()
        }
    }

    #[tokio::test]
    async fn places_call_with_account_header_and_fallback_identity() {
        let (api, job, ctx) =
            setup(json!({"destination": "+61123456789", "account_code": "ACC1"}));

        let connected = initiate_outbound_call(&job, &ctx, &trunk(), &EgressConfig::default()).await;
        assert!(connected.is_some());

        let requests = api.sip_requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.sip_call_to, "+61123456789");
        assert_eq!(req.sip_trunk_id, "ST_trunk");
        assert_eq!(req.room_name, "outbound-abc123");
        assert!(req.wait_until_answered);
        assert_eq!(req.headers.get("X-Account-Code").map(String::as_str), Some("ACC1"));
        assert_eq!(req.participant_identity, "+61123456789");

        let metadata: Value = serde_json::from_str(&req.participant_metadata).unwrap();
        assert_eq!(metadata["from_identity"], json!("+61123456789"));
        assert_eq!(metadata["account_code"], json!("ACC1"));
        assert_eq!(metadata["transfer_target"], Value::Null);

        ctx.read(|c| {
            assert_eq!(c.text("sip_participant_identity").as_deref(), Some("+61123456789"));
            assert_eq!(c.text("from_identity").as_deref(), Some("+61123456789"));
            assert!(c.get("call_connected_at").is_some());
            assert!(c.egress().is_none());
        });
        assert!(!job.is_shutting_down());
    }

    #[tokio::test]
    async fn caller_name_becomes_display_name() {
        let (api, job, ctx) = setup(json!({
            "destination": "sip:bob@pbx.example.com",
            "caller_name": "TM Mobile",
            "caller_number": "+61299990000",
        }));
        let sip = SipConfig {
            display_name: Some("Fallback".into()),
            ..trunk()
        };

        initiate_outbound_call(&job, &ctx, &sip, &EgressConfig::default()).await;

        let req = &api.sip_requests()[0];
        assert_eq!(req.sip_call_to, "bob@pbx.example.com");
        assert_eq!(req.display_name.as_deref(), Some("TM Mobile"));
        assert_eq!(req.sip_number.as_deref(), Some("+61299990000"));
        assert!(req.headers.is_empty());
    }

    #[tokio::test]
    async fn missing_destination_places_nothing() {
        let (api, job, ctx) = setup(json!({"account_code": "ACC1"}));
        assert!(initiate_outbound_call(&job, &ctx, &trunk(), &storage()).await.is_none());
        assert!(api.sip_requests().is_empty());
        assert!(!job.is_shutting_down());
    }

    #[tokio::test]
    async fn missing_trunk_shuts_job_down() {
        let (api, job, ctx) = setup(json!({"destination": "+61123456789"}));
        let result =
            initiate_outbound_call(&job, &ctx, &SipConfig::default(), &storage()).await;
        assert!(result.is_none());
        assert!(api.sip_requests().is_empty());
        assert!(job.is_shutting_down());
    }

    #[tokio::test]
    async fn dial_failure_shuts_job_down() {
        let (api, job, ctx) = setup(json!({"destination": "+61123456789"}));
        api.fail_sip(ApiError::Twirp {
            status: 400,
            code: "unavailable".into(),
            message: "busy".into(),
            meta: HashMap::from([("sip_status_code".to_string(), "486".to_string())]),
        });

        assert!(initiate_outbound_call(&job, &ctx, &trunk(), &storage()).await.is_none());
        assert!(job.is_shutting_down());
        assert!(api.egress_starts().is_empty());
        ctx.read(|c| assert!(c.get("call_connected_at").is_none()));
    }

    #[tokio::test]
    async fn answered_call_starts_audio_recording() {
        let (api, job, ctx) = setup(json!({"destination": "+61123456789"}));

        initiate_outbound_call(&job, &ctx, &trunk(), &storage()).await;

        let starts = api.egress_starts();
        assert_eq!(starts.len(), 1);
        assert!(starts[0].audio_only);
        assert_eq!(starts[0].layout, "speaker-dark");
        let output = &starts[0].file_outputs[0];
        assert_eq!(output.file_type, EncodedFileType::Mp3);
        assert_eq!(output.filepath, "call-recordings/outbound-abc123_{time}.mp3");
        assert_eq!(output.s3.region, "us-004");

        ctx.read(|c| {
            let egress = c.egress().unwrap();
            assert_eq!(egress.egress_id, "EG_test");
            assert_eq!(egress.status.as_deref(), Some("EGRESS_STARTING"));
            assert!(egress.started_at.is_some());
            assert_eq!(c.text("egress_id").as_deref(), Some("EG_test"));
        });
    }

    #[tokio::test]
    async fn room_prefix_replaces_room_segment() {
        let (api, job, ctx) = setup(json!({}));
        let egress = EgressConfig {
            room_prefix: Some("tm-mobile".into()),
            ..storage()
        };

        start_recording(&job, &ctx, &egress, false).await;

        let output = &api.egress_starts()[0].file_outputs[0];
        assert_eq!(output.file_type, EncodedFileType::Mp4);
        assert_eq!(output.filepath, "call-recordings/tm-mobile_{time}.mp4");
    }
}
