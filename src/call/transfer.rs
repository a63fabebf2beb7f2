use chrono::Utc;

use crate::call::hangup::CallControl;
use crate::context::SharedContext;
use crate::livekit::TransferSipParticipantRequest;
use crate::resolve::transfer_target_uri;

const ANNOUNCEMENT: &str = "Let the caller know that you are transferring them to another agent.";

/// Result of a transfer attempt. Refusals are reported to the model, which
/// relays them to the caller in its own words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    NoTarget,
    Unavailable,
    Failed,
    Initiated,
}

impl TransferOutcome {
    pub fn message(self) -> &'static str {
        match self {
            TransferOutcome::NoTarget => "No transfer target is configured for this call.",
            TransferOutcome::Unavailable => "I cannot transfer the call right now.",
            TransferOutcome::Failed => "I could not transfer the call.",
            TransferOutcome::Initiated => "Transfer initiated.",
        }
    }
}

/// Hand the caller off to the configured human agent.
///
/// The announcement has finished playing before the transfer request goes
/// out, and `transfer_in_progress` is set before the request so the duration
/// monitor cannot cut the call while the platform is transferring it.
pub async fn transfer_call(ctx: &SharedContext, control: &CallControl) -> TransferOutcome {
    let Some(target) = ctx.read(|c| c.text("transfer_target")) else {
        tracing::warn!("Transfer requested without transfer_target in context");
        return TransferOutcome::NoTarget;
    };

    if control.job.is_shutting_down() {
        tracing::warn!("Transfer requested after job shutdown");
        return TransferOutcome::Unavailable;
    }

    let Some(identity) = ctx.read(|c| c.text("sip_participant_identity")) else {
        tracing::warn!("Transfer requested without SIP participant identity");
        return TransferOutcome::Unavailable;
    };

    let Some(uri) = transfer_target_uri(&target) else {
        tracing::error!(%target, "Transfer target is invalid");
        return TransferOutcome::Unavailable;
    };

    match control.session.generate_reply(ANNOUNCEMENT).await {
        Ok(speech) => speech.wait_for_playout().await,
        Err(e) => tracing::warn!("Failed to announce transfer: {e}"),
    }

    ctx.update(|c| c.begin_transfer(Utc::now()));
    tracing::info!(%uri, participant = %identity, "Transferring caller");

    let request = TransferSipParticipantRequest {
        room_name: control.job.room_name.clone(),
        participant_identity: identity,
        transfer_to: uri,
    };
    match control.job.api.transfer_sip_participant(request).await {
        Ok(()) => TransferOutcome::Initiated,
        Err(e) => {
            tracing::error!("Failed to transfer SIP participant: {e}");
            ctx.update(|c| c.abort_transfer());
            TransferOutcome::Failed
        }
    }
}
