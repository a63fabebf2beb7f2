use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::call::hangup::CallControl;
use crate::call::tasks::TaskGroup;
use crate::call::transcript::Transcript;
use crate::context::SharedContext;

/// Phrases that mark an answering machine greeting. Matched as lowercase
/// substrings of each final user transcript.
pub const VOICEMAIL_KEYWORDS: &[&str] = &[
    "leave a message",
    "voice mail system",
    "voicemail system",
    "is not available",
    "please leave your name",
    "after the tone",
    "at the tone",
    "record your message",
    "record your name",
    "can't take your call",
    "unable to take your call",
    "message bank",
    "leave your details",
    "no one is available",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Keywords,
    Silence,
}

impl Trigger {
    pub fn reason(self) -> &'static str {
        match self {
            Trigger::Keywords => "Voicemail keywords detected",
            Trigger::Silence => "No human speech detected during greeting",
        }
    }
}

pub fn matches_voicemail(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    VOICEMAIL_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Decides once per call whether a human or a machine answered.
///
/// The keyword trigger and the silence timer race; whichever resolves first
/// wins and every later trigger is a no-op. A voicemail decision ends the
/// call with a strict hangup.
pub struct VoicemailArbitrator {
    ctx: SharedContext,
    control: CallControl,
    transcript: Transcript,
    tasks: TaskGroup,
    decided: AtomicBool,
    human_spoke: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

impl VoicemailArbitrator {
    pub fn new(
        ctx: SharedContext,
        control: CallControl,
        transcript: Transcript,
        tasks: TaskGroup,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            control,
            transcript,
            tasks,
            decided: AtomicBool::new(false),
            human_spoke: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::SeqCst)
    }

    pub fn human_spoke(&self) -> bool {
        self.human_spoke.load(Ordering::SeqCst)
    }

    /// Start the greeting silence timer.
    pub fn start_silence_timer(self: &Arc<Self>, timeout: Duration) {
        let this = Arc::clone(self);
        let token = self.tasks.spawn("voicemail-timeout", async move {
            tokio::time::sleep(timeout).await;
            if !this.human_spoke() && !this.is_decided() {
                this.resolve(Trigger::Silence).await;
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        tracing::debug!(timeout_secs = timeout.as_secs_f64(), "Voicemail silence timer started");
    }

    /// Handle a transcribed user utterance. Never blocks; a keyword match
    /// hands the hangup to a background task.
    pub fn on_user_transcribed(
        self: &Arc<Self>,
        transcript: &str,
        is_final: bool,
        language: Option<String>,
    ) {
        if self.is_decided() || !is_final {
            return;
        }
        let text = transcript.trim();
        if text.is_empty() {
            return;
        }

        self.transcript.push_user(text, language);

        if matches_voicemail(text) {
            tracing::info!(transcript = %text, "Voicemail greeting recognised");
            let this = Arc::clone(self);
            self.tasks.spawn("voicemail-hangup", async move {
                this.resolve(Trigger::Keywords).await;
            });
            return;
        }
        self.human_spoke.store(true, Ordering::SeqCst);
    }

    /// Settle on voicemail. Returns false when the call was already decided.
    pub async fn resolve(&self, trigger: Trigger) -> bool {
        if self
            .decided
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let reason = trigger.reason();
        tracing::info!(reason, "Voicemail detected");
        self.ctx.update(|c| c.mark_voicemail(reason));

        // The timer must not cancel itself while it is running this hangup.
        if trigger != Trigger::Silence {
            let timer = self
                .timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(token) = timer {
                token.cancel();
            }
        }

        self.control.hangup(reason, true).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::hangup::JobContext;
    use crate::call::testing::{FakeApi, FakeSession};
    use crate::context::CallContext;

    struct Harness {
        api: Arc<FakeApi>,
        session: Arc<FakeSession>,
        ctx: SharedContext,
        transcript: Transcript,
        tasks: TaskGroup,
        arbitrator: Arc<VoicemailArbitrator>,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeApi::default());
        let session = Arc::new(FakeSession::default());
        let job = Arc::new(JobContext::new("room-vm".into(), "AJ_vm".into(), api.clone()));
        let ctx = SharedContext::new(CallContext::default());
        let transcript = Transcript::new();
        let tasks = TaskGroup::new();
        let arbitrator = VoicemailArbitrator::new(
            ctx.clone(),
            CallControl::new(job, session.clone()),
            transcript.clone(),
            tasks.clone(),
        );
        Harness {
            api,
            session,
            ctx,
            transcript,
            tasks,
            arbitrator,
        }
    }

    #[test]
    fn keyword_matching_is_case_insensitive() {
        assert!(matches_voicemail("Please LEAVE A MESSAGE after the beep"));
        assert!(matches_voicemail("Sorry, I can't take your call right now"));
        assert!(!matches_voicemail("Yes, speaking. Who is this?"));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timeout_hangs_up_strictly() {
        let h = harness();
        h.arbitrator.start_silence_timer(Duration::from_secs(8));

        tokio::time::sleep(Duration::from_secs(9)).await;

        assert!(h.arbitrator.is_decided());
        assert_eq!(h.session.shutdowns(), vec![false]);
        assert_eq!(h.api.deleted_rooms(), vec!["room-vm".to_string()]);
        h.ctx.read(|c| {
            assert!(c.voicemail_detected());
            assert_eq!(
                c.text("voicemail_reason").as_deref(),
                Some("No human speech detected during greeting")
            );
        });
        h.tasks.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn human_speech_disarms_timer() {
        let h = harness();
        h.arbitrator.start_silence_timer(Duration::from_secs(8));
        h.arbitrator.on_user_transcribed("Hello, who's calling?", true, Some("en".into()));

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(!h.arbitrator.is_decided());
        assert!(h.arbitrator.human_spoke());
        assert!(h.session.shutdowns().is_empty());
        assert_eq!(h.transcript.len(), 1);
        h.tasks.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interim_and_blank_transcripts_are_ignored() {
        let h = harness();
        h.arbitrator.on_user_transcribed("leave a", false, None);
        h.arbitrator.on_user_transcribed("   ", true, None);

        assert!(!h.arbitrator.human_spoke());
        assert_eq!(h.transcript.len(), 0);
        h.tasks.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_and_timeout_hang_up_once() {
        let h = harness();
        h.arbitrator.start_silence_timer(Duration::from_secs(8));
        h.arbitrator
            .on_user_transcribed("The person you called is not available", true, None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.arbitrator
            .on_user_transcribed("Please leave a message after the tone", true, None);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.session.shutdowns(), vec![false]);
        assert_eq!(h.api.deleted_rooms().len(), 1);
        h.ctx.read(|c| {
            assert_eq!(
                c.text("voicemail_reason").as_deref(),
                Some("Voicemail keywords detected")
            );
        });
        assert_eq!(h.transcript.len(), 1);
        h.tasks.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_triggers_are_noops() {
        let h = harness();
        assert!(h.arbitrator.resolve(Trigger::Silence).await);
        assert!(!h.arbitrator.resolve(Trigger::Keywords).await);
        assert!(!h.arbitrator.resolve(Trigger::Silence).await);

        h.arbitrator.on_user_transcribed("leave your details", true, None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.session.shutdowns().len(), 1);
        h.ctx.read(|c| {
            assert_eq!(
                c.text("voicemail_reason").as_deref(),
                Some("No human speech detected during greeting")
            )
        });
        h.tasks.cancel_all().await;
    }
}
