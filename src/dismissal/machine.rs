//! The per-firing dismissal state machine.
//!
//! `Firing -> AwaitingConfirmation -> {Dismissed, Snoozed, Expired}`.
//! Transitions are a pure function of the current state and one input;
//! [`DismissalStateMachine::run`] only turns channels and timers into
//! inputs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use super::matcher::{KeywordMatch, VoiceMatcher};
use crate::config::DismissalConfig;
use crate::model::{AlarmId, DismissMethod, OutcomeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Dismiss,
    Snooze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DismissalState {
    Firing,
    AwaitingConfirmation { listening: bool },
    Dismissed { method: DismissMethod },
    Snoozed,
    Expired,
}

impl DismissalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dismissed { .. } | Self::Snoozed | Self::Expired)
    }

    pub fn outcome(&self) -> Option<OutcomeKind> {
        match self {
            Self::Dismissed { .. } => Some(OutcomeKind::Dismissed),
            Self::Snoozed => Some(OutcomeKind::Snoozed),
            Self::Expired => Some(OutcomeKind::Expired),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<DismissMethod> {
        match self {
            Self::Dismissed { method } => Some(*method),
            Self::Snoozed => Some(DismissMethod::Explicit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DismissalInput {
    /// The ringtone started; voice listening opens.
    Ringing,
    Action(UserAction),
    Transcript(String),
    VoiceWindowClosed,
    HardTimeout,
}

/// Next state for `input`, or `None` when the input is ignored in `state`.
pub fn transition(
    state: DismissalState,
    input: &DismissalInput,
    matcher: &VoiceMatcher,
) -> Option<DismissalState> {
    use DismissalState::*;

    if state.is_terminal() {
        return None;
    }
    match (state, input) {
        (Firing, DismissalInput::Ringing) => Some(AwaitingConfirmation { listening: true }),
        (_, DismissalInput::Action(UserAction::Dismiss)) => Some(Dismissed {
            method: DismissMethod::Explicit,
        }),
        (_, DismissalInput::Action(UserAction::Snooze)) => Some(Snoozed),
        (AwaitingConfirmation { listening: true }, DismissalInput::Transcript(text)) => {
            matcher.best_match(text).map(|_| Dismissed {
                method: DismissMethod::Voice,
            })
        }
        (AwaitingConfirmation { listening: true }, DismissalInput::VoiceWindowClosed) => {
            Some(AwaitingConfirmation { listening: false })
        }
        (_, DismissalInput::HardTimeout) => Some(Expired),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DismissalTiming {
    pub voice_window: Duration,
    pub hard_timeout: Duration,
}

impl From<&DismissalConfig> for DismissalTiming {
    fn from(config: &DismissalConfig) -> Self {
        Self {
            voice_window: Duration::from_secs(config.voice_window_secs),
            hard_timeout: Duration::from_secs(config.hard_timeout_secs),
        }
    }
}

/// How one firing ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: DismissalState,
    pub latency: Duration,
    pub heard: Option<KeywordMatch>,
}

pub struct DismissalStateMachine {
    alarm_id: AlarmId,
    matcher: Arc<VoiceMatcher>,
    timing: DismissalTiming,
    state: watch::Sender<DismissalState>,
}

impl DismissalStateMachine {
    pub fn new(
        alarm_id: AlarmId,
        matcher: Arc<VoiceMatcher>,
        timing: DismissalTiming,
    ) -> (Self, watch::Receiver<DismissalState>) {
        let (state, rx) = watch::channel(DismissalState::Firing);
        (
            Self {
                alarm_id,
                matcher,
                timing,
                state,
            },
            rx,
        )
    }

    pub fn state(&self) -> DismissalState {
        *self.state.borrow()
    }

    /// Feed one input. Returns whether the state changed.
    pub fn apply(&self, input: &DismissalInput) -> bool {
        let current = self.state();
        match transition(current, input, &self.matcher) {
            Some(next) if next != current => {
                debug!("Alarm {} dismissal: {current:?} -> {next:?}", self.alarm_id);
                self.state.send_replace(next);
                true
            }
            _ => false,
        }
    }

    /// Drive the machine until a terminal state. Explicit actions race the
    /// voice transcripts; the transcript receiver is dropped when the voice
    /// window closes, which stops the listener. Explicit input is accepted
    /// until the hard timeout.
    pub async fn run(
        self,
        mut actions: mpsc::Receiver<UserAction>,
        transcripts: mpsc::Receiver<String>,
    ) -> Resolution {
        let started = Instant::now();
        self.apply(&DismissalInput::Ringing);

        let mut transcripts = Some(transcripts);
        let mut actions_open = true;
        let mut heard = None;
        let voice_window = tokio::time::sleep(self.timing.voice_window);
        let hard_timeout = tokio::time::sleep(self.timing.hard_timeout);
        tokio::pin!(voice_window, hard_timeout);

        while !self.state().is_terminal() {
            tokio::select! {
                biased;

                action = actions.recv(), if actions_open => match action {
                    Some(action) => {
                        self.apply(&DismissalInput::Action(action));
                    }
                    None => actions_open = false,
                },
                text = recv_transcript(&mut transcripts), if transcripts.is_some() => match text {
                    Some(text) => {
                        let hit = self.matcher.best_match(&text);
                        if self.apply(&DismissalInput::Transcript(text.clone())) {
                            heard = hit;
                        } else {
                            debug!("Alarm {}: {text:?} is not a dismissal phrase", self.alarm_id);
                        }
                    }
                    None => transcripts = None,
                },
                _ = &mut voice_window, if transcripts.is_some() => {
                    debug!("Alarm {}: voice window closed", self.alarm_id);
                    transcripts = None;
                    self.apply(&DismissalInput::VoiceWindowClosed);
                },
                _ = &mut hard_timeout => {
                    self.apply(&DismissalInput::HardTimeout);
                },
            }
        }

        let state = self.state();
        let latency = started.elapsed();
        info!(
            "Alarm {} resolved as {state:?} after {}ms",
            self.alarm_id,
            latency.as_millis()
        );
        Resolution { state, latency, heard }
    }
}

async fn recv_transcript(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> Arc<VoiceMatcher> {
        Arc::new(VoiceMatcher::from(&DismissalConfig::default()))
    }

    fn timing(voice_ms: u64, hard_ms: u64) -> DismissalTiming {
        DismissalTiming {
            voice_window: Duration::from_millis(voice_ms),
            hard_timeout: Duration::from_millis(hard_ms),
        }
    }

    #[test]
    fn transitions() {
        let m = matcher();
        let listening = DismissalState::AwaitingConfirmation { listening: true };
        let deaf = DismissalState::AwaitingConfirmation { listening: false };

        assert_eq!(
            transition(DismissalState::Firing, &DismissalInput::Ringing, &m),
            Some(listening)
        );
        assert_eq!(
            transition(listening, &DismissalInput::Transcript("I'm up".into()), &m),
            Some(DismissalState::Dismissed {
                method: DismissMethod::Voice
            })
        );
        assert_eq!(
            transition(listening, &DismissalInput::Transcript("ten more minutes".into()), &m),
            None
        );
        assert_eq!(transition(deaf, &DismissalInput::Transcript("I'm up".into()), &m), None);
        assert_eq!(
            transition(deaf, &DismissalInput::Action(UserAction::Snooze), &m),
            Some(DismissalState::Snoozed)
        );
        assert_eq!(
            transition(deaf, &DismissalInput::HardTimeout, &m),
            Some(DismissalState::Expired)
        );
        assert_eq!(
            transition(DismissalState::Expired, &DismissalInput::Action(UserAction::Dismiss), &m),
            None
        );
    }

    #[tokio::test]
    async fn voice_dismissal_within_window() {
        let (machine, state) = DismissalStateMachine::new(AlarmId::new(), matcher(), timing(500, 5_000));
        let (_actions_tx, actions) = mpsc::channel(4);
        let (voice_tx, transcripts) = mpsc::channel(4);

        let run = tokio::spawn(machine.run(actions, transcripts));
        voice_tx.send("hmm what".into()).await.unwrap();
        voice_tx.send("I'm up".into()).await.unwrap();
        let resolution = run.await.unwrap();

        assert_eq!(
            resolution.state,
            DismissalState::Dismissed {
                method: DismissMethod::Voice
            }
        );
        assert_eq!(resolution.heard.unwrap().keyword, "im up");
        assert_eq!(*state.borrow(), resolution.state);
    }

    #[tokio::test]
    async fn explicit_action_after_voice_window_closes() {
        let (machine, mut state) = DismissalStateMachine::new(AlarmId::new(), matcher(), timing(30, 5_000));
        let (actions_tx, actions) = mpsc::channel(4);
        let (voice_tx, transcripts) = mpsc::channel(4);

        let run = tokio::spawn(machine.run(actions, transcripts));
        state
            .wait_for(|s| *s == DismissalState::AwaitingConfirmation { listening: false })
            .await
            .unwrap();
        assert!(voice_tx.send("I'm up".into()).await.is_err());

        actions_tx.send(UserAction::Snooze).await.unwrap();
        let resolution = run.await.unwrap();
        assert_eq!(resolution.state, DismissalState::Snoozed);
        assert!(resolution.heard.is_none());
    }

    #[tokio::test]
    async fn expires_without_input() {
        let (machine, _state) = DismissalStateMachine::new(AlarmId::new(), matcher(), timing(20, 80));
        let (_actions_tx, actions) = mpsc::channel(4);
        let (_voice_tx, transcripts) = mpsc::channel(4);

        let resolution = machine.run(actions, transcripts).await;
        assert_eq!(resolution.state, DismissalState::Expired);
        assert!(resolution.latency >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn dropped_action_channel_still_expires() {
        let (machine, _state) = DismissalStateMachine::new(AlarmId::new(), matcher(), timing(10, 50));
        let (actions_tx, actions) = mpsc::channel(1);
        let (voice_tx, transcripts) = mpsc::channel(1);
        drop(actions_tx);
        drop(voice_tx);

        let resolution = machine.run(actions, transcripts).await;
        assert_eq!(resolution.state, DismissalState::Expired);
    }
}
