//! Turns host fire events into dismissal sessions and settles them.
//!
//! One session per ringing alarm. The session owns the state machine's
//! input channels; the write surface (`dismiss`, `snooze`, `submit_voice`)
//! only sends into them.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::machine::{DismissalState, DismissalStateMachine, DismissalTiming, Resolution, UserAction};
use super::matcher::VoiceMatcher;
use crate::audio::AudioFormat;
use crate::cache::AudioCache;
use crate::clock::SharedClock;
use crate::error::ErrorKind;
use crate::events::{CoreEvent, EventBus};
use crate::history::{HistoryEntry, HistoryLog};
use crate::model::{
    Alarm, AlarmId, DismissalRecord, ExternalSchedulerHandle, HandleStatus, HostAlarmConfig, OutcomeKind,
};
use crate::reconcile::{FireEvent, ReconciliationManager};
use crate::repository::AlarmRepository;
use crate::scheduling::SchedulingService;
use crate::sounder::{Ringtone, Sounder};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DismissalError {
    #[error("alarm {0} is not ringing")]
    NotRinging(AlarmId),

    #[error("voice listening for alarm {0} has ended")]
    ListenerClosed(AlarmId),
}

impl DismissalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRinging(_) => ErrorKind::NotFound,
            Self::ListenerClosed(_) => ErrorKind::Validation,
        }
    }
}

struct Session {
    actions: mpsc::Sender<UserAction>,
    transcripts: mpsc::Sender<String>,
    state: watch::Receiver<DismissalState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingingAlarm {
    pub alarm_id: AlarmId,
    pub state: DismissalState,
}

pub struct DismissalCoordinator {
    scheduling: Arc<SchedulingService>,
    repo: Arc<AlarmRepository>,
    cache: Arc<AudioCache>,
    reconciler: Arc<ReconciliationManager>,
    events: Arc<EventBus>,
    sounder: Arc<dyn Sounder>,
    history: Arc<HistoryLog>,
    clock: SharedClock,
    matcher: Arc<VoiceMatcher>,
    timing: DismissalTiming,
    fallback: Bytes,
    sessions: DashMap<AlarmId, Session>,
}

impl DismissalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduling: Arc<SchedulingService>,
        cache: Arc<AudioCache>,
        reconciler: Arc<ReconciliationManager>,
        events: Arc<EventBus>,
        sounder: Arc<dyn Sounder>,
        history: Arc<HistoryLog>,
        clock: SharedClock,
        matcher: VoiceMatcher,
        timing: DismissalTiming,
        fallback: Bytes,
    ) -> Self {
        let repo = Arc::clone(scheduling.repository());
        Self {
            scheduling,
            repo,
            cache,
            reconciler,
            events,
            sounder,
            history,
            clock,
            matcher: Arc::new(matcher),
            timing,
            fallback,
            sessions: DashMap::new(),
        }
    }

    /// Consume the host's fire-event stream until it closes.
    pub async fn run(self: Arc<Self>, mut fires: mpsc::UnboundedReceiver<FireEvent>) {
        while let Some(event) = fires.recv().await {
            self.handle_fire(event).await;
        }
        info!("Fire event stream closed");
    }

    /// Start ringing and open a dismissal session. Returns the task that
    /// settles the session, or `None` when the event is a duplicate or
    /// names no known alarm.
    pub async fn handle_fire(self: &Arc<Self>, event: FireEvent) -> Option<JoinHandle<Option<DismissalRecord>>> {
        let alarm = match self.repo.get(event.alarm_id).await {
            Some(alarm) => alarm,
            None => match self.repo.find_by_host_id(&event.host_id).await {
                Some(alarm) => alarm,
                None => {
                    warn!(
                        "Host entry {} fired for unknown alarm {}, leaving it to reconciliation",
                        event.host_id, event.alarm_id
                    );
                    return None;
                }
            },
        };

        let (machine, state) = DismissalStateMachine::new(alarm.id, Arc::clone(&self.matcher), self.timing);
        let (actions_tx, actions_rx) = mpsc::channel(4);
        let (voice_tx, voice_rx) = mpsc::channel(16);
        match self.sessions.entry(alarm.id) {
            Entry::Occupied(_) => {
                debug!("Alarm {} is already ringing, ignoring duplicate fire", alarm.id);
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(Session {
                    actions: actions_tx,
                    transcripts: voice_tx,
                    state,
                });
            }
        }

        info!("Alarm {} ({:?}) fired", alarm.id, alarm.label);
        if let Err(e) = self.scheduling.mark_fired(alarm.id, event.fired_at).await {
            warn!("Failed to record firing of {}: {e}", alarm.id);
        }

        let ringtone = self.ringtone(&alarm).await;
        let used_fallback = ringtone.fallback;
        if let Err(e) = self.sounder.start(&ringtone).await {
            warn!("Sounder failed for alarm {}: {e}", alarm.id);
        }
        self.events.publish(CoreEvent::Ringing {
            alarm_id: alarm.id,
            fallback: used_fallback,
        });

        let handle = active_handle(&alarm, &event);
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let resolution = machine.run(actions_rx, voice_rx).await;
            this.finish(alarm, handle, event, used_fallback, resolution).await
        }))
    }

    /// Cached generated audio when present, otherwise the fallback chime.
    async fn ringtone(&self, alarm: &Alarm) -> Ringtone {
        if let Some(content) = &alarm.content {
            match self.cache.get(&content.cache_key).await {
                Ok(Some(bytes)) => {
                    return Ringtone {
                        alarm_id: alarm.id,
                        bytes,
                        format: content.format,
                        fallback: false,
                    }
                }
                Ok(None) => warn!("Audio for alarm {} is no longer cached, using fallback tone", alarm.id),
                Err(e) => warn!("Reading cached audio for {} failed: {e}, using fallback tone", alarm.id),
            }
        } else {
            debug!("Alarm {} has no generated content, using fallback tone", alarm.id);
        }
        Ringtone {
            alarm_id: alarm.id,
            bytes: self.fallback.clone(),
            format: AudioFormat::Wav,
            fallback: true,
        }
    }

    async fn finish(
        &self,
        alarm: Alarm,
        handle: ExternalSchedulerHandle,
        event: FireEvent,
        used_fallback: bool,
        resolution: Resolution,
    ) -> Option<DismissalRecord> {
        self.sessions.remove(&alarm.id);
        self.sounder.stop(alarm.id).await;

        let Some(outcome) = resolution.state.outcome() else {
            warn!("Alarm {} left its session unresolved", alarm.id);
            return None;
        };
        let now = self.clock.now();
        let record = DismissalRecord {
            outcome,
            method: resolution.state.method(),
            latency_ms: resolution.latency.as_millis() as u64,
            fired_at: event.fired_at,
            resolved_at: now,
            used_fallback,
        };

        if let Err(e) = self.reconciler.cancel(&handle, true).await {
            warn!("Failed to silence host entry {}: {e}", handle.host_id);
        }

        if outcome == OutcomeKind::Snoozed {
            if let Err(e) = self.scheduling.snooze_from(alarm.id, now).await {
                warn!("Snooze for alarm {} failed: {e}", alarm.id);
            }
        }

        let heard = resolution.heard.map(|m| m.heard);
        self.history.append(&HistoryEntry::new(&alarm, &record, heard));
        self.events.publish(CoreEvent::Dismissal {
            alarm_id: alarm.id,
            record: record.clone(),
        });

        if let Err(e) = self.scheduling.complete_firing(alarm.id, record.clone()).await {
            warn!("Settling alarm {} after {outcome:?} failed: {e}", alarm.id);
        }
        Some(record)
    }

    pub async fn dismiss(&self, alarm_id: AlarmId) -> Result<(), DismissalError> {
        self.send_action(alarm_id, UserAction::Dismiss).await
    }

    pub async fn snooze(&self, alarm_id: AlarmId) -> Result<(), DismissalError> {
        self.send_action(alarm_id, UserAction::Snooze).await
    }

    async fn send_action(&self, alarm_id: AlarmId, action: UserAction) -> Result<(), DismissalError> {
        let sender = self
            .sessions
            .get(&alarm_id)
            .map(|s| s.actions.clone())
            .ok_or(DismissalError::NotRinging(alarm_id))?;
        sender
            .send(action)
            .await
            .map_err(|_| DismissalError::NotRinging(alarm_id))
    }

    /// Hand a speech transcript to the ringing alarm's voice listener.
    pub async fn submit_voice(&self, alarm_id: AlarmId, transcript: String) -> Result<(), DismissalError> {
        let sender = self
            .sessions
            .get(&alarm_id)
            .map(|s| s.transcripts.clone())
            .ok_or(DismissalError::NotRinging(alarm_id))?;
        sender
            .send(transcript)
            .await
            .map_err(|_| DismissalError::ListenerClosed(alarm_id))
    }

    pub fn session_state(&self, alarm_id: AlarmId) -> Option<DismissalState> {
        self.sessions.get(&alarm_id).map(|s| *s.state.borrow())
    }

    /// Wait until the session's state satisfies `f`. Returns `None` when
    /// the alarm is not ringing or the session ended first.
    pub async fn wait_for_state(
        &self,
        alarm_id: AlarmId,
        f: impl FnMut(&DismissalState) -> bool,
    ) -> Option<DismissalState> {
        let mut rx = self.sessions.get(&alarm_id).map(|s| s.state.clone())?;
        let state = rx.wait_for(f).await.ok()?;
        Some(*state)
    }

    pub fn ringing(&self) -> Vec<RingingAlarm> {
        self.sessions
            .iter()
            .map(|s| RingingAlarm {
                alarm_id: *s.key(),
                state: *s.state.borrow(),
            })
            .collect()
    }
}

/// The handle of the entry that fired. Falls back to one built from the
/// event when the stored handle already points elsewhere.
fn active_handle(alarm: &Alarm, event: &FireEvent) -> ExternalSchedulerHandle {
    match alarm.valid_handle() {
        Some(handle) if handle.host_id == event.host_id => handle.clone(),
        _ => ExternalSchedulerHandle {
            host_id: event.host_id.clone(),
            pushed: HostAlarmConfig {
                alarm_id: alarm.id,
                fire_at: event.fired_at,
                label: alarm.label.clone(),
            },
            status: HandleStatus::Live,
            pushed_at: event.fired_at,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::generation::TextGenError;
    use crate::model::{DismissMethod, ScheduleState, Tone};
    use crate::scheduling::NewAlarm;
    use crate::testing::{wait_until, Harness, ScriptedSpeech, ScriptedTextGenerator};
    use chrono::{NaiveTime, Weekday};

    fn energetic_daily() -> NewAlarm {
        NewAlarm {
            label: "Ship it".into(),
            time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            timezone: Some(chrono_tz::UTC),
            date: None,
            repeat: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            tone: Tone::Energetic,
            intent_id: None,
        }
    }

    async fn wait_for_content(h: &Harness, id: AlarmId) {
        let repo = h.repo.clone();
        wait_until(move || {
            let repo = repo.clone();
            async move { repo.get(id).await.is_some_and(|a| a.content.is_some()) }
        })
        .await;
    }

    async fn fire(h: &Harness, id: AlarmId) -> JoinHandle<Option<DismissalRecord>> {
        let alarm = h.repo.get(id).await.unwrap();
        let handle = alarm.valid_handle().unwrap();
        h.clock.set(handle.pushed.fire_at);
        let event = h.host.fire(&handle.host_id).unwrap();
        h.coordinator.handle_fire(event).await.unwrap()
    }

    #[tokio::test]
    async fn voice_dismissal_of_generated_alarm() {
        let h = Harness::new().await;
        let alarm = h.service.create_alarm(energetic_daily()).await.unwrap();
        wait_for_content(&h, alarm.id).await;

        let session = fire(&h, alarm.id).await;
        let awaiting = h
            .coordinator
            .wait_for_state(alarm.id, |s| matches!(s, DismissalState::AwaitingConfirmation { .. }))
            .await;
        assert_eq!(awaiting, Some(DismissalState::AwaitingConfirmation { listening: true }));

        let played = h.sounder.started();
        assert_eq!(played.len(), 1);
        assert!(!played[0].fallback);

        h.coordinator.submit_voice(alarm.id, "I'm up".into()).await.unwrap();
        let record = session.await.unwrap().unwrap();

        assert_eq!(record.outcome, OutcomeKind::Dismissed);
        assert_eq!(record.method, Some(DismissMethod::Voice));
        let stored = h.repo.get(alarm.id).await.unwrap();
        assert_eq!(stored.last_outcome, Some(record));
        assert!(stored.last_fired_at.is_some());
        assert_eq!(stored.schedule_state, ScheduleState::Scheduled);
        assert!(h.sounder.stopped().contains(&alarm.id));
        assert_eq!(h.coordinator.session_state(alarm.id), None);
        let dates = h.history.available_dates();
        assert_eq!(dates.len(), 1);
        let logged = h.history.load(&dates[0]);
        assert_eq!(logged[0].heard.as_deref(), Some("im up"));
    }

    #[tokio::test]
    async fn failed_generation_still_rings_with_fallback() {
        let h = Harness::with_providers(
            Arc::new(ScriptedTextGenerator::failing(TextGenError::Unavailable("offline".into()))),
            Arc::new(ScriptedSpeech::new()),
        )
        .await;
        let alarm = h.service.create_alarm(energetic_daily()).await.unwrap();
        assert!(alarm.valid_handle().is_some());
        let _ = h.orchestrator.generate(alarm.id, None).await;
        assert!(h.repo.get(alarm.id).await.unwrap().content.is_none());

        let session = fire(&h, alarm.id).await;
        h.coordinator.dismiss(alarm.id).await.unwrap();
        let record = session.await.unwrap().unwrap();

        assert!(record.used_fallback);
        assert_eq!(record.method, Some(DismissMethod::Explicit));
        assert!(h.sounder.started()[0].fallback);
    }

    #[tokio::test]
    async fn snooze_creates_derived_alarm_and_keeps_recurrence() {
        let h = Harness::new().await;
        let alarm = h.service.create_alarm(energetic_daily()).await.unwrap();

        let session = fire(&h, alarm.id).await;
        h.coordinator.snooze(alarm.id).await.unwrap();
        let record = session.await.unwrap().unwrap();
        assert_eq!(record.outcome, OutcomeKind::Snoozed);

        let alarms = h.repo.list().await;
        let derived = alarms.iter().find(|a| a.derived_from == Some(alarm.id)).unwrap();
        assert!(derived.valid_handle().is_some());
        let origin = alarms.iter().find(|a| a.id == alarm.id).unwrap();
        assert_eq!(origin.snooze_count, 1);
        assert_eq!(origin.recurrence, alarm.recurrence);
        assert!(origin.enabled);

        // The snooze alarm rings once and then disappears.
        let snoozed = fire(&h, derived.id).await;
        h.coordinator.dismiss(derived.id).await.unwrap();
        snoozed.await.unwrap().unwrap();
        assert!(h.repo.get(derived.id).await.is_none());
        let origin = h.repo.get(alarm.id).await.unwrap();
        assert_eq!(origin.last_outcome.unwrap().outcome, OutcomeKind::Dismissed);
    }

    #[tokio::test]
    async fn unanswered_alarm_expires() {
        let h = Harness::new().await;
        let alarm = h.service.create_alarm(energetic_daily()).await.unwrap();

        let session = fire(&h, alarm.id).await;
        let record = session.await.unwrap().unwrap();

        assert_eq!(record.outcome, OutcomeKind::Expired);
        assert_eq!(record.method, None);
        assert_eq!(
            h.coordinator.submit_voice(alarm.id, "I'm up".into()).await,
            Err(DismissalError::NotRinging(alarm.id))
        );
    }

    #[tokio::test]
    async fn voice_after_window_is_refused_and_duplicates_ignored() {
        let h = Harness::new().await;
        let alarm = h.service.create_alarm(energetic_daily()).await.unwrap();
        let session = fire(&h, alarm.id).await;

        let again = h.host.entries()[0].clone();
        let duplicate = FireEvent {
            host_id: again.id,
            alarm_id: alarm.id,
            fired_at: h.clock.now(),
        };
        assert!(h.coordinator.handle_fire(duplicate).await.is_none());

        h.coordinator
            .wait_for_state(alarm.id, |s| *s == DismissalState::AwaitingConfirmation { listening: false })
            .await
            .unwrap();
        assert_eq!(
            h.coordinator.submit_voice(alarm.id, "I'm up".into()).await,
            Err(DismissalError::ListenerClosed(alarm.id))
        );
        h.coordinator.dismiss(alarm.id).await.unwrap();
        assert_eq!(session.await.unwrap().unwrap().method, Some(DismissMethod::Explicit));
    }

    #[tokio::test]
    async fn unknown_alarm_fire_is_ignored() {
        let h = Harness::new().await;
        let event = FireEvent {
            host_id: "stray".into(),
            alarm_id: AlarmId::new(),
            fired_at: h.clock.now(),
        };
        assert!(h.coordinator.handle_fire(event).await.is_none());
        assert!(h.coordinator.ringing().is_empty());
    }
}
