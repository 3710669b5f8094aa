//! Alarm scheduling service: the write surface for alarms.
//!
//! Validation happens before any host call. Host failures after
//! validation degrade the alarm (stored, no handle) instead of failing the
//! request; reconciliation pushes it later.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::time::{next_fire, next_fire_for};
use super::timezone::{TimeChange, TimezoneWatcher};
use crate::cache::{AudioCache, HealthStatus};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::events::{CoreEvent, EventBus};
use crate::generation::ContentOrchestrator;
use crate::model::{
    Alarm, AlarmId, DismissalRecord, HostAlarmConfig, IntentId, OutcomeKind, Recurrence, RepeatDays, ScheduleState,
    Tone,
};
use crate::reconcile::{HostError, ReconcileError, ReconciliationManager, ReschedulePlan};
use crate::repository::AlarmRepository;
use crate::storage::StorageError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("fire time {0} is in the past")]
    PastFireTime(DateTime<Utc>),

    #[error("fires within the tolerance window of alarm {other} ({label:?}) at {fire_at}")]
    Conflict {
        other: AlarmId,
        label: String,
        fire_at: DateTime<Utc>,
    },

    #[error("host alarm limit reached ({max})")]
    LimitReached { max: usize },

    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
}

#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("invalid alarm: {0}")]
    Validation(#[from] ValidationError),

    #[error("alarm scheduling is not authorized on this device")]
    AuthorizationDenied,

    #[error("alarm {0} not found")]
    NotFound(AlarmId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl SchedulingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AuthorizationDenied => ErrorKind::FatalConfiguration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(e) => e.kind(),
            Self::Reconcile(e) => e.kind(),
        }
    }
}

type Result<T> = std::result::Result<T, SchedulingError>;

/// Request to create an alarm. A `date` makes it one-shot, `repeat` makes
/// it weekly; with neither it rings at the next occurrence of `time`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlarm {
    pub label: String,
    pub time: NaiveTime,
    #[serde(default)]
    pub timezone: Option<Tz>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub repeat: Vec<Weekday>,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub intent_id: Option<IntentId>,
}

#[derive(Debug, Clone)]
pub struct SchedulingSettings {
    pub conflict_tolerance: chrono::Duration,
    pub misfire_grace: chrono::Duration,
    pub lookahead: chrono::Duration,
    pub intent_max_age: chrono::Duration,
    pub snooze: chrono::Duration,
}

impl SchedulingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conflict_tolerance: chrono::Duration::seconds(config.scheduling.conflict_tolerance_secs as i64),
            misfire_grace: chrono::Duration::seconds(config.scheduling.misfire_grace_secs as i64),
            lookahead: config.generation.lookahead(),
            intent_max_age: config.intents.max_age(),
            snooze: chrono::Duration::minutes(config.dismissal.snooze_minutes as i64),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub misfired: usize,
    pub purged_intents: usize,
    pub pregenerated: usize,
    pub rescheduled: usize,
}

pub struct SchedulingService {
    repo: Arc<AlarmRepository>,
    reconciler: Arc<ReconciliationManager>,
    orchestrator: Arc<ContentOrchestrator>,
    cache: Arc<AudioCache>,
    events: Arc<EventBus>,
    clock: SharedClock,
    timezone: TimezoneWatcher,
    settings: SchedulingSettings,
}

impl SchedulingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<AlarmRepository>,
        reconciler: Arc<ReconciliationManager>,
        orchestrator: Arc<ContentOrchestrator>,
        cache: Arc<AudioCache>,
        events: Arc<EventBus>,
        clock: SharedClock,
        timezone: TimezoneWatcher,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            repo,
            reconciler,
            orchestrator,
            cache,
            events,
            clock,
            timezone,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<AlarmRepository> {
        &self.repo
    }

    pub fn current_timezone(&self) -> Tz {
        self.timezone.current()
    }

    pub async fn create_alarm(self: &Arc<Self>, request: NewAlarm) -> Result<Alarm> {
        match self.reconciler.authorize().await {
            Ok(()) => {}
            Err(HostError::NotAuthorized) => return Err(SchedulingError::AuthorizationDenied),
            Err(e) => warn!("Authorization check failed ({e}), continuing"),
        }

        let now = self.clock.now();
        let tz = request.timezone.unwrap_or_else(|| self.timezone.current());
        let recurrence = build_recurrence(&request, tz, now)?;

        let alarm = Alarm {
            id: AlarmId::new(),
            label: request.label.trim().to_string(),
            time: request.time,
            timezone: tz,
            recurrence,
            tone: request.tone,
            enabled: true,
            intent_id: request.intent_id,
            content: None,
            handle: None,
            schedule_state: ScheduleState::Validating,
            created_at: now,
            last_fired_at: None,
            snooze_count: 0,
            last_outcome: None,
            derived_from: None,
        };
        // Stored while validating so observers see the step; a rejected
        // alarm is removed again.
        self.repo.insert(alarm.clone()).await?;
        let fire_at = match self.validate(&alarm, now).await {
            Ok(at) => at,
            Err(e) => {
                self.repo.remove(alarm.id).await?;
                info!("Rejected alarm {:?}: {e}", alarm.label);
                return Err(e.into());
            }
        };

        self.repo
            .update(alarm.id, |a| a.schedule_state = ScheduleState::Unscheduled)
            .await?;
        info!("Created alarm {} ({:?}) next firing at {fire_at}", alarm.id, alarm.label);

        let armed = self.arm(alarm.id).await?;
        self.maybe_pregenerate(&armed, fire_at);
        Ok(armed)
    }

    /// Flip `enabled`, or set it when `enabled` is given.
    pub async fn toggle_alarm(self: &Arc<Self>, id: AlarmId, enabled: Option<bool>) -> Result<Alarm> {
        let alarm = self.repo.get(id).await.ok_or(SchedulingError::NotFound(id))?;
        let target = enabled.unwrap_or(!alarm.enabled);
        if target == alarm.enabled {
            return Ok(alarm);
        }

        if !target {
            self.orchestrator.discard_in_flight(id);
            let mut detached = true;
            if let Some(handle) = alarm.valid_handle() {
                let active = alarm.schedule_state == ScheduleState::Active;
                if let Err(e) = self.reconciler.cancel(handle, active).await {
                    warn!("Failed to cancel host entry for {id}: {e}, reconciliation will retry");
                    detached = false;
                }
            }
            let updated = self
                .repo
                .update(id, move |a| {
                    a.enabled = false;
                    a.schedule_state = ScheduleState::Cancelled;
                    if detached {
                        a.handle = None;
                    }
                })
                .await?
                .ok_or(SchedulingError::NotFound(id))?;
            info!("Disabled alarm {id}");
            return Ok(updated);
        }

        let now = self.clock.now();
        let mut candidate = alarm.clone();
        candidate.enabled = true;
        let fire_at = self.validate(&candidate, now).await?;
        self.repo
            .update(id, |a| {
                a.enabled = true;
                a.schedule_state = ScheduleState::Unscheduled;
            })
            .await?;
        let armed = self.arm(id).await?;
        info!("Enabled alarm {id}, next firing at {fire_at}");
        self.maybe_pregenerate(&armed, fire_at);
        Ok(armed)
    }

    /// Delete an alarm and any snooze alarms derived from it.
    pub async fn delete_alarm(&self, id: AlarmId) -> Result<Alarm> {
        let alarm = self.repo.get(id).await.ok_or(SchedulingError::NotFound(id))?;

        let derived: Vec<Alarm> = self
            .repo
            .list()
            .await
            .into_iter()
            .filter(|a| a.derived_from == Some(id))
            .collect();
        for child in derived {
            self.remove_one(child).await?;
        }
        self.remove_one(alarm.clone()).await?;
        info!("Deleted alarm {id}");
        Ok(alarm)
    }

    async fn remove_one(&self, alarm: Alarm) -> Result<()> {
        self.orchestrator.discard_in_flight(alarm.id);
        if let Some(handle) = alarm.valid_handle() {
            let active = alarm.schedule_state == ScheduleState::Active;
            if let Err(e) = self.reconciler.cancel(handle, active).await {
                // The entry becomes an orphan and is swept by reconciliation.
                warn!("Failed to cancel host entry for {}: {e}", alarm.id);
            }
        }
        self.repo.remove(alarm.id).await?;
        self.orchestrator.forget(alarm.id);

        if let Some(key) = alarm.content_key() {
            if self.repo.content_references(key).await == 0 {
                if let Err(e) = self.cache.invalidate(key).await {
                    warn!("Failed to release cached audio {key}: {e}");
                }
            }
        }
        Ok(())
    }

    /// Record that the host fired the alarm.
    pub async fn mark_fired(&self, id: AlarmId, fired_at: DateTime<Utc>) -> Result<Option<Alarm>> {
        let updated = self
            .repo
            .update(id, move |a| {
                a.last_fired_at = Some(fired_at);
                a.schedule_state = ScheduleState::Active;
            })
            .await?;
        Ok(updated)
    }

    /// Settle a firing: recurring alarms are re-armed for their next
    /// occurrence, one-shot alarms are disabled and snooze alarms removed.
    pub async fn complete_firing(self: &Arc<Self>, id: AlarmId, record: DismissalRecord) -> Result<()> {
        let Some(alarm) = self.repo.get(id).await else {
            debug!("Alarm {id} vanished before its firing settled");
            return Ok(());
        };

        if let Some(origin) = alarm.derived_from {
            let outcome = record.clone();
            self.repo.update(origin, move |a| a.last_outcome = Some(outcome)).await?;
            self.repo.remove(id).await?;
            self.orchestrator.forget(id);
            debug!("Snooze alarm {id} settled and removed");
            return Ok(());
        }

        if alarm.is_recurring() && alarm.enabled {
            self.repo
                .update(id, move |a| {
                    a.last_outcome = Some(record);
                    a.handle = None;
                    a.schedule_state = ScheduleState::Unscheduled;
                })
                .await?;
            let armed = self.arm(id).await?;
            if let Some(next) = next_fire(&armed, self.clock.now()) {
                info!("Re-armed alarm {id} for {next}");
                self.maybe_pregenerate(&armed, next);
            }
        } else {
            self.repo
                .update(id, move |a| {
                    a.last_outcome = Some(record);
                    a.enabled = false;
                    a.handle = None;
                    a.schedule_state = ScheduleState::Cancelled;
                })
                .await?;
            info!("One-shot alarm {id} completed and disabled");
        }
        Ok(())
    }

    /// Create the short-lived one-shot alarm a snooze rings through. The
    /// origin keeps its recurrence; only its snooze count changes.
    pub async fn snooze_from(self: &Arc<Self>, id: AlarmId, now: DateTime<Utc>) -> Result<Alarm> {
        let origin = self.repo.get(id).await.ok_or(SchedulingError::NotFound(id))?;
        let root = origin.derived_from.unwrap_or(origin.id);
        let at = (now + self.settings.snooze).with_timezone(&origin.timezone);

        let derived = Alarm {
            id: AlarmId::new(),
            label: origin.label.clone(),
            time: at.time(),
            timezone: origin.timezone,
            recurrence: Recurrence::Once { date: at.date_naive() },
            tone: origin.tone,
            enabled: true,
            intent_id: origin.intent_id,
            content: origin.content.clone(),
            handle: None,
            schedule_state: ScheduleState::Unscheduled,
            created_at: now,
            last_fired_at: None,
            snooze_count: 0,
            last_outcome: None,
            derived_from: Some(root),
        };
        self.repo.insert(derived.clone()).await?;
        self.repo.update(root, |a| a.snooze_count += 1).await?;

        let armed = self.arm(derived.id).await?;
        info!("Snoozed alarm {root} until {}", at.format("%H:%M:%S %Z"));
        Ok(armed)
    }

    /// Recompute recurring alarms after a zone or offset change. Alarms
    /// pinned to the previous device zone follow the device; any alarm
    /// whose next instant moved is rescheduled in one transaction.
    pub async fn handle_time_change(&self, change: &TimeChange) -> Result<usize> {
        let now = self.clock.now();
        let mut plans = Vec::new();

        for alarm in self.repo.list().await {
            if !alarm.is_recurring() {
                continue;
            }
            let follows = change.zone_changed() && alarm.timezone == change.previous;
            let tz = if follows { change.current } else { alarm.timezone };

            let config = alarm.valid_handle().and_then(|handle| {
                let fire_at = next_fire_for(&alarm.recurrence, alarm.time, tz, now)?;
                (alarm.enabled && fire_at != handle.pushed.fire_at).then(|| HostAlarmConfig {
                    alarm_id: alarm.id,
                    fire_at,
                    label: alarm.label.clone(),
                })
            });

            if follows || config.is_some() {
                plans.push(ReschedulePlan {
                    alarm_id: alarm.id,
                    timezone: tz,
                    config,
                });
            }
        }

        if plans.is_empty() {
            return Ok(0);
        }
        Ok(self.reconciler.reschedule_atomically(plans).await?)
    }

    /// Periodic housekeeping: misfire detection, time-change handling,
    /// intent expiry, cache health and pre-generation.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        report.misfired = self.detect_misfires(now).await;

        if let Some(change) = self.timezone.check(now) {
            match self.handle_time_change(&change).await {
                Ok(n) => report.rescheduled = n,
                Err(e) => warn!("Rescheduling after time change failed: {e}"),
            }
        }

        match self.repo.purge_expired_intents(now, self.settings.intent_max_age).await {
            Ok(n) => report.purged_intents = n,
            Err(e) => warn!("Intent purge failed: {e}"),
        }

        self.ensure_cache_capacity().await;
        report.pregenerated = self.orchestrator.pregenerate_window(now).await;
        report
    }

    /// Scheduled alarms whose pushed instant is past the grace period
    /// without a fire event. Invalidated handles count too: the host lost
    /// the entry, so the firing never happened.
    async fn detect_misfires(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let overdue: Vec<Alarm> = self
            .repo
            .list()
            .await
            .into_iter()
            .filter(|a| a.enabled && a.schedule_state == ScheduleState::Scheduled)
            .filter(|a| {
                a.handle
                    .as_ref()
                    .is_some_and(|h| h.pushed.fire_at + self.settings.misfire_grace < now)
            })
            .collect();

        for alarm in &overdue {
            let Some(due) = alarm.handle.as_ref().map(|h| h.pushed.fire_at) else { continue };
            warn!("Alarm {} misfired (was due {due})", alarm.id);
            if let Some(handle) = alarm.valid_handle() {
                if let Err(e) = self.reconciler.cancel(handle, false).await {
                    warn!("Failed to cancel stale entry {}: {e}", handle.host_id);
                }
            }
            let record = DismissalRecord {
                outcome: OutcomeKind::Missed,
                method: None,
                latency_ms: 0,
                fired_at: due,
                resolved_at: now,
                used_fallback: false,
            };

            if let Some(origin) = alarm.derived_from {
                if let Err(e) = self.settle_missed_snooze(alarm.id, origin, record).await {
                    warn!("Failed to settle missed snooze alarm {}: {e}", alarm.id);
                }
                continue;
            }

            let recurring = alarm.is_recurring();
            let updated = self
                .repo
                .update(alarm.id, move |a| {
                    a.handle = None;
                    a.schedule_state = ScheduleState::Misfired;
                    a.last_outcome = Some(record);
                    if !recurring {
                        a.enabled = false;
                    }
                })
                .await;
            if let Err(e) = updated {
                warn!("Failed to record misfire for {}: {e}", alarm.id);
                continue;
            }
            if recurring {
                if let Err(e) = self.arm(alarm.id).await {
                    warn!("Failed to re-arm misfired alarm {}: {e}", alarm.id);
                }
            }
        }
        overdue.len()
    }

    async fn settle_missed_snooze(&self, id: AlarmId, origin: AlarmId, record: DismissalRecord) -> Result<()> {
        self.repo.update(origin, move |a| a.last_outcome = Some(record)).await?;
        self.repo.remove(id).await?;
        self.orchestrator.forget(id);
        debug!("Missed snooze alarm {id} removed");
        Ok(())
    }

    /// Force maintenance when the cache reports critical usage.
    pub async fn ensure_cache_capacity(&self) {
        let health = self.cache.health();
        if health.status == HealthStatus::Critical {
            warn!(
                "Cache critical ({} / {} bytes), running maintenance",
                health.total_bytes, health.max_bytes
            );
            if let Err(e) = self.cache.run_maintenance().await {
                warn!("Cache maintenance failed: {e}");
            }
        }
        self.events.publish(CoreEvent::CacheHealth {
            report: self.cache.health(),
        });
    }

    async fn validate(&self, alarm: &Alarm, now: DateTime<Utc>) -> std::result::Result<DateTime<Utc>, ValidationError> {
        let fire_at = match next_fire(alarm, now) {
            Some(at) => at,
            None => {
                let due = match &alarm.recurrence {
                    Recurrence::Once { date } => super::time::resolve_local(alarm.timezone, *date, alarm.time),
                    Recurrence::Weekly { .. } => now,
                };
                return Err(ValidationError::PastFireTime(due));
            }
        };

        let others = self.repo.list().await;
        for other in others.iter().filter(|o| o.enabled && o.id != alarm.id) {
            let Some(other_at) = next_fire(other, now) else { continue };
            if (other_at - fire_at).abs() < self.settings.conflict_tolerance {
                return Err(ValidationError::Conflict {
                    other: other.id,
                    label: other.label.clone(),
                    fire_at: other_at,
                });
            }
        }

        let max = self.reconciler.max_concurrent();
        let scheduled = others
            .iter()
            .filter(|o| o.enabled && o.id != alarm.id && o.valid_handle().is_some())
            .count();
        if scheduled >= max {
            return Err(ValidationError::LimitReached { max });
        }
        Ok(fire_at)
    }

    /// Push the alarm to the host and attach the handle. Transient host
    /// failures leave the alarm stored without a handle.
    async fn arm(&self, id: AlarmId) -> Result<Alarm> {
        let alarm = self.repo.get(id).await.ok_or(SchedulingError::NotFound(id))?;
        match self.reconciler.schedule(&alarm).await {
            Ok(handle) => {
                let updated = self
                    .repo
                    .update(id, move |a| {
                        a.handle = Some(handle);
                        a.schedule_state = ScheduleState::Scheduled;
                    })
                    .await?;
                updated.ok_or(SchedulingError::NotFound(id))
            }
            Err(HostError::NotAuthorized) => Err(SchedulingError::AuthorizationDenied),
            Err(e) => {
                warn!("Alarm {id} stored without a host entry ({e}), reconciliation will retry");
                Ok(alarm)
            }
        }
    }

    fn maybe_pregenerate(self: &Arc<Self>, alarm: &Alarm, fire_at: DateTime<Utc>) {
        if fire_at - self.clock.now() > self.settings.lookahead {
            return;
        }
        if !self.orchestrator.needs_content(alarm) {
            return;
        }
        let this = Arc::clone(self);
        let alarm_id = alarm.id;
        let intent_id = alarm.intent_id;
        tokio::spawn(async move {
            this.ensure_cache_capacity().await;
            if let Err(e) = this.orchestrator.generate(alarm_id, intent_id).await {
                debug!("Pre-generation for {alarm_id} ended without content: {e}");
            }
        });
    }
}

fn build_recurrence(
    request: &NewAlarm,
    tz: Tz,
    now: DateTime<Utc>,
) -> std::result::Result<Recurrence, ValidationError> {
    match (request.date, request.repeat.is_empty()) {
        (Some(_), false) => Err(ValidationError::InvalidRecurrence(
            "an alarm has either a date or repeat days, not both".into(),
        )),
        (None, false) => Ok(Recurrence::Weekly {
            days: RepeatDays::new(request.repeat.iter().copied()),
        }),
        (Some(date), true) => Ok(Recurrence::Once { date }),
        (None, true) => {
            let today = now.with_timezone(&tz).date_naive();
            let date = if super::time::resolve_local(tz, today, request.time) > now {
                today
            } else {
                today + chrono::Duration::days(1)
            };
            Ok(Recurrence::Once { date })
        }
    }
}
