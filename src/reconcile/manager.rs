//! Reconciliation between stored alarms and the host scheduler.
//!
//! This is the only component that talks to the host. Every host call is
//! bounded by a timeout. `reconcile_all` and `reschedule_atomically` share
//! one guard so they never interleave.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::host::{AuthorizationStatus, CancelOutcome, FireEvent, HostEntryState, HostError, HostScheduler};
use crate::clock::SharedClock;
use crate::error::ErrorKind;
use crate::model::{Alarm, AlarmId, ExternalSchedulerHandle, HandleStatus, HostAlarmConfig, ScheduleState};
use crate::repository::{AlarmPatch, AlarmRepository};
use crate::scheduling::time::next_fire;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Host(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// What one reconciliation pass changed. All zeros means the stored view
/// and the host already agreed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub pushed: usize,
    pub repushed: usize,
    pub drifted: usize,
    pub invalidated: usize,
    pub detached: usize,
    pub orphans_cancelled: usize,
}

impl ReconcileReport {
    pub fn is_fixed_point(&self) -> bool {
        *self == Self::default()
    }
}

/// Build the host config for an alarm's next occurrence after `now`.
pub fn host_config(alarm: &Alarm, now: DateTime<Utc>) -> Option<HostAlarmConfig> {
    next_fire(alarm, now).map(|fire_at| HostAlarmConfig {
        alarm_id: alarm.id,
        fire_at,
        label: alarm.label.clone(),
    })
}

/// One alarm's part in an atomic reschedule. `config: None` changes only
/// the stored zone.
#[derive(Debug, Clone)]
pub struct ReschedulePlan {
    pub alarm_id: AlarmId,
    pub timezone: Tz,
    pub config: Option<HostAlarmConfig>,
}

fn patch(f: impl FnOnce(&mut Alarm) + Send + 'static) -> AlarmPatch {
    Box::new(f)
}

pub struct ReconciliationManager {
    host: Arc<dyn HostScheduler>,
    repo: Arc<AlarmRepository>,
    clock: SharedClock,
    call_timeout: Duration,
    guard: Mutex<()>,
}

impl ReconciliationManager {
    pub fn new(
        host: Arc<dyn HostScheduler>,
        repo: Arc<AlarmRepository>,
        clock: SharedClock,
        call_timeout: Duration,
    ) -> Self {
        Self {
            host,
            repo,
            clock,
            call_timeout,
            guard: Mutex::new(()),
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, HostError>>) -> Result<T, HostError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(HostError::Timeout))
    }

    pub fn max_concurrent(&self) -> usize {
        self.host.max_concurrent()
    }

    pub fn take_fire_events(&self) -> Option<mpsc::UnboundedReceiver<FireEvent>> {
        self.host.take_fire_events()
    }

    pub async fn authorize(&self) -> Result<(), HostError> {
        match self.bounded(self.host.request_authorization()).await? {
            AuthorizationStatus::Granted => {
                debug!("Host scheduler {} authorized", self.host.name());
                Ok(())
            }
            AuthorizationStatus::Denied => Err(HostError::NotAuthorized),
        }
    }

    /// Entries currently held by the host.
    pub async fn host_entries(&self) -> Result<Vec<super::host::HostEntry>, HostError> {
        self.bounded(self.host.list_active()).await
    }

    /// Push the alarm's next occurrence to the host.
    pub async fn schedule(&self, alarm: &Alarm) -> Result<ExternalSchedulerHandle, HostError> {
        let config = host_config(alarm, self.clock.now())
            .ok_or_else(|| HostError::Rejected(format!("alarm {} has no future occurrence", alarm.id)))?;
        self.push(config).await
    }

    /// Push one config. A full host gets one orphan sweep and one retry.
    pub async fn push(&self, config: HostAlarmConfig) -> Result<ExternalSchedulerHandle, HostError> {
        let host_id = match self.bounded(self.host.schedule(&config)).await {
            Ok(id) => id,
            Err(HostError::LimitReached { max }) => {
                warn!("Host alarm limit ({max}) reached, sweeping orphans before retrying");
                self.cleanup_orphans().await?;
                self.bounded(self.host.schedule(&config)).await?
            }
            Err(e) => return Err(e),
        };

        debug!("Pushed alarm {} as host entry {host_id}", config.alarm_id);
        Ok(ExternalSchedulerHandle {
            host_id,
            pushed: config,
            status: HandleStatus::Pending,
            pushed_at: self.clock.now(),
        })
    }

    /// Cancel the host entry behind `handle`. Alerting entries are
    /// dismissed, pending ones cancelled; an entry the host no longer has
    /// counts as cancelled. Invalid handles are never sent to the host.
    pub async fn cancel(&self, handle: &ExternalSchedulerHandle, active: bool) -> Result<(), HostError> {
        if !handle.is_valid() {
            debug!("Handle {} is invalid, nothing to cancel", handle.host_id);
            return Ok(());
        }

        let id = handle.host_id.as_str();
        let first = if active {
            self.bounded(self.host.dismiss_active(id)).await
        } else {
            self.bounded(self.host.cancel(id)).await
        };

        let outcome = match first {
            Ok(outcome) => outcome,
            Err(HostError::EntryActive(_)) => self.bounded(self.host.dismiss_active(id)).await?,
            Err(HostError::NotAlerting(_)) => self.bounded(self.host.cancel(id)).await?,
            Err(e) => return Err(e),
        };

        if outcome == CancelOutcome::NotFound {
            debug!("Host entry {id} already gone");
        }
        Ok(())
    }

    /// Cancel host entries whose alarm no longer exists. Returns how many
    /// went. Stale entries of live alarms are left to `reconcile_all`,
    /// which knows about pushes not yet committed.
    pub async fn cleanup_orphans(&self) -> Result<usize, HostError> {
        let known: HashSet<AlarmId> = self.repo.list().await.iter().map(|a| a.id).collect();

        let mut removed = 0;
        for entry in self.host_entries().await? {
            if known.contains(&entry.config.alarm_id) {
                continue;
            }
            if self.cancel_entry(&entry.id, entry.state).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cancelled {removed} orphaned host entries");
        }
        Ok(removed)
    }

    async fn cancel_entry(&self, host_id: &str, state: HostEntryState) -> bool {
        let call = if state == HostEntryState::Alerting {
            self.bounded(self.host.dismiss_active(host_id)).await
        } else {
            self.bounded(self.host.cancel(host_id)).await
        };
        match call {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to cancel orphan host entry {host_id}: {e}");
                false
            }
        }
    }

    /// Bring host and stored state back into agreement. Never deletes an
    /// alarm; all record changes land in one atomic write.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.guard.lock().await;
        let now = self.clock.now();
        let live: HashMap<String, HostEntryState> = self
            .host_entries()
            .await?
            .into_iter()
            .map(|e| (e.id, e.state))
            .collect();

        let mut report = ReconcileReport::default();
        let mut patches: Vec<(AlarmId, AlarmPatch)> = Vec::new();
        let mut owned: HashSet<String> = HashSet::new();

        for alarm in self.repo.list().await {
            let desired = if alarm.enabled {
                host_config(&alarm, now)
            } else {
                None
            };

            match (alarm.enabled, alarm.valid_handle().cloned()) {
                (true, Some(handle))
                    if !live.contains_key(&handle.host_id)
                        && handle.pushed.fire_at <= now
                        && alarm.schedule_state == ScheduleState::Scheduled =>
                {
                    // Due but never fired; misfire detection settles it.
                    debug!(
                        "Alarm {} missed its firing at {}, leaving it for misfire detection",
                        alarm.id, handle.pushed.fire_at
                    );
                }
                (true, Some(handle)) => {
                    match (live.get(&handle.host_id).copied(), desired) {
                        (Some(HostEntryState::Alerting), _) => {
                            owned.insert(handle.host_id.clone());
                        }
                        (Some(_), Some(config)) if config != handle.pushed && handle.pushed.fire_at > now => {
                            match self.push(config).await {
                                Ok(fresh) => {
                                    info!("Alarm {} drifted, re-pushed as {}", alarm.id, fresh.host_id);
                                    owned.insert(fresh.host_id.clone());
                                    // A failed cancel leaves the old entry for the next orphan sweep.
                                    owned.insert(handle.host_id.clone());
                                    if let Err(e) = self.cancel(&handle, false).await {
                                        warn!("Failed to cancel drifted entry {}: {e}", handle.host_id);
                                    }
                                    patches.push((alarm.id, patch(move |a| a.handle = Some(fresh))));
                                    report.drifted += 1;
                                }
                                Err(e) => {
                                    warn!("Re-push for drifted alarm {} failed: {e}", alarm.id);
                                    owned.insert(handle.host_id.clone());
                                }
                            }
                        }
                        (Some(_), _) => {
                            owned.insert(handle.host_id.clone());
                            if handle.status == HandleStatus::Pending {
                                patches.push((
                                    alarm.id,
                                    patch(|a| {
                                        if let Some(h) = a.handle.as_mut() {
                                            h.status = HandleStatus::Live;
                                        }
                                    }),
                                ));
                                report.confirmed += 1;
                            }
                        }
                        (None, Some(config)) => match self.push(config).await {
                            Ok(fresh) => {
                                info!("Host lost alarm {}, re-pushed as {}", alarm.id, fresh.host_id);
                                owned.insert(fresh.host_id.clone());
                                patches.push((alarm.id, patch(move |a| a.handle = Some(fresh))));
                                report.repushed += 1;
                            }
                            Err(e) => {
                                warn!("Re-push for alarm {} failed: {e}, invalidating handle", alarm.id);
                                patches.push((alarm.id, patch(invalidate_handle)));
                                report.invalidated += 1;
                            }
                        },
                        (None, None) => {
                            debug!("Alarm {} has no future occurrence, invalidating handle", alarm.id);
                            patches.push((alarm.id, patch(invalidate_handle)));
                            report.invalidated += 1;
                        }
                    }
                }
                (true, None) if alarm.schedule_state == ScheduleState::Validating => {}
                (true, None) => {
                    let Some(config) = desired else { continue };
                    match self.push(config).await {
                        Ok(fresh) => {
                            info!("Pushed alarm {} as host entry {}", alarm.id, fresh.host_id);
                            owned.insert(fresh.host_id.clone());
                            patches.push((
                                alarm.id,
                                patch(move |a| {
                                    a.handle = Some(fresh);
                                    if matches!(a.schedule_state, ScheduleState::Unscheduled | ScheduleState::Misfired) {
                                        a.schedule_state = ScheduleState::Scheduled;
                                    }
                                }),
                            ));
                            report.pushed += 1;
                        }
                        Err(e) => warn!("Push for alarm {} failed: {e}", alarm.id),
                    }
                }
                (false, Some(handle)) => {
                    let active = live.get(&handle.host_id) == Some(&HostEntryState::Alerting);
                    owned.insert(handle.host_id.clone());
                    match self.cancel(&handle, active).await {
                        Ok(()) => {
                            patches.push((
                                alarm.id,
                                patch(|a| {
                                    a.handle = None;
                                    a.schedule_state = ScheduleState::Cancelled;
                                }),
                            ));
                            report.detached += 1;
                        }
                        Err(e) => warn!("Failed to detach disabled alarm {}: {e}", alarm.id),
                    }
                }
                (false, None) => {}
            }
        }

        for (host_id, state) in &live {
            if !owned.contains(host_id) && self.cancel_entry(host_id, *state).await {
                report.orphans_cancelled += 1;
            }
        }

        self.repo.update_many(patches).await?;

        if report.is_fixed_point() {
            debug!("Reconciliation: host and store agree");
        } else {
            info!("Reconciliation: {report:?}");
        }
        Ok(report)
    }

    /// Move several alarms to new host entries as one unit. All new entries
    /// are pushed first; if any push fails the new entries are withdrawn
    /// and the previous schedule stays untouched. On success every record
    /// (zone changes included) is committed in one write, then the old
    /// entries are cancelled. Returns how many host entries were replaced.
    pub async fn reschedule_atomically(&self, plans: Vec<ReschedulePlan>) -> Result<usize, ReconcileError> {
        if plans.is_empty() {
            return Ok(0);
        }
        let _guard = self.guard.lock().await;

        let mut old_handles = Vec::new();
        let mut fresh: Vec<(AlarmId, ExternalSchedulerHandle)> = Vec::new();
        let mut zones = Vec::with_capacity(plans.len());
        for plan in plans {
            zones.push((plan.alarm_id, plan.timezone));
            let Some(config) = plan.config else { continue };
            if let Some(old) = self
                .repo
                .get(plan.alarm_id)
                .await
                .and_then(|a| a.valid_handle().cloned())
            {
                old_handles.push(old);
            }
            match self.push(config).await {
                Ok(handle) => fresh.push((plan.alarm_id, handle)),
                Err(e) => {
                    warn!(
                        "Reschedule of alarm {} failed: {e}, rolling back {} entries",
                        plan.alarm_id,
                        fresh.len()
                    );
                    self.withdraw(&fresh).await;
                    return Err(e.into());
                }
            }
        }

        let mut patches: Vec<(AlarmId, AlarmPatch)> = zones
            .into_iter()
            .map(|(alarm_id, tz)| (alarm_id, patch(move |a| a.timezone = tz)))
            .collect();
        for (alarm_id, handle) in &fresh {
            let handle = handle.clone();
            patches.push((
                *alarm_id,
                patch(move |a| {
                    a.handle = Some(handle);
                    a.schedule_state = ScheduleState::Scheduled;
                }),
            ));
        }
        if let Err(e) = self.repo.update_many(patches).await {
            warn!("Committing rescheduled alarms failed: {e}, rolling back");
            self.withdraw(&fresh).await;
            return Err(e.into());
        }

        for old in &old_handles {
            if let Err(e) = self.cancel(old, false).await {
                // Left for the next reconcile pass to sweep as an orphan.
                warn!("Failed to cancel superseded entry {}: {e}", old.host_id);
            }
        }

        info!("Rescheduled {} alarm(s)", fresh.len());
        Ok(fresh.len())
    }

    async fn withdraw(&self, pushed: &[(AlarmId, ExternalSchedulerHandle)]) {
        for (_, handle) in pushed {
            if let Err(e) = self.cancel(handle, false).await {
                warn!("Failed to withdraw host entry {}: {e}", handle.host_id);
            }
        }
    }
}

fn invalidate_handle(alarm: &mut Alarm) {
    alarm.handle = alarm.handle.take().map(ExternalSchedulerHandle::invalidated);
}
