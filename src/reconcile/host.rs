//! Host alarm scheduler capability and the in-process default.
//!
//! The host is whatever actually wakes the device. It is treated as
//! untrusted: entries can vanish, linger or appear without an owner, which
//! is why the reconciliation manager re-derives its view periodically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::ErrorKind;
use crate::model::{AlarmId, HostAlarmConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host scheduling not authorized")]
    NotAuthorized,

    #[error("host alarm limit reached ({max})")]
    LimitReached { max: usize },

    #[error("host entry {0} is alerting")]
    EntryActive(String),

    #[error("host entry {0} is not alerting")]
    NotAlerting(String),

    #[error("host unavailable: {0}")]
    Unavailable(String),

    #[error("host call timed out")]
    Timeout,

    #[error("host rejected request: {0}")]
    Rejected(String),
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthorized => ErrorKind::FatalConfiguration,
            Self::LimitReached { .. } => ErrorKind::ResourceExhausted,
            Self::Unavailable(_) | Self::Timeout => ErrorKind::Transient,
            Self::EntryActive(_) | Self::NotAlerting(_) | Self::Rejected(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEntryState {
    Pending,
    Alerting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub id: String,
    pub config: HostAlarmConfig,
    pub state: HostEntryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireEvent {
    pub host_id: String,
    pub alarm_id: AlarmId,
    pub fired_at: DateTime<Utc>,
}

#[async_trait]
pub trait HostScheduler: Send + Sync {
    async fn request_authorization(&self) -> Result<AuthorizationStatus, HostError>;

    /// Push an entry. Returns the host-assigned id.
    async fn schedule(&self, config: &HostAlarmConfig) -> Result<String, HostError>;

    /// Remove a pending entry. Alerting entries are refused with
    /// [`HostError::EntryActive`].
    async fn cancel(&self, host_id: &str) -> Result<CancelOutcome, HostError>;

    /// Silence and remove an alerting entry. Pending entries are refused
    /// with [`HostError::NotAlerting`].
    async fn dismiss_active(&self, host_id: &str) -> Result<CancelOutcome, HostError>;

    async fn list_active(&self) -> Result<Vec<HostEntry>, HostError>;

    /// The fire-event stream. Only the first caller gets it.
    fn take_fire_events(&self) -> Option<mpsc::UnboundedReceiver<FireEvent>>;

    fn max_concurrent(&self) -> usize;

    fn name(&self) -> &str {
        "unknown"
    }
}

struct LocalEntry {
    config: HostAlarmConfig,
    state: HostEntryState,
    timer: JoinHandle<()>,
}

/// Timer-task host: every entry is a sleeping tokio task that flips the
/// entry to alerting and emits a fire event when it wakes.
pub struct LocalHostScheduler {
    entries: Arc<Mutex<HashMap<String, LocalEntry>>>,
    fire_tx: mpsc::UnboundedSender<FireEvent>,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<FireEvent>>>,
    max_concurrent: usize,
    clock: SharedClock,
    next_id: AtomicU64,
}

impl LocalHostScheduler {
    pub fn new(max_concurrent: usize, clock: SharedClock) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            fire_tx,
            fire_rx: Mutex::new(Some(fire_rx)),
            max_concurrent,
            clock,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Drop for LocalHostScheduler {
    fn drop(&mut self) {
        for entry in self.entries.lock().values() {
            entry.timer.abort();
        }
    }
}

#[async_trait]
impl HostScheduler for LocalHostScheduler {
    async fn request_authorization(&self) -> Result<AuthorizationStatus, HostError> {
        Ok(AuthorizationStatus::Granted)
    }

    async fn schedule(&self, config: &HostAlarmConfig) -> Result<String, HostError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_concurrent {
            return Err(HostError::LimitReached {
                max: self.max_concurrent,
            });
        }

        let host_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let delay = (config.fire_at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let timer = {
            let entries = Arc::clone(&self.entries);
            let fire_tx = self.fire_tx.clone();
            let clock = self.clock.clone();
            let host_id = host_id.clone();
            let alarm_id = config.alarm_id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let fired = match entries.lock().get_mut(&host_id) {
                    Some(entry) => {
                        entry.state = HostEntryState::Alerting;
                        true
                    }
                    None => false,
                };
                if fired {
                    info!("Host entry {host_id} firing for alarm {alarm_id}");
                    let _ = fire_tx.send(FireEvent {
                        host_id,
                        alarm_id,
                        fired_at: clock.now(),
                    });
                }
            })
        };

        entries.insert(
            host_id.clone(),
            LocalEntry {
                config: config.clone(),
                state: HostEntryState::Pending,
                timer,
            },
        );
        debug!("Scheduled host entry {host_id} at {}", config.fire_at);
        Ok(host_id)
    }

    async fn cancel(&self, host_id: &str) -> Result<CancelOutcome, HostError> {
        let mut entries = self.entries.lock();
        match entries.get(host_id).map(|e| e.state) {
            None => Ok(CancelOutcome::NotFound),
            Some(HostEntryState::Alerting) => Err(HostError::EntryActive(host_id.to_string())),
            Some(HostEntryState::Pending) => {
                if let Some(entry) = entries.remove(host_id) {
                    entry.timer.abort();
                }
                debug!("Cancelled host entry {host_id}");
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn dismiss_active(&self, host_id: &str) -> Result<CancelOutcome, HostError> {
        let mut entries = self.entries.lock();
        match entries.get(host_id).map(|e| e.state) {
            None => Ok(CancelOutcome::NotFound),
            Some(HostEntryState::Pending) => Err(HostError::NotAlerting(host_id.to_string())),
            Some(HostEntryState::Alerting) => {
                entries.remove(host_id);
                debug!("Dismissed host entry {host_id}");
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<HostEntry>, HostError> {
        let mut listed: Vec<HostEntry> = self
            .entries
            .lock()
            .iter()
            .map(|(id, e)| HostEntry {
                id: id.clone(),
                config: e.config.clone(),
                state: e.state,
            })
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    fn take_fire_events(&self) -> Option<mpsc::UnboundedReceiver<FireEvent>> {
        self.fire_rx.lock().take()
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn name(&self) -> &str {
        "local"
    }
}
