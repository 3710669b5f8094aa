//! Alarm repository: the single in-process source of truth.
//!
//! Reads are served from memory. Every mutation goes through one writer
//! lock, is persisted before it becomes visible, and is then published on
//! the event bus.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::events::{CoreEvent, EventBus};
use crate::model::{Alarm, AlarmId, Intent, IntentId};
use crate::storage::{KeyValueStore, Result, StorageError, WriteOp};

const ALARM_PREFIX: &str = "alarm/";
const INTENT_PREFIX: &str = "intent/";

fn alarm_key(id: AlarmId) -> String {
    format!("{ALARM_PREFIX}{id}")
}

fn intent_key(id: IntentId) -> String {
    format!("{INTENT_PREFIX}{id}")
}

/// A deferred edit applied under the writer lock against the latest state.
pub type AlarmPatch = Box<dyn FnOnce(&mut Alarm) + Send>;

#[derive(Default)]
struct State {
    alarms: HashMap<AlarmId, Alarm>,
    intents: HashMap<IntentId, Intent>,
}

pub struct AlarmRepository {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<State>,
    writer: Mutex<()>,
    events: Arc<EventBus>,
}

impl AlarmRepository {
    pub async fn load(store: Arc<dyn KeyValueStore>, events: Arc<EventBus>) -> Result<Self> {
        let mut state = State::default();

        for (key, value) in store.list(ALARM_PREFIX).await? {
            let alarm: Alarm = serde_json::from_value(value)
                .map_err(|e| StorageError::Unavailable(format!("corrupt record {key}: {e}")))?;
            state.alarms.insert(alarm.id, alarm);
        }
        for (key, value) in store.list(INTENT_PREFIX).await? {
            let intent: Intent = serde_json::from_value(value)
                .map_err(|e| StorageError::Unavailable(format!("corrupt record {key}: {e}")))?;
            state.intents.insert(intent.id, intent);
        }

        info!(
            "Repository loaded from {} store: {} alarms, {} intents",
            store.backend_type(),
            state.alarms.len(),
            state.intents.len()
        );

        Ok(Self {
            store,
            state: RwLock::new(state),
            writer: Mutex::new(()),
            events,
        })
    }

    /// Reactive stream of alarm changes (and every other core event).
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: AlarmId) -> Option<Alarm> {
        self.state.read().await.alarms.get(&id).cloned()
    }

    /// All alarms, oldest first.
    pub async fn list(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self.state.read().await.alarms.values().cloned().collect();
        alarms.sort_by_key(|a| (a.created_at, a.id));
        alarms
    }

    pub async fn find_by_host_id(&self, host_id: &str) -> Option<Alarm> {
        self.state
            .read()
            .await
            .alarms
            .values()
            .find(|a| a.handle.as_ref().is_some_and(|h| h.host_id == host_id))
            .cloned()
    }

    /// Number of alarms still referencing a cache key.
    pub async fn content_references(&self, cache_key: &str) -> usize {
        self.state
            .read()
            .await
            .alarms
            .values()
            .filter(|a| a.content_key() == Some(cache_key))
            .count()
    }

    pub async fn insert(&self, alarm: Alarm) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store
            .put(&alarm_key(alarm.id), serde_json::to_value(&alarm)?)
            .await?;
        self.state.write().await.alarms.insert(alarm.id, alarm.clone());
        debug!("Inserted alarm {}", alarm.id);
        self.events.publish(CoreEvent::AlarmChanged {
            alarm: Box::new(alarm),
        });
        Ok(())
    }

    /// Apply `f` to the current alarm. Returns `None` for unknown ids.
    pub async fn update(
        &self,
        id: AlarmId,
        f: impl FnOnce(&mut Alarm) + Send + 'static,
    ) -> Result<Option<Alarm>> {
        let mut updated = self.update_many(vec![(id, Box::new(f) as AlarmPatch)]).await?;
        Ok(updated.pop())
    }

    /// Apply several patches in one atomic storage write. Unknown ids are
    /// skipped; the returned alarms are the ones that changed.
    pub async fn update_many(&self, patches: Vec<(AlarmId, AlarmPatch)>) -> Result<Vec<Alarm>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }

        let _writer = self.writer.lock().await;
        let mut changed = Vec::with_capacity(patches.len());
        {
            let state = self.state.read().await;
            for (id, patch) in patches {
                // Patches for the same id compose in order.
                let pending = changed.iter().rposition(|a: &Alarm| a.id == id);
                let current = match pending {
                    Some(i) => Some(changed.remove(i)),
                    None => state.alarms.get(&id).cloned(),
                };
                let Some(mut alarm) = current else {
                    debug!("Skipping patch for unknown alarm {id}");
                    continue;
                };
                patch(&mut alarm);
                changed.push(alarm);
            }
        }

        let mut ops = Vec::with_capacity(changed.len());
        for alarm in &changed {
            ops.push(WriteOp::put(alarm_key(alarm.id), serde_json::to_value(alarm)?));
        }
        self.store.write_batch(ops).await?;

        {
            let mut state = self.state.write().await;
            for alarm in &changed {
                state.alarms.insert(alarm.id, alarm.clone());
            }
        }
        for alarm in &changed {
            self.events.publish(CoreEvent::AlarmChanged {
                alarm: Box::new(alarm.clone()),
            });
        }
        Ok(changed)
    }

    pub async fn remove(&self, id: AlarmId) -> Result<Option<Alarm>> {
        let _writer = self.writer.lock().await;
        if !self.state.read().await.alarms.contains_key(&id) {
            return Ok(None);
        }
        self.store.delete(&alarm_key(id)).await?;
        let removed = self.state.write().await.alarms.remove(&id);
        self.events.publish(CoreEvent::AlarmDeleted { alarm_id: id });
        Ok(removed)
    }

    pub async fn add_intent(&self, intent: Intent) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store
            .put(&intent_key(intent.id), serde_json::to_value(&intent)?)
            .await?;
        self.state.write().await.intents.insert(intent.id, intent);
        Ok(())
    }

    pub async fn get_intent(&self, id: IntentId) -> Option<Intent> {
        self.state.read().await.intents.get(&id).cloned()
    }

    pub async fn intents(&self) -> Vec<Intent> {
        let mut intents: Vec<Intent> = self.state.read().await.intents.values().cloned().collect();
        intents.sort_by_key(|i| i.created_at);
        intents
    }

    /// Drop intents older than `max_age`. Returns how many were removed.
    pub async fn purge_expired_intents(
        &self,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let expired: Vec<IntentId> = self
            .state
            .read()
            .await
            .intents
            .values()
            .filter(|i| i.is_expired(now, max_age))
            .map(|i| i.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let ops = expired.iter().map(|id| WriteOp::delete(intent_key(*id))).collect();
        self.store.write_batch(ops).await?;

        let mut state = self.state.write().await;
        for id in &expired {
            state.intents.remove(id);
        }
        info!("Purged {} expired intents", expired.len());
        Ok(expired.len())
    }
}
