//! Publish/subscribe surface consumed by UIs and analytics.
//!
//! The core never calls into a consumer; it publishes [`CoreEvent`]s and
//! consumers attach receivers. Lagging receivers drop old events rather than
//! slowing the core down.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::cache::HealthReport;
use crate::generation::GenerationStatus;
use crate::model::{Alarm, AlarmId, DismissalRecord};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    AlarmChanged {
        alarm: Box<Alarm>,
    },
    AlarmDeleted {
        alarm_id: AlarmId,
    },
    Generation {
        alarm_id: AlarmId,
        status: GenerationStatus,
    },
    Ringing {
        alarm_id: AlarmId,
        fallback: bool,
    },
    Dismissal {
        alarm_id: AlarmId,
        record: DismissalRecord,
    },
    CacheHealth {
        report: HealthReport,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        trace!("Publishing {event:?}");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
