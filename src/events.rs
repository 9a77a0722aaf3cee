//! Events module - Domain events published to the UI and notification layers

use crate::models::{Farm, FarmStatus};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum FarmEvent {
    StatusChanged {
        farm_id: String,
        status: FarmStatus,
        snapshot: Box<Farm>,
    },
    ConditionFulfilled {
        farm_id: String,
    },
    AttentionRequired {
        farm_id: String,
        reason: String,
    },
}

impl FarmEvent {
    pub fn farm_id(&self) -> &str {
        match self {
            FarmEvent::StatusChanged { farm_id, .. }
            | FarmEvent::ConditionFulfilled { farm_id }
            | FarmEvent::AttentionRequired { farm_id, .. } => farm_id,
        }
    }
}

/// Fan-out of farm events. Publishing never blocks and never fails the caller.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FarmEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.tx.subscribe()
    }

    pub fn status_changed(&self, farm: &Farm) {
        self.publish(FarmEvent::StatusChanged {
            farm_id: farm.id.clone(),
            status: farm.status,
            snapshot: Box::new(farm.clone()),
        });
    }

    pub fn condition_fulfilled(&self, farm_id: &str) {
        self.publish(FarmEvent::ConditionFulfilled {
            farm_id: farm_id.to_string(),
        });
    }

    pub fn attention_required(&self, farm_id: &str, reason: impl Into<String>) {
        self.publish(FarmEvent::AttentionRequired {
            farm_id: farm_id.to_string(),
            reason: reason.into(),
        });
    }

    fn publish(&self, event: FarmEvent) {
        // No receivers is fine; nobody is listening yet
        if self.tx.send(event).is_err() {
            tracing::trace!("Farm event dropped, no listeners");
        }
    }
}
