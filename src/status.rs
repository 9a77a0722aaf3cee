//! Status module - Farm state machine

use crate::error::{EngineError, Result};
use crate::models::{Farm, FarmStatus};

/// Something that happened to a farm and may move its status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Tick,
    CheckSucceeded { content_found: bool },
    CheckFailed,
    ConditionFulfilled,
    CycleEnded,
    /// A non-repeating period ran out before the condition was met
    PeriodExpired,
    ResetConditions,
    Disable,
    Enable,
    Restart,
}

/// A status change that was applied to a farm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: FarmStatus,
    pub to: FarmStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl FarmStatus {
    /// Status after `event`, or `None` if the event is not allowed here
    pub fn next(self, event: StatusEvent) -> Option<FarmStatus> {
        use crate::models::FarmStatus::*;

        match (self, event) {
            (_, StatusEvent::Disable) => Some(Disabled),
            (Disabled, StatusEvent::Enable) => Some(Idle),
            (other, StatusEvent::Enable) => Some(other),
            // Restarting never re-enables a farm
            (Disabled, StatusEvent::Restart) => Some(Disabled),
            (_, StatusEvent::Restart) => Some(Idle),

            (Idle, StatusEvent::Tick) => Some(Checking),
            (Checking, StatusEvent::CheckSucceeded { content_found: true }) => Some(Farming),
            (Checking, StatusEvent::CheckSucceeded { content_found: false }) => Some(Idle),
            (Checking, StatusEvent::CheckFailed) => Some(AttentionRequired),

            (Farming, StatusEvent::ConditionFulfilled) => Some(ConditionFulfilled),
            // Restarted farm whose condition was met earlier in the period
            (Idle, StatusEvent::ConditionFulfilled) => Some(ConditionFulfilled),
            (Farming, StatusEvent::CycleEnded) => Some(Idle),
            (Farming, StatusEvent::PeriodExpired) => Some(AttentionRequired),

            (ConditionFulfilled | AttentionRequired, StatusEvent::ResetConditions) => Some(Idle),
            (other, StatusEvent::ResetConditions) => Some(other),

            _ => None,
        }
    }

    /// Whether the farm's timer should stay armed in this status
    pub fn keeps_ticking(self) -> bool {
        matches!(self, FarmStatus::Idle | FarmStatus::Checking | FarmStatus::Farming)
    }
}

impl Farm {
    /// Move the farm's status on `event`
    pub fn apply(&mut self, event: StatusEvent) -> Result<Transition> {
        let from = self.status;
        let to = from.next(event).ok_or_else(|| EngineError::InvalidTransition {
            farm_id: self.id.clone(),
            from,
            event,
        })?;
        self.status = to;
        if from != to {
            tracing::debug!("Farm {}: {} -> {} ({:?})", self.id, from, to, event);
        }
        Ok(Transition { from, to })
    }
}
