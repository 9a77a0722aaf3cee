//! Error types shared across the engine

use crate::check::CheckError;
use crate::models::FarmStatus;
use crate::status::StatusEvent;
use crate::storage::StorageError;
use thiserror::Error;

/// Broad class of an [`EngineError`], used by callers to decide how to surface it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    State,
    CheckCycle,
    Persistence,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration for farm {farm_id}: {reason}")]
    Config { farm_id: String, reason: String },

    #[error("Farm {0} is protected and cannot be deleted")]
    ProtectedFarm(String),

    #[error("Farm {0} already exists")]
    FarmExists(String),

    #[error("Farm {0} not found")]
    FarmNotFound(String),

    #[error("Farm {farm_id} cannot go from {from} on {event:?}")]
    InvalidTransition {
        farm_id: String,
        from: FarmStatus,
        event: StatusEvent,
    },

    #[error("Check cycle failed: {0}")]
    Check(#[from] CheckError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn config(farm_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Config {
            farm_id: farm_id.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config { .. } | EngineError::ProtectedFarm(_) | EngineError::FarmExists(_) => {
                ErrorKind::Configuration
            }
            EngineError::FarmNotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidTransition { .. } => ErrorKind::State,
            EngineError::Check(_) => ErrorKind::CheckCycle,
            EngineError::Storage(StorageError::Malformed { .. }) => ErrorKind::Configuration,
            EngineError::Storage(_) => ErrorKind::Persistence,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
