//! Drop Farmer - Core library
//!
//! Schedules farm checks, tracks watch-time conditions and persists their progress

pub mod check;
pub mod clock;
pub mod conditions;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod status;
pub mod storage;

pub use error::{EngineError, ErrorKind, Result};
pub use manager::FarmManager;
pub use models::*;
