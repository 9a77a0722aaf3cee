//! Data models for Drop Farmer

use crate::clock;
use crate::conditions::Condition;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schedule bounds in minutes
pub const MIN_SCHEDULE_MINUTES: u32 = 1;
pub const MAX_SCHEDULE_MINUTES: u32 = 60;

/// Site/platform kind of a farm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FarmType {
    Youtube,
    Twitch,
    Website,
}

/// Farm status - exactly one per farm at any time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FarmStatus {
    Idle,
    Checking,
    Farming,
    ConditionFulfilled,
    Disabled,
    AttentionRequired,
}

impl FarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FarmStatus::Idle => "idle",
            FarmStatus::Checking => "checking",
            FarmStatus::Farming => "farming",
            FarmStatus::ConditionFulfilled => "condition-fulfilled",
            FarmStatus::Disabled => "disabled",
            FarmStatus::AttentionRequired => "attention-required",
        }
    }
}

impl fmt::Display for FarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main Farm struct, also used as the snapshot handed to listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Farm {
    pub id: String,
    #[serde(rename = "type")]
    pub farm_type: FarmType,
    pub url: String,
    /// Check interval in minutes
    pub schedule: u32,
    pub enabled: bool,
    pub is_protected: bool,
    pub status: FarmStatus,
    pub condition: Condition,
    /// Open check/farm windows reported by the last check cycle
    pub windows: u32,
    pub uptime_ms: u64,
    /// Why the farm was disabled at load, if its stored state was unusable
    pub diagnostic: Option<String>,
}

impl Farm {
    pub fn from_config(config: FarmConfig, condition: Condition) -> Self {
        Self {
            status: if config.enabled {
                FarmStatus::Idle
            } else {
                FarmStatus::Disabled
            },
            id: config.id,
            farm_type: config.farm_type,
            url: config.url,
            schedule: config.schedule,
            enabled: config.enabled,
            is_protected: config.is_protected,
            condition,
            windows: 0,
            uptime_ms: config.uptime_ms,
            diagnostic: None,
        }
    }

    /// Farm kept in the registry but disabled because its stored state could not be used
    pub fn disabled_with_diagnostic(config: FarmConfig, diagnostic: String) -> Self {
        let mut farm = Farm::from_config(
            FarmConfig {
                enabled: false,
                ..config
            },
            Condition::unlimited(),
        );
        farm.diagnostic = Some(diagnostic);
        farm
    }

    pub fn config(&self) -> FarmConfig {
        FarmConfig {
            id: self.id.clone(),
            farm_type: self.farm_type,
            url: self.url.clone(),
            schedule: self.schedule,
            enabled: self.enabled,
            is_protected: self.is_protected,
            uptime_ms: self.uptime_ms,
        }
    }

    pub fn uptime_minutes(&self) -> u64 {
        clock::ms_to_minutes(self.uptime_ms)
    }
}

/// Reject schedules outside [1, 60] minutes
pub fn validate_schedule(farm_id: &str, minutes: u32) -> Result<()> {
    if !(MIN_SCHEDULE_MINUTES..=MAX_SCHEDULE_MINUTES).contains(&minutes) {
        return Err(EngineError::config(
            farm_id,
            format!(
                "schedule must be between {} and {} minutes, got {}",
                MIN_SCHEDULE_MINUTES, MAX_SCHEDULE_MINUTES, minutes
            ),
        ));
    }
    Ok(())
}

/// User request to add a farm
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFarm {
    pub id: String,
    #[serde(rename = "type")]
    pub farm_type: FarmType,
    pub url: String,
    pub schedule: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
}

fn default_enabled() -> bool {
    true
}

/// Persisted farm settings (everything except the condition)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FarmConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub farm_type: FarmType,
    pub url: String,
    pub schedule: u32,
    pub enabled: bool,
    pub is_protected: bool,
    #[serde(default)]
    pub uptime_ms: u64,
}

/// Partial update of a stored farm config. Only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct FarmConfigPatch {
    pub url: Option<String>,
    pub schedule: Option<u32>,
    pub enabled: Option<bool>,
    pub uptime_ms: Option<u64>,
}

impl FarmConfigPatch {
    pub fn apply(&self, config: &mut FarmConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(schedule) = self.schedule {
            config.schedule = schedule;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(uptime_ms) = self.uptime_ms {
            config.uptime_ms = uptime_ms;
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Farming,
    Idle,
    Failed,
}

/// Check history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    pub run_id: String,
    pub farm_id: String,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    pub result: CheckResult,
    pub elapsed_ms: u64,
    pub error_message: Option<String>,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub check_timeout_seconds: u64,
    pub show_notifications: bool,
    pub event_capacity: usize,
    pub period_sweep_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_timeout_seconds: 300,
            show_notifications: true,
            event_capacity: 64,
            period_sweep_minutes: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool) -> FarmConfig {
        FarmConfig {
            id: "valorant".to_string(),
            farm_type: FarmType::Website,
            url: "https://valorantesports.com/".to_string(),
            schedule: 5,
            enabled,
            is_protected: true,
            uptime_ms: 0,
        }
    }

    #[test]
    fn test_initial_status_follows_enabled() {
        let farm = Farm::from_config(config(true), Condition::unlimited());
        assert_eq!(farm.status, FarmStatus::Idle);

        let farm = Farm::from_config(config(false), Condition::unlimited());
        assert_eq!(farm.status, FarmStatus::Disabled);
    }

    #[test]
    fn test_schedule_bounds() {
        assert!(validate_schedule("a", 1).is_ok());
        assert!(validate_schedule("a", 60).is_ok());
        assert!(validate_schedule("a", 0).is_err());
        assert!(validate_schedule("a", 61).is_err());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&FarmStatus::AttentionRequired).unwrap();
        assert_eq!(json, "\"attention-required\"");
        assert_eq!(FarmStatus::ConditionFulfilled.to_string(), "condition-fulfilled");
    }

    #[test]
    fn test_patch_only_touches_set_fields() {
        let mut stored = config(true);
        FarmConfigPatch {
            schedule: Some(15),
            ..Default::default()
        }
        .apply(&mut stored);
        assert_eq!(stored.schedule, 15);
        assert!(stored.enabled);
        assert_eq!(stored.url, "https://valorantesports.com/");
    }

    #[test]
    fn test_disabled_with_diagnostic() {
        let farm = Farm::disabled_with_diagnostic(config(true), "bad condition".to_string());
        assert_eq!(farm.status, FarmStatus::Disabled);
        assert!(!farm.enabled);
        assert_eq!(farm.diagnostic.as_deref(), Some("bad condition"));
    }
}
