//! Storage module - Settings/config store for farms, conditions and check history

use crate::conditions::Condition;
use crate::models::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Malformed stored state for farm {farm_id}: {source}")]
    Malformed {
        farm_id: String,
        source: serde_json::Error,
    },

    #[error("Farm {0} not found in store")]
    NotFound(String),

    #[error("Store is not writable")]
    ReadOnly,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One row of the farms table
#[derive(Debug)]
pub enum StoredFarm {
    Valid(FarmConfig),
    /// Row that could not be decoded. `config` keeps every column that could be read.
    Malformed { config: FarmConfig, error: StorageError },
}

impl StoredFarm {
    pub fn id(&self) -> &str {
        match self {
            StoredFarm::Valid(config) | StoredFarm::Malformed { config, .. } => &config.id,
        }
    }
}

/// Persistence adapter used by the farm manager and scheduler
pub trait FarmStore: Send + Sync {
    /// Every stored farm. A row that fails to decode does not hide the others.
    fn list_farm_configs(&self) -> StorageResult<Vec<StoredFarm>>;
    fn get_farm_config(&self, farm_id: &str) -> StorageResult<Option<FarmConfig>>;
    fn insert_farm_config(&self, config: &FarmConfig) -> StorageResult<()>;
    fn save_farm_config(&self, farm_id: &str, patch: &FarmConfigPatch) -> StorageResult<()>;
    fn delete_farm(&self, farm_id: &str) -> StorageResult<()>;

    fn get_condition_state(&self, farm_id: &str) -> StorageResult<Option<Condition>>;
    fn save_condition_state(&self, farm_id: &str, condition: &Condition) -> StorageResult<()>;

    fn record_check(&self, record: &CheckRecord) -> StorageResult<()>;

    fn get_settings(&self) -> StorageResult<Settings>;
    fn save_settings(&self, settings: &Settings) -> StorageResult<()>;
}

fn to_json<T: serde::Serialize>(farm_id: &str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|source| StorageError::Malformed {
        farm_id: farm_id.to_string(),
        source,
    })
}

fn from_json<T: serde::de::DeserializeOwned>(farm_id: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|source| StorageError::Malformed {
        farm_id: farm_id.to_string(),
        source,
    })
}

/// Parse a stored setting, keeping `current` (the default) when the value is unreadable
fn parse_setting<T: std::str::FromStr>(key: &str, value: &str, current: T) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!("Invalid value {:?} for setting {}, using the default", value, key);
            current
        }
    }
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) {
    match key {
        "check_timeout_seconds" => {
            settings.check_timeout_seconds = parse_setting(key, value, settings.check_timeout_seconds)
        }
        "show_notifications" => {
            settings.show_notifications = parse_setting(key, value, settings.show_notifications)
        }
        "event_capacity" => settings.event_capacity = parse_setting(key, value, settings.event_capacity),
        "period_sweep_minutes" => {
            settings.period_sweep_minutes = parse_setting(key, value, settings.period_sweep_minutes)
        }
        _ => tracing::debug!("Ignoring unknown setting {}", key),
    }
}

fn setting_pairs(settings: &Settings) -> [(&'static str, String); 4] {
    [
        ("check_timeout_seconds", settings.check_timeout_seconds.to_string()),
        ("show_notifications", settings.show_notifications.to_string()),
        ("event_capacity", settings.event_capacity.to_string()),
        ("period_sweep_minutes", settings.period_sweep_minutes.to_string()),
    ]
}

struct FarmRow {
    id: String,
    farm_type: String,
    url: String,
    schedule: i64,
    enabled: bool,
    is_protected: bool,
    uptime_ms: i64,
}

impl FarmRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            farm_type: row.get(1)?,
            url: row.get(2)?,
            schedule: row.get(3)?,
            enabled: row.get::<_, i32>(4)? != 0,
            is_protected: row.get::<_, i32>(5)? != 0,
            uptime_ms: row.get(6)?,
        })
    }

    fn into_config(self) -> StorageResult<FarmConfig> {
        match self.into_stored() {
            StoredFarm::Valid(config) => Ok(config),
            StoredFarm::Malformed { error, .. } => Err(error),
        }
    }

    fn into_stored(self) -> StoredFarm {
        let farm_type = from_json(&self.id, &self.farm_type);
        let mut config = FarmConfig {
            farm_type: FarmType::Website,
            url: self.url,
            schedule: self.schedule.clamp(0, u32::MAX as i64) as u32,
            enabled: self.enabled,
            is_protected: self.is_protected,
            uptime_ms: self.uptime_ms.max(0) as u64,
            id: self.id,
        };
        match farm_type {
            Ok(farm_type) => {
                config.farm_type = farm_type;
                StoredFarm::Valid(config)
            }
            Err(error) => StoredFarm::Malformed { config, error },
        }
    }
}

const FARM_COLUMNS: &str = "id, farm_type, url, schedule, enabled, is_protected, uptime_ms";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run database migrations
    fn run_migrations(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS farms (
                id TEXT PRIMARY KEY,
                farm_type TEXT NOT NULL,
                url TEXT NOT NULL,
                schedule INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                is_protected INTEGER NOT NULL DEFAULT 0,
                uptime_ms INTEGER NOT NULL DEFAULT 0,
                created_at_utc TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conditions (
                farm_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS check_runs (
                run_id TEXT PRIMARY KEY,
                farm_id TEXT NOT NULL,
                started_at_utc TEXT NOT NULL,
                finished_at_utc TEXT NOT NULL,
                result TEXT NOT NULL,
                elapsed_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_check_runs_farm_id ON check_runs(farm_id);
            CREATE INDEX IF NOT EXISTS idx_check_runs_started_at ON check_runs(started_at_utc);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Most recent check runs, newest first
    pub fn recent_checks(&self, limit: u32) -> StorageResult<Vec<CheckRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, farm_id, started_at_utc, finished_at_utc, result, elapsed_ms, error_message
             FROM check_runs ORDER BY started_at_utc DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(run_id, farm_id, started, finished, result, elapsed_ms, error_message)| {
                Ok(CheckRecord {
                    started_at_utc: started.parse().unwrap_or_else(|_| chrono::Utc::now()),
                    finished_at_utc: finished.parse().unwrap_or_else(|_| chrono::Utc::now()),
                    result: from_json(&farm_id, &result)?,
                    elapsed_ms: elapsed_ms.max(0) as u64,
                    error_message,
                    run_id,
                    farm_id,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> StorageResult<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }
}

impl FarmStore for Database {
    fn list_farm_configs(&self) -> StorageResult<Vec<StoredFarm>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM farms ORDER BY id", FARM_COLUMNS))?;
        let rows = stmt
            .query_map([], FarmRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(FarmRow::into_stored).collect())
    }

    fn get_farm_config(&self, farm_id: &str) -> StorageResult<Option<FarmConfig>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM farms WHERE id = ?1", FARM_COLUMNS),
                params![farm_id],
                FarmRow::from_row,
            )
            .optional()?;
        row.map(FarmRow::into_config).transpose()
    }

    fn insert_farm_config(&self, config: &FarmConfig) -> StorageResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO farms (id, farm_type, url, schedule, enabled, is_protected, uptime_ms,
                created_at_utc, updated_at_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                config.id,
                to_json(&config.id, &config.farm_type)?,
                config.url,
                config.schedule,
                config.enabled as i32,
                config.is_protected as i32,
                config.uptime_ms as i64,
                now,
            ],
        )?;
        Ok(())
    }

    fn save_farm_config(&self, farm_id: &str, patch: &FarmConfigPatch) -> StorageResult<()> {
        let mut config = self
            .get_farm_config(farm_id)?
            .ok_or_else(|| StorageError::NotFound(farm_id.to_string()))?;
        patch.apply(&mut config);

        self.conn().execute(
            "UPDATE farms SET url=?2, schedule=?3, enabled=?4, uptime_ms=?5, updated_at_utc=?6
             WHERE id=?1",
            params![
                farm_id,
                config.url,
                config.schedule,
                config.enabled as i32,
                config.uptime_ms as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_farm(&self, farm_id: &str) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM farms WHERE id = ?1", params![farm_id])?;
        conn.execute("DELETE FROM conditions WHERE farm_id = ?1", params![farm_id])?;
        Ok(())
    }

    fn get_condition_state(&self, farm_id: &str) -> StorageResult<Option<Condition>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT state FROM conditions WHERE farm_id = ?1",
                params![farm_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| from_json(farm_id, &raw)).transpose()
    }

    fn save_condition_state(&self, farm_id: &str, condition: &Condition) -> StorageResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO conditions (farm_id, state, updated_at_utc) VALUES (?1, ?2, ?3)",
            params![farm_id, to_json(farm_id, condition)?, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn record_check(&self, record: &CheckRecord) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO check_runs (run_id, farm_id, started_at_utc, finished_at_utc, result,
                elapsed_ms, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id,
                record.farm_id,
                record.started_at_utc.to_rfc3339(),
                record.finished_at_utc.to_rfc3339(),
                to_json(&record.farm_id, &record.result)?,
                record.elapsed_ms as i64,
                record.error_message,
            ],
        )?;
        Ok(())
    }

    fn get_settings(&self) -> StorageResult<Settings> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut settings = Settings::default();
        for row in rows {
            let (key, value) = row?;
            apply_setting(&mut settings, &key, &value);
        }
        Ok(settings)
    }

    fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        let conn = self.conn();
        for (key, value) in setting_pairs(settings) {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }
}

/// Store kept entirely in memory. Writes can be switched off to simulate a broken disk.
#[derive(Default)]
pub struct MemoryStore {
    farms: Mutex<HashMap<String, FarmConfig>>,
    conditions: Mutex<HashMap<String, Condition>>,
    checks: Mutex<Vec<CheckRecord>>,
    settings: Mutex<Settings>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn checks(&self) -> Vec<CheckRecord> {
        lock(&self.checks).clone()
    }

    fn writable(&self) -> StorageResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FarmStore for MemoryStore {
    fn list_farm_configs(&self) -> StorageResult<Vec<StoredFarm>> {
        let mut configs: Vec<_> = lock(&self.farms).values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs.into_iter().map(StoredFarm::Valid).collect())
    }

    fn get_farm_config(&self, farm_id: &str) -> StorageResult<Option<FarmConfig>> {
        Ok(lock(&self.farms).get(farm_id).cloned())
    }

    fn insert_farm_config(&self, config: &FarmConfig) -> StorageResult<()> {
        self.writable()?;
        lock(&self.farms).insert(config.id.clone(), config.clone());
        Ok(())
    }

    fn save_farm_config(&self, farm_id: &str, patch: &FarmConfigPatch) -> StorageResult<()> {
        self.writable()?;
        let mut farms = lock(&self.farms);
        let config = farms
            .get_mut(farm_id)
            .ok_or_else(|| StorageError::NotFound(farm_id.to_string()))?;
        patch.apply(config);
        Ok(())
    }

    fn delete_farm(&self, farm_id: &str) -> StorageResult<()> {
        self.writable()?;
        lock(&self.farms).remove(farm_id);
        lock(&self.conditions).remove(farm_id);
        Ok(())
    }

    fn get_condition_state(&self, farm_id: &str) -> StorageResult<Option<Condition>> {
        Ok(lock(&self.conditions).get(farm_id).cloned())
    }

    fn save_condition_state(&self, farm_id: &str, condition: &Condition) -> StorageResult<()> {
        self.writable()?;
        lock(&self.conditions).insert(farm_id.to_string(), condition.clone());
        Ok(())
    }

    fn record_check(&self, record: &CheckRecord) -> StorageResult<()> {
        self.writable()?;
        lock(&self.checks).push(record.clone());
        Ok(())
    }

    fn get_settings(&self) -> StorageResult<Settings> {
        Ok(lock(&self.settings).clone())
    }

    fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        self.writable()?;
        *lock(&self.settings) = settings.clone();
        Ok(())
    }
}
