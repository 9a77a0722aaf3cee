//! Farm manager - Owns the farm registry and serves add/delete/restart/reset/enable requests

use crate::check::CheckCycle;
use crate::conditions::Condition;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, FarmEvent};
use crate::models::*;
use crate::scheduler::{FarmRegistry, RestartHook, Scheduler, TickOutcome};
use crate::status::StatusEvent;
use crate::storage::{FarmStore, StorageError, StoredFarm};
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What happened to the stored farms during [`FarmManager::load`]
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Farms kept disabled because their stored state was unusable, with the reason
    pub disabled: Vec<(String, String)>,
}

pub struct FarmManager {
    farms: FarmRegistry,
    scheduler: Scheduler,
    store: Arc<dyn FarmStore>,
    checker: Arc<dyn CheckCycle>,
    events: EventBus,
}

impl FarmManager {
    pub fn new(store: Arc<dyn FarmStore>, checker: Arc<dyn CheckCycle>, settings: &Settings) -> Self {
        let farms: FarmRegistry = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let events = EventBus::new(settings.event_capacity);
        let scheduler = Scheduler::new(
            farms.clone(),
            checker.clone(),
            store.clone(),
            events.clone(),
            Duration::from_secs(settings.check_timeout_seconds),
        );
        Self {
            farms,
            scheduler,
            store,
            checker,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Read every stored farm into the registry. Farms with unusable state are kept disabled.
    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let stored = self.store.list_farm_configs()?;
        let mut farms = self.farms.lock().await;

        for row in stored {
            let id = row.id().to_string();
            let (config, restored) = match row {
                StoredFarm::Valid(config) => {
                    let restored = self.restore(config.clone());
                    (config, restored)
                }
                StoredFarm::Malformed { config, error } => (config, Err(error.into())),
            };
            let farm = match restored {
                Ok(farm) => {
                    report.loaded.push(id.clone());
                    farm
                }
                Err(e) if e.kind() == crate::error::ErrorKind::Configuration => {
                    let diagnostic = e.to_string();
                    tracing::warn!("Farm {} disabled at load: {}", id, diagnostic);
                    self.events.attention_required(&id, diagnostic.clone());
                    report.disabled.push((id.clone(), diagnostic.clone()));
                    Farm::disabled_with_diagnostic(config, diagnostic)
                }
                Err(e) => return Err(e),
            };
            farms.insert(id, farm);
        }

        tracing::info!(
            "Loaded {} farms ({} disabled by bad state)",
            farms.len(),
            report.disabled.len()
        );
        Ok(report)
    }

    fn restore(&self, config: FarmConfig) -> Result<Farm> {
        validate_schedule(&config.id, config.schedule)?;
        let condition = match self.store.get_condition_state(&config.id)? {
            Some(condition) => {
                condition
                    .validate()
                    .map_err(|reason| EngineError::config(&config.id, reason))?;
                condition
            }
            None => {
                let condition = Condition::unlimited();
                self.save_condition(&config.id, &condition);
                condition
            }
        };

        let mut farm = Farm::from_config(config, condition);
        if farm.enabled && farm.condition.is_fulfilled() {
            farm.status = FarmStatus::ConditionFulfilled;
        }
        Ok(farm)
    }

    /// Arm timers for every farm that should tick. Returns how many were started.
    pub async fn start_all(&self) -> Result<usize> {
        let ids: Vec<String> = self.farms.lock().await.keys().cloned().collect();
        let mut started = 0;
        for id in ids {
            if self.scheduler.start(&id).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Add a built-in, protected farm unless one with the same id already exists
    pub async fn seed(&self, new: NewFarm) -> Result<bool> {
        if self.farms.lock().await.contains_key(&new.id) {
            return Ok(false);
        }
        self.insert(new, true).await?;
        Ok(true)
    }

    pub async fn add_farm(&self, new: NewFarm) -> Result<Farm> {
        self.insert(new, false).await
    }

    async fn insert(&self, new: NewFarm, is_protected: bool) -> Result<Farm> {
        validate_new_farm(&new)?;

        let farm = {
            let mut farms = self.farms.lock().await;
            if farms.contains_key(&new.id) {
                return Err(EngineError::FarmExists(new.id));
            }
            let mut condition = new.condition;
            condition.reset(Utc::now());
            let config = FarmConfig {
                id: new.id,
                farm_type: new.farm_type,
                url: new.url,
                schedule: new.schedule,
                enabled: new.enabled,
                is_protected,
                uptime_ms: 0,
            };
            let farm = Farm::from_config(config, condition);
            farms.insert(farm.id.clone(), farm.clone());
            farm
        };

        if let Err(e) = self.store.insert_farm_config(&farm.config()) {
            tracing::error!("Failed to save new farm {}: {}", farm.id, e);
        }
        self.save_condition(&farm.id, &farm.condition);
        tracing::info!("Added farm {} ({:?}, every {} min)", farm.id, farm.farm_type, farm.schedule);

        self.events.status_changed(&farm);
        self.scheduler.start(&farm.id).await?;
        Ok(farm)
    }

    pub async fn delete_farm(&self, farm_id: &str) -> Result<()> {
        {
            let mut farms = self.farms.lock().await;
            let farm = farms
                .get(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            if farm.is_protected {
                return Err(EngineError::ProtectedFarm(farm_id.to_string()));
            }
            farms.remove(farm_id);
        }

        self.scheduler.stop(farm_id);
        if let Err(e) = self.store.delete_farm(farm_id) {
            tracing::error!("Failed to delete stored farm {}: {}", farm_id, e);
        }
        tracing::info!("Deleted farm {}", farm_id);
        Ok(())
    }

    pub async fn restart_schedule(&self, farm_id: &str, interval: Option<u32>) -> Result<bool> {
        let started = self.scheduler.restart(farm_id, interval, None).await?;
        if let Some(schedule) = interval {
            self.save_config(
                farm_id,
                FarmConfigPatch {
                    schedule: Some(schedule),
                    ..Default::default()
                },
            );
        }
        Ok(started)
    }

    pub async fn reset_conditions(&self, farm_id: &str) -> Result<Farm> {
        self.scheduler.reset_conditions(farm_id).await
    }

    /// Clear the farm's cached session through the check provider, then rebuild its timer
    pub async fn clear_cache_then_restart(&self, farm_id: &str) -> Result<bool> {
        let snapshot = self
            .farm(farm_id)
            .await
            .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
        let checker = self.checker.clone();
        let hook: RestartHook<'_> = async move {
            checker.clear_cache(&snapshot).await?;
            Ok(())
        }
        .boxed();
        self.scheduler.restart(farm_id, None, Some(hook)).await
    }

    pub async fn set_enabled(&self, farm_id: &str, enabled: bool) -> Result<Farm> {
        let farm = {
            let mut farms = self.farms.lock().await;
            let farm = farms
                .get_mut(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            if enabled {
                if let Some(diagnostic) = &farm.diagnostic {
                    return Err(EngineError::config(farm_id, diagnostic.clone()));
                }
            }
            let event = if enabled {
                StatusEvent::Enable
            } else {
                StatusEvent::Disable
            };
            farm.enabled = enabled;
            if farm.apply(event)?.changed() {
                self.events.status_changed(farm);
            }
            farm.clone()
        };

        self.save_config(
            farm_id,
            FarmConfigPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        );
        if enabled {
            self.scheduler.start(farm_id).await?;
        } else {
            self.scheduler.stop(farm_id);
        }
        tracing::info!("Farm {} {}", farm_id, if enabled { "enabled" } else { "disabled" });
        Ok(farm)
    }

    /// Run a check cycle right away instead of waiting for the timer
    pub async fn check_now(&self, farm_id: &str) -> Result<TickOutcome> {
        self.scheduler.tick(farm_id).await
    }

    /// Reset fulfilled repeating farms whose period has ended. Returns the ids that were reset.
    pub async fn refresh_periods(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let due: Vec<String> = self
            .farms
            .lock()
            .await
            .values()
            .filter(|farm| farm.status == FarmStatus::ConditionFulfilled && farm.condition.due_for_repeat(now))
            .map(|farm| farm.id.clone())
            .collect();

        for farm_id in &due {
            tracing::info!("Period for farm {} ended, starting a new one", farm_id);
            self.scheduler.reset_conditions(farm_id).await?;
        }
        Ok(due)
    }

    pub async fn farm(&self, farm_id: &str) -> Option<Farm> {
        self.farms.lock().await.get(farm_id).cloned()
    }

    pub async fn farms(&self) -> Vec<Farm> {
        let mut farms: Vec<Farm> = self.farms.lock().await.values().cloned().collect();
        farms.sort_by(|a, b| a.id.cmp(&b.id));
        farms
    }

    pub fn is_scheduled(&self, farm_id: &str) -> bool {
        self.scheduler.is_scheduled(farm_id)
    }

    pub fn shutdown(&self) {
        self.scheduler.stop_all();
    }

    fn save_condition(&self, farm_id: &str, condition: &Condition) {
        if let Err(e) = self.store.save_condition_state(farm_id, condition) {
            tracing::error!("Failed to save condition for farm {}: {}", farm_id, e);
        }
    }

    fn save_config(&self, farm_id: &str, patch: FarmConfigPatch) {
        match self.store.save_farm_config(farm_id, &patch) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                tracing::warn!("Farm {} missing from store, config change kept in memory", farm_id)
            }
            Err(e) => tracing::error!("Failed to save config for farm {}: {}", farm_id, e),
        }
    }
}

fn validate_new_farm(new: &NewFarm) -> Result<()> {
    if new.id.trim().is_empty() || new.id.trim() != new.id {
        return Err(EngineError::config(&new.id, "id must be non-empty without surrounding spaces"));
    }
    validate_schedule(&new.id, new.schedule)?;
    match url::Url::parse(&new.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => {
            return Err(EngineError::config(
                &new.id,
                format!("unsupported url scheme {}", url.scheme()),
            ))
        }
        Err(e) => return Err(EngineError::config(&new.id, format!("invalid url {}: {}", new.url, e))),
    }
    new.condition
        .validate()
        .map_err(|reason| EngineError::config(&new.id, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckError, CheckOutcome};
    use crate::clock;
    use crate::conditions::PeriodicCondition;
    use crate::error::ErrorKind;
    use crate::storage::{Database, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingChecker {
        checks: AtomicUsize,
        cache_clears: AtomicUsize,
        fail_cache_clear: bool,
    }

    #[async_trait]
    impl CheckCycle for CountingChecker {
        async fn run_check_cycle(&self, _farm: &Farm) -> std::result::Result<CheckOutcome, CheckError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(CheckOutcome {
                content_found: true,
                elapsed_ms: clock::MS_PER_HOUR,
                windows: 1,
            })
        }

        async fn clear_cache(&self, _farm: &Farm) -> std::result::Result<(), CheckError> {
            self.cache_clears.fetch_add(1, Ordering::SeqCst);
            if self.fail_cache_clear {
                return Err(CheckError::CacheClear("profile locked".to_string()));
            }
            Ok(())
        }
    }

    fn new_farm(id: &str) -> NewFarm {
        NewFarm {
            id: id.to_string(),
            farm_type: FarmType::Youtube,
            url: format!("https://www.youtube.com/@{}", id),
            schedule: 5,
            enabled: true,
            condition: Condition::unlimited(),
        }
    }

    fn manager_with(store: Arc<dyn FarmStore>, checker: Arc<CountingChecker>) -> FarmManager {
        FarmManager::new(store, checker, &Settings::default())
    }

    fn manager() -> (FarmManager, Arc<MemoryStore>, Arc<CountingChecker>) {
        let store = Arc::new(MemoryStore::new());
        let checker = Arc::new(CountingChecker::default());
        (manager_with(store.clone(), checker.clone()), store, checker)
    }

    #[tokio::test]
    async fn test_add_farm_persists_and_schedules() {
        let (manager, store, _) = manager();

        let farm = manager.add_farm(new_farm("lolesports")).await.unwrap();

        assert_eq!(farm.status, FarmStatus::Idle);
        assert!(!farm.is_protected);
        assert!(manager.is_scheduled("lolesports"));
        assert_eq!(store.get_farm_config("lolesports").unwrap().unwrap().schedule, 5);
        assert!(store.get_condition_state("lolesports").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_farm_rejects_bad_input() {
        let (manager, _, _) = manager();
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        let duplicate = manager.add_farm(new_farm("lolesports")).await.unwrap_err();
        assert!(matches!(duplicate, EngineError::FarmExists(_)));

        let too_slow = NewFarm {
            schedule: 61,
            ..new_farm("slow")
        };
        assert_eq!(manager.add_farm(too_slow).await.unwrap_err().kind(), ErrorKind::Configuration);

        let bad_url = NewFarm {
            url: "not a url".to_string(),
            ..new_farm("broken")
        };
        assert_eq!(manager.add_farm(bad_url).await.unwrap_err().kind(), ErrorKind::Configuration);

        let ftp = NewFarm {
            url: "ftp://example.com/".to_string(),
            ..new_farm("ftp")
        };
        assert!(manager.add_farm(ftp).await.is_err());
        assert_eq!(manager.farms().await.len(), 1);
    }

    #[tokio::test]
    async fn test_protected_farm_cannot_be_deleted() {
        let (manager, store, _) = manager();
        assert!(manager.seed(new_farm("valorant")).await.unwrap());
        assert!(!manager.seed(new_farm("valorant")).await.unwrap());

        let err = manager.delete_farm("valorant").await.unwrap_err();

        assert!(matches!(err, EngineError::ProtectedFarm(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(manager.farm("valorant").await.is_some());
        assert!(manager.is_scheduled("valorant"));
        assert!(store.get_farm_config("valorant").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_farm_removes_everything() {
        let (manager, store, _) = manager();
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        manager.delete_farm("lolesports").await.unwrap();

        assert!(manager.farm("lolesports").await.is_none());
        assert!(!manager.is_scheduled("lolesports"));
        assert!(store.get_farm_config("lolesports").unwrap().is_none());
        assert!(matches!(
            manager.delete_farm("lolesports").await.unwrap_err(),
            EngineError::FarmNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_set_enabled_toggles_timer() {
        let (manager, store, _) = manager();
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        let farm = manager.set_enabled("lolesports", false).await.unwrap();
        assert_eq!(farm.status, FarmStatus::Disabled);
        assert!(!manager.is_scheduled("lolesports"));
        assert!(!store.get_farm_config("lolesports").unwrap().unwrap().enabled);
        assert_eq!(manager.check_now("lolesports").await.unwrap(), TickOutcome::Skipped);

        let farm = manager.set_enabled("lolesports", true).await.unwrap();
        assert_eq!(farm.status, FarmStatus::Idle);
        assert!(manager.is_scheduled("lolesports"));
    }

    #[tokio::test]
    async fn test_restart_schedule_persists_interval() {
        let (manager, store, _) = manager();
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        assert!(manager.restart_schedule("lolesports", Some(20)).await.unwrap());

        assert_eq!(
            manager.scheduler().scheduled_interval("lolesports"),
            Some(Duration::from_secs(20 * 60))
        );
        assert_eq!(store.get_farm_config("lolesports").unwrap().unwrap().schedule, 20);
    }

    #[tokio::test]
    async fn test_clear_cache_then_restart() {
        let (manager, _, checker) = manager();
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        assert!(manager.clear_cache_then_restart("lolesports").await.unwrap());
        assert_eq!(checker.cache_clears.load(Ordering::SeqCst), 1);
        assert!(manager.is_scheduled("lolesports"));
    }

    #[tokio::test]
    async fn test_failed_cache_clear_still_restarts() {
        let store = Arc::new(MemoryStore::new());
        let checker = Arc::new(CountingChecker {
            fail_cache_clear: true,
            ..Default::default()
        });
        let manager = manager_with(store, checker);
        manager.add_farm(new_farm("lolesports")).await.unwrap();

        let err = manager.clear_cache_then_restart("lolesports").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CheckCycle);
        assert!(manager.is_scheduled("lolesports"));
    }

    #[tokio::test]
    async fn test_check_now_and_reset_conditions() {
        let (manager, _, checker) = manager();
        let weekly = NewFarm {
            condition: Condition::Weekly(PeriodicCondition::new(1, 0, false, Utc::now())),
            ..new_farm("lolesports")
        };
        manager.add_farm(weekly).await.unwrap();

        let outcome = manager.check_now("lolesports").await.unwrap();
        assert_eq!(outcome, TickOutcome::Completed(FarmStatus::ConditionFulfilled));
        assert_eq!(checker.checks.load(Ordering::SeqCst), 1);
        assert!(!manager.is_scheduled("lolesports"));

        let farm = manager.reset_conditions("lolesports").await.unwrap();
        assert_eq!(farm.status, FarmStatus::Idle);
        assert_eq!(farm.condition.amount(), 0);
        assert!(manager.is_scheduled("lolesports"));
    }

    #[tokio::test]
    async fn test_load_restores_and_disables_bad_state() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = |id: &str, schedule: u32| FarmConfig {
            id: id.to_string(),
            farm_type: FarmType::Twitch,
            url: format!("https://www.twitch.tv/{}", id),
            schedule,
            enabled: true,
            is_protected: false,
            uptime_ms: 0,
        };
        db.insert_farm_config(&config("good", 5)).unwrap();
        db.insert_farm_config(&config("fresh", 5)).unwrap();
        db.insert_farm_config(&config("slow", 90)).unwrap();
        db.insert_farm_config(&config("garbled", 5)).unwrap();
        db.save_condition_state(
            "good",
            &Condition::Weekly(PeriodicCondition::new(4, 0, true, Utc::now())),
        )
        .unwrap();
        db.execute_raw(
            "INSERT INTO conditions (farm_id, state, updated_at_utc)
             VALUES ('garbled', '{\"type\":\"forever\"}', '2026-10-19T00:00:00Z')",
        )
        .unwrap();

        let manager = manager_with(db.clone(), Arc::new(CountingChecker::default()));
        let mut rx = manager.subscribe();
        let report = manager.load().await.unwrap();

        assert_eq!(report.loaded, vec!["fresh".to_string(), "good".to_string()]);
        let disabled: Vec<_> = report.disabled.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(disabled, vec!["garbled", "slow"]);

        let garbled = manager.farm("garbled").await.unwrap();
        assert_eq!(garbled.status, FarmStatus::Disabled);
        assert!(garbled.diagnostic.is_some());
        assert!(manager.set_enabled("garbled", true).await.is_err());

        assert_eq!(manager.farm("good").await.unwrap().condition.kind(), "weekly");
        assert!(db.get_condition_state("fresh").unwrap().is_some());

        assert_eq!(manager.start_all().await.unwrap(), 2);
        assert!(!manager.is_scheduled("slow"));

        let mut attention = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FarmEvent::AttentionRequired { .. }) {
                attention += 1;
            }
        }
        assert_eq!(attention, 2);
    }

    #[tokio::test]
    async fn test_load_keeps_good_farms_next_to_unknown_farm_type() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.insert_farm_config(&FarmConfig {
            id: "riotgames".to_string(),
            farm_type: FarmType::Twitch,
            url: "https://www.twitch.tv/riotgames".to_string(),
            schedule: 5,
            enabled: true,
            is_protected: false,
            uptime_ms: 0,
        })
        .unwrap();
        db.execute_raw(
            "INSERT INTO farms (id, farm_type, url, schedule, enabled, is_protected, uptime_ms,
                created_at_utc, updated_at_utc)
             VALUES ('kickstream', '\"kick\"', 'https://kick.com/', 5, 1, 0, 0,
                '2026-10-19T00:00:00Z', '2026-10-19T00:00:00Z')",
        )
        .unwrap();

        let manager = manager_with(db, Arc::new(CountingChecker::default()));
        let report = manager.load().await.unwrap();

        assert_eq!(report.loaded, vec!["riotgames".to_string()]);
        assert_eq!(report.disabled.len(), 1);
        assert_eq!(report.disabled[0].0, "kickstream");
        assert_eq!(manager.farms().await.len(), 2);

        let broken = manager.farm("kickstream").await.unwrap();
        assert_eq!(broken.status, FarmStatus::Disabled);
        assert!(broken.diagnostic.as_deref().unwrap_or_default().contains("kick"));

        assert_eq!(manager.start_all().await.unwrap(), 1);
        assert!(manager.is_scheduled("riotgames"));
        assert!(!manager.is_scheduled("kickstream"));
        manager.delete_farm("kickstream").await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_periods_resets_due_farms() {
        let store = Arc::new(MemoryStore::new());
        let long_ago = Utc::now() - chrono::Duration::days(40);
        let mut repeating = PeriodicCondition::new(2, 0, true, long_ago);
        repeating.amount = 2 * clock::MS_PER_HOUR;
        repeating.fulfilled = Some(long_ago);
        let mut once = repeating.clone();
        once.repeat = false;

        for (id, condition) in [
            ("repeating", Condition::Monthly(repeating)),
            ("once", Condition::Monthly(once)),
        ] {
            store
                .insert_farm_config(&FarmConfig {
                    id: id.to_string(),
                    farm_type: FarmType::Website,
                    url: "https://lolesports.com/".to_string(),
                    schedule: 10,
                    enabled: true,
                    is_protected: true,
                    uptime_ms: 0,
                })
                .unwrap();
            store.save_condition_state(id, &condition).unwrap();
        }

        let manager = manager_with(store.clone(), Arc::new(CountingChecker::default()));
        manager.load().await.unwrap();
        assert_eq!(manager.farm("repeating").await.unwrap().status, FarmStatus::ConditionFulfilled);

        let reset = manager.refresh_periods().await.unwrap();

        assert_eq!(reset, vec!["repeating".to_string()]);
        assert_eq!(manager.farm("repeating").await.unwrap().status, FarmStatus::Idle);
        assert!(manager.is_scheduled("repeating"));
        assert_eq!(manager.farm("once").await.unwrap().status, FarmStatus::ConditionFulfilled);
        assert!(!store.get_condition_state("repeating").unwrap().unwrap().is_fulfilled());
    }
}
