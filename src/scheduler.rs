//! Scheduler - One repeating timer per farm driving its check cycles

use crate::check::{CheckCycle, CheckError, CheckOutcome};
use crate::clock;
use crate::conditions::Verdict;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::models::*;
use crate::status::StatusEvent;
use crate::storage::FarmStore;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Farms by id, shared between the manager and the scheduler
pub type FarmRegistry = Arc<tokio::sync::Mutex<HashMap<String, Farm>>>;

/// Async work run between stopping and restarting a farm's timer
pub type RestartHook<'a> = BoxFuture<'a, Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another check for the farm was still running, or the farm cannot be checked right now
    Skipped,
    Completed(FarmStatus),
}

/// Ownership record of a farm's live timer. Dropping it cancels the timer.
pub struct ScheduleHandle {
    farm_id: String,
    interval: Duration,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn farm_id(&self) -> &str {
        &self.farm_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Marks a farm as having a check in flight until dropped
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    farm_id: String,
}

impl<'a> FlightGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<String>>, farm_id: &str) -> Option<Self> {
        if !lock(in_flight).insert(farm_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight,
            farm_id: farm_id.to_string(),
        })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.farm_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    farms: FarmRegistry,
    handles: Mutex<HashMap<String, ScheduleHandle>>,
    in_flight: Mutex<HashSet<String>>,
    checker: Arc<dyn CheckCycle>,
    store: Arc<dyn FarmStore>,
    events: EventBus,
    check_timeout: Duration,
}

/// Scheduler state
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        farms: FarmRegistry,
        checker: Arc<dyn CheckCycle>,
        store: Arc<dyn FarmStore>,
        events: EventBus,
        check_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                farms,
                handles: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                checker,
                store,
                events,
                check_timeout,
            }),
        }
    }

    pub fn is_scheduled(&self, farm_id: &str) -> bool {
        lock(&self.inner.handles).contains_key(farm_id)
    }

    /// Interval of the farm's live timer, if any
    pub fn scheduled_interval(&self, farm_id: &str) -> Option<Duration> {
        lock(&self.inner.handles).get(farm_id).map(ScheduleHandle::interval)
    }

    pub fn is_in_flight(&self, farm_id: &str) -> bool {
        lock(&self.inner.in_flight).contains(farm_id)
    }

    /// Arm the farm's timer. The first tick fires one full interval from now.
    ///
    /// Returns `false` when the farm is in a status that does not tick.
    pub async fn start(&self, farm_id: &str) -> Result<bool> {
        let interval = {
            let farms = self.inner.farms.lock().await;
            let farm = farms
                .get(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            if !farm.enabled || !farm.status.keeps_ticking() {
                tracing::debug!("Not scheduling farm {} in status {}", farm_id, farm.status);
                drop(farms);
                self.stop(farm_id);
                return Ok(false);
            }
            validate_schedule(farm_id, farm.schedule)?;
            Duration::from_millis(clock::minutes_to_ms(farm.schedule))
        };

        self.stop(farm_id);
        let handle = self.spawn_timer(farm_id, interval);
        lock(&self.inner.handles).insert(farm_id.to_string(), handle);
        tracing::info!("Scheduled farm {} every {:?}", farm_id, interval);
        Ok(true)
    }

    fn spawn_timer(&self, farm_id: &str, interval: Duration) -> ScheduleHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = farm_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let scheduler = Scheduler { inner };
                let id = id.clone();
                // Ticks run on their own task so cancelling the timer never aborts a running check
                tokio::spawn(async move {
                    if let Err(e) = scheduler.tick(&id).await {
                        tracing::error!("Tick for farm {} failed: {}", id, e);
                    }
                });
            }
        });

        ScheduleHandle {
            farm_id: farm_id.to_string(),
            interval,
            task,
        }
    }

    /// Cancel the farm's timer. Returns whether one was running.
    pub fn stop(&self, farm_id: &str) -> bool {
        let handle = lock(&self.inner.handles).remove(farm_id);
        match handle {
            Some(handle) => {
                tracing::info!("Stopped schedule for farm {}", handle.farm_id());
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let handles: Vec<_> = lock(&self.inner.handles).drain().map(|(_, h)| h).collect();
        tracing::info!("Stopped {} farm schedules", handles.len());
    }

    /// Stop, optionally change the interval, run `hook`, then start again.
    ///
    /// The timer is rebuilt even when the hook fails; the hook's error is returned afterwards.
    pub async fn restart(
        &self,
        farm_id: &str,
        interval: Option<u32>,
        hook: Option<RestartHook<'_>>,
    ) -> Result<bool> {
        if let Some(minutes) = interval {
            validate_schedule(farm_id, minutes)?;
        }
        if !self.inner.farms.lock().await.contains_key(farm_id) {
            return Err(EngineError::FarmNotFound(farm_id.to_string()));
        }

        self.stop(farm_id);

        let hook_result = match hook {
            Some(hook) => hook.await,
            None => Ok(()),
        };
        if let Err(e) = &hook_result {
            tracing::warn!("Before-restart hook for farm {} failed: {}", farm_id, e);
        }

        {
            let mut farms = self.inner.farms.lock().await;
            let farm = farms
                .get_mut(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            if let Some(minutes) = interval {
                farm.schedule = minutes;
            }
            let transition = farm.apply(StatusEvent::Restart)?;
            if transition.changed() {
                self.inner.events.status_changed(farm);
            }
        }

        let started = self.start(farm_id).await?;
        hook_result?;
        Ok(started)
    }

    /// Reset the farm's condition to a fresh period. A running timer is left alone;
    /// a stopped one is re-armed if the farm can tick again.
    pub async fn reset_conditions(&self, farm_id: &str) -> Result<Farm> {
        let farm = {
            let mut farms = self.inner.farms.lock().await;
            let farm = farms
                .get_mut(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            farm.condition.reset(Utc::now());
            farm.apply(StatusEvent::ResetConditions)?;
            self.inner.events.status_changed(farm);
            farm.clone()
        };
        tracing::info!("Reset conditions for farm {}", farm_id);
        self.persist(&farm);

        if farm.enabled && farm.status.keeps_ticking() && !self.is_scheduled(farm_id) {
            self.start(farm_id).await?;
        }
        Ok(farm)
    }

    /// Run one check cycle for the farm unless one is already running
    pub async fn tick(&self, farm_id: &str) -> Result<TickOutcome> {
        let Some(_flight) = FlightGuard::acquire(&self.inner.in_flight, farm_id) else {
            tracing::debug!("Tick for farm {} skipped, previous check still running", farm_id);
            return Ok(TickOutcome::Skipped);
        };

        let started_at = Utc::now();
        let snapshot = {
            let mut farms = self.inner.farms.lock().await;
            let farm = farms
                .get_mut(farm_id)
                .ok_or_else(|| EngineError::FarmNotFound(farm_id.to_string()))?;
            if farm.status.next(StatusEvent::Tick).is_none() {
                tracing::debug!("Tick for farm {} skipped in status {}", farm_id, farm.status);
                return Ok(TickOutcome::Skipped);
            }
            if farm.condition.is_fulfilled() && !farm.condition.due_for_repeat(started_at) {
                tracing::info!("Farm {} already fulfilled its condition, not checking", farm_id);
                if farm.apply(StatusEvent::ConditionFulfilled)?.changed() {
                    self.inner.events.status_changed(farm);
                }
                None
            } else {
                farm.apply(StatusEvent::Tick)?;
                self.inner.events.status_changed(farm);
                Some(farm.clone())
            }
        };
        let Some(snapshot) = snapshot else {
            self.stop(farm_id);
            return Ok(TickOutcome::Completed(FarmStatus::ConditionFulfilled));
        };

        let timeout = self.inner.check_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.checker.run_check_cycle(&snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(CheckError::Timeout(timeout.as_secs())),
        };

        let status = match result {
            Ok(outcome) => self.finish_cycle(farm_id, outcome, started_at).await?,
            Err(e) => self.fail_cycle(farm_id, e, started_at).await?,
        };

        Ok(match status {
            Some(status) => TickOutcome::Completed(status),
            None => TickOutcome::Skipped,
        })
    }

    /// Apply a successful check. Status only moves if no request changed it mid-check.
    async fn finish_cycle(
        &self,
        farm_id: &str,
        outcome: CheckOutcome,
        started_at: DateTime<Utc>,
    ) -> Result<Option<FarmStatus>> {
        let events = &self.inner.events;
        let farm = {
            let mut farms = self.inner.farms.lock().await;
            let Some(farm) = farms.get_mut(farm_id) else {
                tracing::info!("Farm {} was removed during its check, dropping result", farm_id);
                return Ok(None);
            };
            let still_checking = farm.status == FarmStatus::Checking;
            farm.windows = outcome.windows;
            let mut moved = false;

            if outcome.content_found {
                if still_checking {
                    farm.apply(StatusEvent::CheckSucceeded { content_found: true })?;
                    events.status_changed(farm);
                }
                farm.uptime_ms = farm.uptime_ms.saturating_add(outcome.elapsed_ms);
                let verdict = farm.condition.update(outcome.elapsed_ms, Utc::now());
                if verdict == Verdict::Fulfilled {
                    tracing::info!("Farm {} fulfilled its condition", farm_id);
                    events.condition_fulfilled(farm_id);
                }

                if still_checking {
                    let transition = match verdict {
                        Verdict::Fulfilled | Verdict::AlreadyFulfilled => {
                            farm.apply(StatusEvent::ConditionFulfilled)?
                        }
                        Verdict::KeepFarming | Verdict::PeriodReset { restarted: true } => {
                            farm.apply(StatusEvent::CycleEnded)?
                        }
                        Verdict::PeriodReset { restarted: false } => {
                            tracing::warn!("Farm {} period ended before its condition was met", farm_id);
                            events.attention_required(farm_id, "farming period ended before the condition was met");
                            farm.apply(StatusEvent::PeriodExpired)?
                        }
                    };
                    moved = transition.changed();
                }
            } else if still_checking {
                moved = farm.apply(StatusEvent::CheckSucceeded { content_found: false })?.changed();
            }

            if moved {
                events.status_changed(farm);
            }
            farm.clone()
        };

        self.persist(&farm);
        let (result, credited) = if outcome.content_found {
            (CheckResult::Farming, outcome.elapsed_ms)
        } else {
            (CheckResult::Idle, 0)
        };
        self.record(farm_id, started_at, result, credited, None);

        if !farm.status.keeps_ticking() {
            self.stop(farm_id);
        }
        Ok(Some(farm.status))
    }

    async fn fail_cycle(
        &self,
        farm_id: &str,
        error: CheckError,
        started_at: DateTime<Utc>,
    ) -> Result<Option<FarmStatus>> {
        let reason = error.to_string();
        tracing::warn!("Check cycle for farm {} failed: {}", farm_id, reason);

        let status = {
            let mut farms = self.inner.farms.lock().await;
            let Some(farm) = farms.get_mut(farm_id) else {
                return Ok(None);
            };
            farm.windows = 0;
            if farm.status == FarmStatus::Checking {
                farm.apply(StatusEvent::CheckFailed)?;
                self.inner.events.attention_required(farm_id, reason.clone());
                self.inner.events.status_changed(farm);
            }
            farm.status
        };

        self.record(farm_id, started_at, CheckResult::Failed, 0, Some(reason));
        if !status.keeps_ticking() {
            self.stop(farm_id);
        }
        Ok(Some(status))
    }

    /// Write condition and uptime. Failures are logged; memory stays authoritative.
    fn persist(&self, farm: &Farm) {
        if let Err(e) = self.inner.store.save_condition_state(&farm.id, &farm.condition) {
            tracing::error!("Failed to save condition for farm {}: {}", farm.id, e);
        }
        let patch = FarmConfigPatch {
            uptime_ms: Some(farm.uptime_ms),
            ..Default::default()
        };
        if let Err(e) = self.inner.store.save_farm_config(&farm.id, &patch) {
            tracing::error!("Failed to save config for farm {}: {}", farm.id, e);
        }
    }

    fn record(
        &self,
        farm_id: &str,
        started_at: DateTime<Utc>,
        result: CheckResult,
        elapsed_ms: u64,
        error_message: Option<String>,
    ) {
        let record = CheckRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            farm_id: farm_id.to_string(),
            started_at_utc: started_at,
            finished_at_utc: Utc::now(),
            result,
            elapsed_ms,
            error_message,
        };
        if let Err(e) = self.inner.store.record_check(&record) {
            tracing::error!("Failed to record check for farm {}: {}", farm_id, e);
        }
    }
}
