//! Conditions module - Track farming progress against a farm's fulfillment rule

use crate::clock::{self, Period};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fulfillment condition of a farm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    /// Farm forever; `amount` only feeds the uptime display
    Unlimited {
        #[serde(default)]
        amount: u64,
    },
    Weekly(PeriodicCondition),
    Monthly(PeriodicCondition),
    TimeWindow(TimeWindowCondition),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicCondition {
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub fulfilled: Option<DateTime<Utc>>,
    /// Accumulated milliseconds
    #[serde(default)]
    pub amount: u64,
    /// Target in hours
    pub amount_wanted: u32,
    /// Grace minutes, not enforced here
    #[serde(default)]
    pub buffer: u32,
    #[serde(default)]
    pub repeat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindowCondition {
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub fulfilled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub amount: u64,
    pub amount_wanted: u32,
    #[serde(default)]
    pub buffer: u32,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Outcome of crediting one check cycle to a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    KeepFarming,
    /// The target was reached by this update
    Fulfilled,
    /// The target had been reached by an earlier update
    AlreadyFulfilled,
    /// The period ended. `restarted` is false when a non-repeating
    /// condition expired unfulfilled and was left untouched.
    PeriodReset { restarted: bool },
}

impl PeriodicCondition {
    pub fn new(amount_wanted: u32, buffer: u32, repeat: bool, now: DateTime<Utc>) -> Self {
        Self {
            started: now,
            fulfilled: None,
            amount: 0,
            amount_wanted,
            buffer,
            repeat,
        }
    }

    pub fn period_elapsed(&self, period: Period, now: DateTime<Utc>) -> bool {
        clock::remaining_days_in_period(period, clock::local_date(self.started), clock::local_date(now)) <= 0
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.started = now;
        self.amount = 0;
        self.fulfilled = None;
    }

    fn update(&mut self, period: Period, elapsed_ms: u64, now: DateTime<Utc>) -> Verdict {
        if self.period_elapsed(period, now) {
            if self.repeat {
                self.reset(now);
                return Verdict::PeriodReset { restarted: true };
            }
            if self.fulfilled.is_none() {
                return Verdict::PeriodReset { restarted: false };
            }
        }
        accumulate(&mut self.amount, &mut self.fulfilled, self.amount_wanted, elapsed_ms, now)
    }
}

impl TimeWindowCondition {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from <= now && now <= self.to
    }

    fn update(&mut self, elapsed_ms: u64, now: DateTime<Utc>) -> Verdict {
        if !self.contains(now) {
            return Verdict::KeepFarming;
        }
        accumulate(&mut self.amount, &mut self.fulfilled, self.amount_wanted, elapsed_ms, now)
    }
}

/// Add elapsed time and detect fulfillment; the amount is clamped to the target once reached
fn accumulate(
    amount: &mut u64,
    fulfilled: &mut Option<DateTime<Utc>>,
    amount_wanted: u32,
    elapsed_ms: u64,
    now: DateTime<Utc>,
) -> Verdict {
    if fulfilled.is_some() {
        return Verdict::AlreadyFulfilled;
    }

    let wanted_ms = clock::hours_to_ms(amount_wanted);
    *amount = amount.saturating_add(elapsed_ms);
    if *amount >= wanted_ms {
        *amount = wanted_ms;
        *fulfilled = Some(now);
        Verdict::Fulfilled
    } else {
        Verdict::KeepFarming
    }
}

impl Condition {
    pub fn unlimited() -> Self {
        Condition::Unlimited { amount: 0 }
    }

    /// Type tag as stored in the settings store
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Unlimited { .. } => "unlimited",
            Condition::Weekly(_) => "weekly",
            Condition::Monthly(_) => "monthly",
            Condition::TimeWindow(_) => "timeWindow",
        }
    }

    /// Check values a user could have entered wrong
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Condition::Unlimited { .. } => Ok(()),
            Condition::Weekly(c) | Condition::Monthly(c) => {
                if c.amount_wanted == 0 {
                    return Err("amountWanted must be at least 1 hour".to_string());
                }
                Ok(())
            }
            Condition::TimeWindow(c) => {
                if c.amount_wanted == 0 {
                    return Err("amountWanted must be at least 1 hour".to_string());
                }
                if c.from > c.to {
                    return Err(format!("time window starts ({}) after it ends ({})", c.from, c.to));
                }
                Ok(())
            }
        }
    }

    /// Credit one check cycle's elapsed time and report what the farm should do next
    pub fn update(&mut self, elapsed_ms: u64, now: DateTime<Utc>) -> Verdict {
        match self {
            Condition::Unlimited { amount } => {
                *amount = amount.saturating_add(elapsed_ms);
                Verdict::KeepFarming
            }
            Condition::Weekly(c) => c.update(Period::Week, elapsed_ms, now),
            Condition::Monthly(c) => c.update(Period::Month, elapsed_ms, now),
            Condition::TimeWindow(c) => c.update(elapsed_ms, now),
        }
    }

    /// Back to a fresh state of the same variant
    pub fn reset(&mut self, now: DateTime<Utc>) {
        match self {
            Condition::Unlimited { amount } => *amount = 0,
            Condition::Weekly(c) | Condition::Monthly(c) => c.reset(now),
            Condition::TimeWindow(c) => {
                c.started = now;
                c.amount = 0;
                c.fulfilled = None;
            }
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Condition::Unlimited { amount } => *amount,
            Condition::Weekly(c) | Condition::Monthly(c) => c.amount,
            Condition::TimeWindow(c) => c.amount,
        }
    }

    pub fn fulfilled(&self) -> Option<DateTime<Utc>> {
        match self {
            Condition::Unlimited { .. } => None,
            Condition::Weekly(c) | Condition::Monthly(c) => c.fulfilled,
            Condition::TimeWindow(c) => c.fulfilled,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled().is_some()
    }

    /// Fraction of the target reached, `None` for unlimited farms
    pub fn progress(&self) -> Option<f64> {
        let (amount, wanted) = match self {
            Condition::Unlimited { .. } => return None,
            Condition::Weekly(c) | Condition::Monthly(c) => (c.amount, c.amount_wanted),
            Condition::TimeWindow(c) => (c.amount, c.amount_wanted),
        };
        let wanted_ms = clock::hours_to_ms(wanted);
        if wanted_ms == 0 {
            return Some(1.0);
        }
        Some((amount as f64 / wanted_ms as f64).min(1.0))
    }

    /// True for a repeating periodic condition whose period has ended
    pub fn due_for_repeat(&self, now: DateTime<Utc>) -> bool {
        match self {
            Condition::Weekly(c) => c.repeat && c.period_elapsed(Period::Week, now),
            Condition::Monthly(c) => c.repeat && c.period_elapsed(Period::Month, now),
            Condition::Unlimited { .. } | Condition::TimeWindow(_) => false,
        }
    }
}
