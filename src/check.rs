//! Check module - The check-cycle provider that does a farm's actual work

use crate::clock;
use crate::models::Farm;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Could not open {0}")]
    OpenFailed(String),

    #[error("Check cycle timed out after {0} seconds")]
    Timeout(u64),

    #[error("Cache clear failed: {0}")]
    CacheClear(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// What one check cycle found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub content_found: bool,
    /// Time to credit to the farm's condition
    pub elapsed_ms: u64,
    /// Farm windows left open after the cycle
    pub windows: u32,
}

/// Runs check cycles for farms. Implemented by whatever drives the browser.
#[async_trait]
pub trait CheckCycle: Send + Sync {
    async fn run_check_cycle(&self, farm: &Farm) -> Result<CheckOutcome, CheckError>;

    /// Drop cached session data for a farm before its schedule is rebuilt
    async fn clear_cache(&self, _farm: &Farm) -> Result<(), CheckError> {
        Ok(())
    }
}

/// Opens each farm's page with the platform opener and credits one
/// schedule interval per cycle while the page is considered open.
#[derive(Default)]
pub struct ShellOpener {
    opened: Mutex<HashSet<String>>,
}

impl ShellOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_open(&self, farm_id: &str) -> bool {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(farm_id)
    }

    fn mark_open(&self, farm_id: &str) {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(farm_id.to_string());
    }
}

#[async_trait]
impl CheckCycle for ShellOpener {
    async fn run_check_cycle(&self, farm: &Farm) -> Result<CheckOutcome, CheckError> {
        let just_opened = !self.is_open(&farm.id);
        if just_opened {
            tracing::info!("Opening farm {} at {}", farm.id, farm.url);
            open_url(&farm.url).await?;
            self.mark_open(&farm.id);
        }

        Ok(open_page_outcome(farm, just_opened))
    }

    async fn clear_cache(&self, farm: &Farm) -> Result<(), CheckError> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&farm.id);
        tracing::info!("Forgot opened page for farm {}", farm.id);
        Ok(())
    }
}

/// A page opened during this cycle has not been watched yet
fn open_page_outcome(farm: &Farm, just_opened: bool) -> CheckOutcome {
    CheckOutcome {
        content_found: true,
        elapsed_ms: if just_opened {
            0
        } else {
            clock::minutes_to_ms(farm.schedule)
        },
        windows: 1,
    }
}

/// Open a URL using the platform shell
async fn open_url(url: &str) -> Result<(), CheckError> {
    let status = opener_command(url).status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(CheckError::OpenFailed(url.to_string()))
    }
}

fn opener_command(url: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        cmd
    }

    #[cfg(target_os = "macos")]
    {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    }

    #[cfg(not(any(windows, target_os = "macos")))]
    {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Condition;
    use crate::models::{FarmConfig, FarmType};

    fn farm() -> Farm {
        Farm::from_config(
            FarmConfig {
                id: "league-of-legends".to_string(),
                farm_type: FarmType::Website,
                url: "https://lolesports.com/".to_string(),
                schedule: 3,
                enabled: true,
                is_protected: true,
                uptime_ms: 0,
            },
            Condition::unlimited(),
        )
    }

    #[tokio::test]
    async fn test_open_page_credits_schedule() {
        let opener = ShellOpener::new();
        let farm = farm();
        opener.mark_open(&farm.id);

        let outcome = opener.run_check_cycle(&farm).await.unwrap();

        assert!(outcome.content_found);
        assert_eq!(outcome.elapsed_ms, 180_000);
        assert_eq!(outcome.windows, 1);
    }

    #[test]
    fn test_opening_cycle_credits_nothing() {
        let farm = farm();

        let opening = open_page_outcome(&farm, true);
        assert!(opening.content_found);
        assert_eq!(opening.elapsed_ms, 0);
        assert_eq!(opening.windows, 1);

        assert_eq!(open_page_outcome(&farm, false).elapsed_ms, 180_000);
    }

    #[tokio::test]
    async fn test_clear_cache_forgets_page() {
        let opener = ShellOpener::new();
        let farm = farm();
        opener.mark_open(&farm.id);

        opener.clear_cache(&farm).await.unwrap();

        assert!(!opener.is_open(&farm.id));
    }
}
