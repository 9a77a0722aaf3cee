//! Drop Farmer - Main entry point

use drop_farmer_lib::check::ShellOpener;
use drop_farmer_lib::conditions::Condition;
use drop_farmer_lib::notify::{self, TracingNotifier};
use drop_farmer_lib::storage::{Database, FarmStore};
use drop_farmer_lib::{FarmManager, FarmType, NewFarm};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BUILT_IN_FARMS: [(&str, &str); 3] = [
    ("league-of-legends", "https://lolesports.com/"),
    ("valorant", "https://valorantesports.com/"),
    ("overwatch-league", "https://overwatchleague.com/"),
];

fn data_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(dir) = std::env::var_os("DROP_FARMER_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_dir().ok_or("no data directory for this platform")?;
    Ok(base.join("drop-farmer"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting Drop Farmer...");

    // Initialize storage
    let data_dir = data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {:?}", data_dir);

    let db = Arc::new(Database::open(&data_dir.join("drop-farmer.db"))?);
    let settings = db.get_settings().unwrap_or_else(|e| {
        tracing::error!("Failed to load settings, using defaults: {}", e);
        Default::default()
    });

    let manager = Arc::new(FarmManager::new(db, Arc::new(ShellOpener::new()), &settings));
    let notifications = settings
        .show_notifications
        .then(|| notify::spawn_dispatcher(manager.subscribe(), Arc::new(TracingNotifier)));

    let report = manager.load().await?;
    for (farm_id, reason) in &report.disabled {
        tracing::warn!("Farm {} needs attention: {}", farm_id, reason);
    }

    for (id, url) in BUILT_IN_FARMS {
        let seeded = manager
            .seed(NewFarm {
                id: id.to_string(),
                farm_type: FarmType::Website,
                url: url.to_string(),
                schedule: 1,
                enabled: true,
                condition: Condition::unlimited(),
            })
            .await?;
        if seeded {
            tracing::info!("Seeded built-in farm {}", id);
        }
    }

    let started = manager.start_all().await?;
    tracing::info!("Started {} farm schedules", started);

    // Period sweep
    let sweeper = {
        let manager = manager.clone();
        let every = Duration::from_secs(settings.period_sweep_minutes.max(1) * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match manager.refresh_periods().await {
                    Ok(reset) if !reset.is_empty() => {
                        tracing::info!("Period sweep reset {} farms", reset.len())
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Period sweep failed: {}", e),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    sweeper.abort();
    manager.shutdown();
    if let Some(handle) = notifications {
        handle.abort();
    }
    Ok(())
}
