//! Headless runner: connects to a sensor, runs one exercise attempt and
//! prints the result.
//!
//! ```text
//! physio_tracker [exercise-id] [max-seconds]
//! ```
//!
//! Uses the simulated sensor unless built with `--features btleplug-backend`.

use anyhow::{anyhow, Context};
use physio_tracker::domain::exercise::{ExerciseCatalog, InMemoryCatalog};
use physio_tracker::domain::models::{ConnectionState, MessageSeverity};
use physio_tracker::domain::progress::{default_achievements, UserProgress};
use physio_tracker::domain::settings::SettingsService;
use physio_tracker::engine::{EngineConfig, SessionEngine};
use physio_tracker::infrastructure::bluetooth::platform::BlePlatform;
use physio_tracker::infrastructure::bluetooth::{DeviceLink, LinkConfig};
use physio_tracker::infrastructure::logging::init_logger;
use physio_tracker::infrastructure::storage::JsonFileResultStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let exercise_id = args.next().unwrap_or_else(|| "1".to_string());
    let max_seconds: u64 = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid max-seconds {raw:?}"))?,
        None => 15,
    };

    let mut settings_service = SettingsService::new()?;
    let data_dir = settings_service.data_dir();

    let _logging_guard = init_logger(&settings_service.get().log_settings, &data_dir)
        .map_err(|e| eprintln!("Failed to initialize logging: {e}"))
        .ok();

    info!("Starting Physio Tracker");

    let catalog = Arc::new(InMemoryCatalog::seeded());
    let exercise = catalog.get_exercise_by_id(&exercise_id).ok_or_else(|| {
        let mut known: Vec<_> = catalog.all().map(|e| format!("{} ({})", e.id, e.name)).collect();
        known.sort();
        anyhow!("unknown exercise {exercise_id}; available: {}", known.join(", "))
    })?;

    let link = DeviceLink::new(
        open_platform().await?,
        LinkConfig::from_settings(settings_service.get())?,
    );
    spawn_status_logger(&link);
    spawn_state_printer(&link);

    let address = find_device(&link, settings_service.get().last_connected_address.as_deref()).await?;
    link.connect(&address)?;
    wait_until_ready(&link).await?;
    if let Err(e) = settings_service.remember_device(&address) {
        warn!("Could not save last device: {}", e);
    }
    link.select_body_part(exercise.body_part);

    let store = Arc::new(JsonFileResultStore::new(&data_dir)?);
    let engine = SessionEngine::spawn(
        catalog.clone(),
        Arc::new(link.clone()),
        store.clone(),
        EngineConfig::from_settings(settings_service.get()),
    );
    spawn_feedback_logger(&engine);

    engine.load_exercise(&exercise.id).await?;
    engine.start().await?;
    println!(
        "Running \"{}\" (target {:?} deg, {}s, stopping after at most {}s)",
        exercise.name, exercise.target_angle, exercise.duration, max_seconds
    );

    let mut completed = engine.watch_completed();
    let result = tokio::select! {
        done = completed.wait_for(|r| r.is_some()) => {
            done?.clone().ok_or_else(|| anyhow!("attempt finished without a result"))?
        }
        _ = tokio::time::sleep(Duration::from_secs(max_seconds)) => engine.end().await?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, ending attempt");
            engine.end().await?
        }
    };

    link.shutdown();

    println!("Score:     {}", result.score);
    println!("Accuracy:  {:.1}%", result.accuracy);
    println!("Duration:  {}s", result.duration);
    println!("Movements: {}/{} correct", result.correct_movements, result.total_movements);

    println!("Results:   {}", store.root().display());
    print_progress(&store);
    Ok(())
}

#[cfg(feature = "btleplug-backend")]
async fn open_platform() -> anyhow::Result<Arc<dyn BlePlatform>> {
    let platform = physio_tracker::infrastructure::bluetooth::btleplug_backend::BtleplugPlatform::new().await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "btleplug-backend"))]
async fn open_platform() -> anyhow::Result<Arc<dyn BlePlatform>> {
    use physio_tracker::infrastructure::bluetooth::simulated::SimulatedPlatform;
    info!("Using simulated sensor");
    Ok(Arc::new(SimulatedPlatform::default()))
}

/// Scan until a matching device shows up, preferring the last one used.
async fn find_device(link: &DeviceLink, preferred: Option<&str>) -> anyhow::Result<String> {
    link.start_scan()?;
    let mut devices = link.watch_discovered_devices();

    let found = tokio::time::timeout(Duration::from_secs(10), async {
        devices
            .wait_for(|list| match preferred {
                Some(address) => list.iter().any(|d| d.address == address),
                None => !list.is_empty(),
            })
            .await
            .map(|list| list.clone())
    })
    .await;

    let list = match found {
        Ok(Ok(list)) => list,
        // Preferred device absent; settle for whatever was seen
        Err(_) => link.discovered_devices(),
        Ok(Err(_)) => return Err(anyhow!("device link stopped while scanning")),
    };
    link.stop_scan();

    let device = preferred
        .and_then(|address| list.iter().find(|d| d.address == address))
        .or_else(|| list.iter().max_by_key(|d| d.signal_strength))
        .ok_or_else(|| anyhow!("no sensor found"))?;
    info!("Selected {} ({}, {} dBm)", device.name, device.address, device.signal_strength);
    Ok(device.address.clone())
}

async fn wait_until_ready(link: &DeviceLink) -> anyhow::Result<()> {
    let mut state = link.watch_connection_state();
    tokio::time::timeout(
        Duration::from_secs(15),
        state.wait_for(|s| *s == ConnectionState::Ready),
    )
    .await
    .context("sensor did not become ready")??;
    Ok(())
}

fn spawn_status_logger(link: &DeviceLink) {
    let mut status = link.subscribe_status();
    tokio::spawn(async move {
        while let Ok(message) = status.recv().await {
            match message.severity {
                MessageSeverity::Error => error!("{}", message.message),
                MessageSeverity::Warning => warn!("{}", message.message),
                _ => debug!("{}", message.message),
            }
        }
    });
}

fn spawn_state_printer(link: &DeviceLink) {
    let mut state = link.watch_connection_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            println!("Sensor: {}", current.label());
        }
    });
}

fn spawn_feedback_logger(engine: &SessionEngine) {
    let mut feedback = engine.watch_feedback();
    tokio::spawn(async move {
        while feedback.changed().await.is_ok() {
            if let Some(fb) = feedback.borrow_and_update().as_ref() {
                info!("[{:?}] {} ({:.0}%)", fb.kind, fb.message, fb.accuracy);
            }
        }
    });
}

fn print_progress(store: &JsonFileResultStore) {
    let (results, sessions) = match (store.load_results(), store.load_sessions()) {
        (Ok(results), Ok(sessions)) => (results, sessions),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Could not read stored history: {}", e);
            return;
        }
    };

    let mut progress = UserProgress::default();
    let mut ordered: Vec<_> = results
        .iter()
        .filter_map(|r| sessions.iter().find(|s| s.id == r.session_id).map(|s| (r, s)))
        .collect();
    ordered.sort_by_key(|(_, s)| s.end_time.unwrap_or(s.start_time));
    for (result, session) in ordered {
        progress.record(result, session);
    }

    let mut achievements = default_achievements();
    progress.evaluate(&mut achievements, chrono::Utc::now());

    println!(
        "Level {} ({} points, {} to next level), {} sessions",
        progress.level(),
        progress.total_points,
        progress.points_to_next_level(),
        progress.total_sessions
    );
    for achievement in achievements.iter().filter(|a| a.is_unlocked()) {
        println!("  * {}: {}", achievement.title, achievement.description);
    }
}
