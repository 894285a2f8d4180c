use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::info;
use tracing_subscriber::EnvFilter;

use inkstone_tracker::config::{
    ensure_app_dir, load_or_create_config, normalize_config, TrackerConfig, CONFIG_FILE,
    LOCK_FILE, STOP_FILE,
};
use inkstone_tracker::monitor::{ActivityMonitor, MonitorConfig};
use inkstone_tracker::platform::{self, PollingFocusSource};
use inkstone_tracker::store::HistoryStore;

#[derive(Default)]
struct CliOverrides {
    config_path: Option<PathBuf>,
    flush_delay_ms: Option<u64>,
    focus_poll_hz: Option<u64>,
    own_bundle_id: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("start") => {
            let overrides = parse_start_args(args);
            run_tracker(overrides)?;
        }
        Some("stop") => {
            stop_tracker()?;
        }
        Some("status") => {
            print_status()?;
        }
        Some("history") => {
            let include_switches = !args.any(|arg| arg == "--no-switches");
            print_history(include_switches)?;
        }
        Some("clear") => {
            clear_history()?;
        }
        _ => {
            print_usage();
        }
    }
    Ok(())
}

fn print_usage() {
    println!("inkstone_tracker");
    println!("Usage:");
    println!("  inkstone_tracker start [--config PATH] [--flush-ms N] [--poll-hz N] [--own-bundle-id ID]");
    println!("  inkstone_tracker stop");
    println!("  inkstone_tracker status");
    println!("  inkstone_tracker history [--no-switches]");
    println!("  inkstone_tracker clear");
}

fn parse_start_args(mut args: impl Iterator<Item = String>) -> CliOverrides {
    let mut overrides = CliOverrides::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(value) = args.next() {
                    overrides.config_path = Some(PathBuf::from(value));
                }
            }
            "--flush-ms" => {
                if let Some(value) = args.next() {
                    if let Ok(parsed) = value.parse::<u64>() {
                        overrides.flush_delay_ms = Some(parsed);
                    }
                }
            }
            "--poll-hz" => {
                if let Some(value) = args.next() {
                    if let Ok(parsed) = value.parse::<u64>() {
                        overrides.focus_poll_hz = Some(parsed.max(1));
                    }
                }
            }
            "--own-bundle-id" => {
                if let Some(value) = args.next() {
                    overrides.own_bundle_id = Some(value);
                }
            }
            _ => {}
        }
    }
    overrides
}

fn load_config(base_dir: &Path, overrides: &CliOverrides) -> Result<TrackerConfig> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE));
    let mut config = load_or_create_config(&config_path)?;
    if let Some(flush_delay_ms) = overrides.flush_delay_ms {
        config.flush_delay_ms = flush_delay_ms;
    }
    if let Some(focus_poll_hz) = overrides.focus_poll_hz {
        config.focus_poll_hz = focus_poll_hz;
    }
    if let Some(own_bundle_id) = overrides.own_bundle_id.clone() {
        config.own_bundle_id = Some(own_bundle_id);
    }
    Ok(normalize_config(config))
}

fn run_tracker(overrides: CliOverrides) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = load_config(&base_dir, &overrides)?;

    let lock_path = base_dir.join(LOCK_FILE);
    if lock_path.exists() {
        println!("Tracker already running (lock file present).");
        return Ok(());
    }
    write_lock(&lock_path)?;

    let store = HistoryStore::open(config.history_path(&base_dir), config.flush_delay())?;
    let flushes = store.subscribe_flushes();
    let introspection = platform::introspection_client(config.introspect_timeout());
    let monitor = ActivityMonitor::new(
        store.clone(),
        introspection,
        MonitorConfig {
            own_bundle_id: config.own_bundle_id.clone(),
            accept_ratio: config.introspect_accept_ratio,
        },
    );
    let source = PollingFocusSource::new(config.focus_poll_hz);
    monitor.start(&source);
    info!("tracker started");

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || shutdown.store(true, Ordering::SeqCst)
    })
    .context("failed to set Ctrl+C handler")?;

    let stop_path = base_dir.join(STOP_FILE);
    let interval = Duration::from_millis(200);
    while !shutdown.load(Ordering::SeqCst) {
        if stop_path.exists() {
            let _ = fs::remove_file(&stop_path);
            break;
        }
        thread::sleep(interval);
    }

    // Drain in-flight events, then wait for the store worker's final flush:
    // its flush-subscriber channel disconnects once the worker exits.
    monitor.sync();
    drop(monitor);
    drop(store);
    while flushes.recv().is_ok() {}
    let _ = fs::remove_file(lock_path);
    info!("tracker stopped");
    Ok(())
}

fn stop_tracker() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        println!("No active tracker session found.");
        return Ok(());
    }
    fs::write(base_dir.join(STOP_FILE), b"stop")?;
    println!("Stop signal written.");
    Ok(())
}

fn print_status() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        println!("Tracker status: stopped");
        return Ok(());
    }
    println!("Tracker status: running");
    let contents = fs::read_to_string(lock_path).unwrap_or_default();
    if !contents.trim().is_empty() {
        println!("{contents}");
    }
    Ok(())
}

fn print_history(include_switches: bool) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = load_config(&base_dir, &CliOverrides::default())?;
    let store = HistoryStore::open(config.history_path(&base_dir), config.flush_delay())?;
    let mut records = store.load_all();
    records.sort_by_key(|r| r.timestamp);
    for record in records {
        if !include_switches && record.is_app_switch() {
            continue;
        }
        let local: DateTime<Local> = record.timestamp.into();
        println!("{} [{}] {}", local.to_rfc3339(), record.app_name, record.text);
    }
    Ok(())
}

fn clear_history() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = load_config(&base_dir, &CliOverrides::default())?;
    let store = HistoryStore::open(config.history_path(&base_dir), config.flush_delay())?;
    store.clear_all();
    println!("History cleared.");
    Ok(())
}

fn write_lock(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let started = DateTime::<Local>::from(std::time::SystemTime::now()).to_rfc3339();
    let contents = format!("pid={pid}\nstarted={started}\n");
    fs::write(path, contents).context("failed to write lock file")?;
    Ok(())
}
