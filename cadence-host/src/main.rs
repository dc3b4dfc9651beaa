//! Cadence host entry point.
//!
//! Builds a `Runtime` from the settings file, runs the simulated pipeline for
//! `runMs`, tears it down channel by channel and then completely, and prints
//! one JSON document with every report. Exits non-zero when the final cleanup
//! leaves resources, workers or components behind.

mod pipeline;
mod settings;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::cleanup::CleanupReport;
use cadence_core::component::{HealthReport, InitReport};
use cadence_core::state::ConsistencyReport;
use cadence_core::{Activity, MetricsSnapshot, Runtime, State, StateEvent};
use serde::Serialize;
use settings::{apply_env_overrides, default_settings_path, load_settings, save_settings};
use tracing::{error, info, warn};

#[derive(Debug)]
struct Args {
    settings: Option<PathBuf>,
    write_settings: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunOutput {
    settings_path: PathBuf,
    started_at: chrono::DateTime<chrono::Utc>,
    state_events: u64,
    rejected_transitions: u64,
    init: InitReport,
    health: HealthReport,
    consistency: ConsistencyReport,
    stages: Vec<pipeline::StageSummary>,
    channel_cleanup: Vec<CleanupReport>,
    cleanup: CleanupReport,
    metrics: MetricsSnapshot,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        settings: None,
        write_settings: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let path = it.next().context("missing value for --settings")?;
                args.settings = Some(PathBuf::from(path));
            }
            "--write-settings" => args.write_settings = true,
            "--help" | "-h" => {
                println!(
                    "Usage: cadence [--settings <file.json>] [--write-settings]\n\
                     Environment: CADENCE_CHANNELS, CADENCE_RUN_MS, CADENCE_FRAME_INTERVAL_MS,\n\
                     CADENCE_MONITOR_INTERVAL_MS, CADENCE_FAIL_FAST, RUST_LOG"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            error!("cadence host failed: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns whether the final cleanup verified cleanly.
fn run() -> anyhow::Result<bool> {
    let args = parse_args()?;
    let settings_path = args.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    apply_env_overrides(&mut settings);
    if args.write_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        info!(settings_path = ?settings_path, "settings written");
    }
    info!(
        settings_path = ?settings_path,
        channels = settings.channels,
        run_ms = settings.run_ms,
        "Cadence starting"
    );

    let started_at = chrono::Utc::now();
    let rt = Arc::new(Runtime::new(settings.runtime.clone())?);

    let events = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));
    {
        let (events, rejected) = (Arc::clone(&events), Arc::clone(&rejected));
        rt.register_state_callback(move |event: &StateEvent| {
            events.fetch_add(1, Ordering::Relaxed);
            if !event.success {
                rejected.fetch_add(1, Ordering::Relaxed);
            }
        })?;
    }

    let pipeline = pipeline::build(&rt, &settings)?;
    rt.install_shutdown_sequence()?;
    rt.start_background(rt.config().monitor.interval())?;

    // ── Run ───────────────────────────────────────────────────────────────
    let init = rt.initialize_all()?;
    if !init.is_complete() {
        warn!(failed = ?init.failed, blocked = ?init.blocked, "pipeline came up partially");
    }

    let run_for = Duration::from_millis(settings.run_ms);
    let paused = settings
        .pause_last_channel
        .then(|| pipeline.captures.last().cloned())
        .flatten();
    match &paused {
        Some(capture) => {
            std::thread::sleep(run_for / 2);
            pause(&rt, capture, Activity::Paused);
            std::thread::sleep(run_for / 4);
            pause(&rt, capture, Activity::Active);
            std::thread::sleep(run_for / 4);
        }
        None => std::thread::sleep(run_for),
    }

    let health = rt.poll_health()?;
    let consistency = rt.verify_consistency()?;
    if !consistency.is_consistent() {
        warn!(violations = consistency.violations.len(), "state inconsistent at end of run");
    }

    // ── Teardown ──────────────────────────────────────────────────────────
    let mut channel_cleanup = Vec::new();
    for ch in 0..settings.channels {
        channel_cleanup.push(rt.execute_cleanup_channel(ch)?);
    }
    // Let in-flight frames reach storage before stages go away.
    std::thread::sleep(Duration::from_millis(settings.frame_interval_ms * 8));

    let cleanup = rt.execute_cleanup()?;
    if let Some(err) = cleanup.first_error() {
        warn!(failed = cleanup.failed.len(), "{err}");
    }
    let verified = cleanup.checks_passed();
    if verified {
        info!(elapsed_ms = cleanup.elapsed_ms, "cleanup verified");
    } else {
        error!(checks = ?cleanup.checks, "cleanup verification failed");
    }

    let output = RunOutput {
        settings_path,
        started_at,
        state_events: events.load(Ordering::Relaxed),
        rejected_transitions: rejected.load(Ordering::Relaxed),
        init,
        health,
        consistency,
        stages: pipeline.summaries(),
        channel_cleanup,
        cleanup,
        metrics: MetricsSnapshot::clone(&rt.get_metrics()),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(verified)
}

fn pause(rt: &Runtime, capture: &str, activity: Activity) {
    match rt.transition_state(capture, State::Running(activity)) {
        Ok(()) => info!(component = capture, ?activity, "capture activity changed"),
        Err(e) => warn!(component = capture, "could not change capture activity: {e}"),
    }
}
