//! Headless simulation driver
//!
//! Usage: `fluidsim <scene.json> [--profile-json <path>]`
//!
//! Runs the scene until its step limit (or until interrupted), then logs the
//! run summary and optionally writes the system's profiling data as JSON.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use fluidsim_orchestrator::{create_simulation, RunnerState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the main thread reports progress.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

struct Args {
    scene: String,
    profile_json: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut scene = None;
    let mut profile_json = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--profile-json" => {
                let path = args.next().context("--profile-json needs a path")?;
                profile_json = Some(PathBuf::from(path));
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            other => {
                if scene.replace(other.to_string()).is_some() {
                    bail!("only one scene file may be given");
                }
            }
        }
    }
    let scene = scene.context("usage: fluidsim <scene.json> [--profile-json <path>]")?;
    Ok(Args { scene, profile_json })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluidsim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    tracing::info!("Starting SPH simulation");

    let mut runner = create_simulation(&args.scene).with_context(|| format!("setting up {}", args.scene))?;
    runner.start();

    loop {
        thread::sleep(REPORT_INTERVAL);
        let state = runner.state();
        let profile = runner.profiling_data();
        tracing::info!(
            frames = runner.frame_count(),
            steps = runner.step_count(),
            skipped = runner.skipped_count(),
            step_us = profile.last_step.total_us,
            "progress"
        );
        if state != RunnerState::Running && state != RunnerState::Paused {
            break;
        }
    }

    runner.join().map_err(anyhow::Error::msg)?;
    let final_state = runner.state();
    let profile = runner.profiling_data();

    if let Some(path) = &args.profile_json {
        let json = serde_json::to_string_pretty(&profile)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("Profiling data written to {}", path.display());
    }

    if final_state == RunnerState::Error {
        bail!("simulation failed: {}", runner.error_message().unwrap_or_default());
    }
    tracing::info!(
        completed = profile.completed_steps,
        skipped = profile.skipped_updates,
        degenerate_pairs = profile.degenerate_pairs,
        "Simulation complete"
    );
    Ok(())
}
