//! Imagewatch daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};

mod cleanup;
mod config;
mod error;
mod notify;
mod reconciler;
mod resolver;
mod runtime;
mod snapshot;
mod types;

use config::Config;
use notify::Notifier;
use reconciler::Reconciler;
use runtime::DockerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Arc::new(Config::load()?);
    info!("Starting imagewatch daemon with config: {:?}", cfg);

    // Container Runtime (Docker)
    let runtime = Arc::new(DockerRuntime::connect()?);

    let notifier = Notifier::from_config(&cfg);
    let reconciler = Reconciler::new(Arc::clone(&runtime), Arc::clone(&cfg));

    // Finish any replacement a previous run left half-done before the
    // first cycle can trip over the leftover names.
    if let Err(e) = reconciler.recover_interrupted().await {
        warn!("startup recovery incomplete: {}", e);
    }

    let mut ticker = interval(Duration::from_secs(cfg.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately; without run_on_startup it only
    // arms the schedule.
    let mut first = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if first {
                    first = false;
                    if !cfg.run_on_startup {
                        info!("first cycle in {}s", cfg.interval_secs);
                        continue;
                    }
                }
                run_once(&reconciler, &notifier).await;
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn run_once(reconciler: &Reconciler<DockerRuntime>, notifier: &Notifier) {
    let Some(report) = reconciler.run_cycle().await else {
        warn!("previous cycle still running, skipping this one");
        return;
    };

    info!(
        "cycle finished: {} checked, {} updated, {} failed, {} skipped in {:.1}s",
        report.checked(),
        report.updated(),
        report.failed(),
        report.skipped(),
        report.duration_seconds()
    );
    for err in &report.errors {
        error!("cycle error: {}", err);
    }

    notifier.dispatch(&report).await;

    // Our own container was updated: the report went out first, now hand
    // control to the restart policy by stopping ourselves.
    if report.pending_self_restart() {
        info!("own image was updated, stopping for restart");
        reconciler.restart_self().await;
    }
}
