//! Long-running worker process: claims queued jobs, sweeps stale claims and
//! expires old artifacts until interrupted.
//!
//! Usage: `metrica-worker [config.json]`

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use metrica::{load_config, telemetry, Config, JobOutcome, Metrica};

fn main() -> ExitCode {
    let config = match std::env::args().nth(1) {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("metrica-worker: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    telemetry::init(&config.logging);
    info!("Starting metrica-worker v{}", env!("CARGO_PKG_VERSION"));

    let service = match Metrica::open(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            warn!("Interrupt handler not installed: {}", e);
        }
    }

    let pool = match service.start_workers("worker") {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to start workers: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let sweeper = match service.start_sweeper() {
        Ok(sweeper) => Some(sweeper),
        Err(e) => {
            warn!("Stale-job sweeper not running: {}", e);
            None
        }
    };

    while !stop.load(Ordering::SeqCst) {
        if let Ok(report) = pool.recv_report_timeout(Duration::from_millis(500)) {
            match &report.outcome {
                JobOutcome::Completed { drafts, failed_pages } => info!(
                    "Job {} completed on {}: {} drafts, {} failed pages",
                    report.job_id, report.worker_id, drafts, failed_pages
                ),
                JobOutcome::DeadLettered { retry_count } => warn!(
                    "Job {} dead-lettered after {} retries",
                    report.job_id, retry_count
                ),
                other => info!("Job {}: {:?}", report.job_id, other),
            }
        }
    }

    info!("Shutting down; waiting for in-flight jobs");
    pool.shutdown();
    pool.wait();
    if let Some(sweeper) = sweeper {
        sweeper.stop();
    }
    info!("metrica-worker stopped");
    ExitCode::SUCCESS
}
