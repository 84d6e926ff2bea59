use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use super::orchestrator::{JobReport, Orchestrator};
use crate::error::WorkerError;

/// Granularity of shutdown checks while idle.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// N independent worker loops polling the job store. Claiming is the only
/// coordination between them (and between processes sharing the database).
pub struct WorkerPool {
    report_receiver: Receiver<JobReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` loops. Worker ids are `<prefix>-<n>`.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        worker_count: usize,
        poll_interval: Duration,
        id_prefix: &str,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let (report_sender, report_receiver) = bounded::<JobReport>(worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let worker_id = format!("{}-{}", id_prefix, n);
            let orchestrator = Arc::clone(&orchestrator);
            let report_tx = report_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || run_worker(&worker_id, &orchestrator, report_tx, shutdown_flag, poll_interval))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_report(&self) -> Option<JobReport> {
        self.report_receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next finished job.
    pub fn recv_report_timeout(&self, timeout: Duration) -> Result<JobReport, WorkerError> {
        self.report_receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => WorkerError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => WorkerError::ChannelClosed,
        })
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins every worker. A worker finishes its current job first.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: &str,
    orchestrator: &Orchestrator,
    report_sender: Sender<JobReport>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match orchestrator.run_once(worker_id) {
            Ok(Some(report)) => {
                debug!("Worker {} finished job {}: {:?}", worker_id, report.job_id, report.outcome);
                // Nobody is required to read reports; drop them when full.
                if let Err(TrySendError::Disconnected(_)) = report_sender.try_send(report) {
                    debug!("Worker {} report channel closed", worker_id);
                }
            }
            Ok(None) => idle(&shutdown, poll_interval),
            Err(e) => {
                warn!("Worker {} failed to claim or finish a job: {}", worker_id, e);
                idle(&shutdown, poll_interval);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn idle(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(IDLE_TICK.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_returns_early_on_shutdown() {
        let flag = AtomicBool::new(true);
        let started = Instant::now();
        idle(&flag, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_idle_waits_for_duration() {
        let flag = AtomicBool::new(false);
        let started = Instant::now();
        idle(&flag, Duration::from_millis(150));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
