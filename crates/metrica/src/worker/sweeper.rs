//! Background maintenance: resets jobs whose worker stalled and expires old
//! artifacts. Both run on their own interval from one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::WorkerError;
use crate::queue::JobStore;
use crate::storage::ArtifactStore;

const TICK: Duration = Duration::from_millis(200);

/// Time-based artifact deletion, independent of job processing.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub artifacts: ArtifactStore,
    pub max_age: Duration,
    pub interval: Duration,
}

pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Sweeper {
    pub fn start(
        jobs: JobStore,
        sweep_interval: Duration,
        retention: Option<RetentionPolicy>,
    ) -> Result<Self, WorkerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("metrica-sweeper".to_string())
            .spawn(move || run(jobs, sweep_interval, retention, flag))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
        info!("Started stale-job sweeper (every {:?})", sweep_interval);
        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sweeper thread panicked");
            }
        }
    }
}

/// One sweep pass. Returns the number of jobs returned to the queue.
pub fn sweep_once(jobs: &JobStore) -> usize {
    match jobs.sweep_stale() {
        Ok(stale) => stale.len(),
        Err(e) => {
            warn!("Stale-job sweep failed: {}", e);
            0
        }
    }
}

/// One retention pass. Returns the number of artifacts removed.
pub fn expire_once(policy: &RetentionPolicy) -> usize {
    match policy.artifacts.cleanup_older_than(policy.max_age) {
        Ok(report) => report.removed.len(),
        Err(e) => {
            warn!("Artifact retention failed: {}", e);
            0
        }
    }
}

fn run(jobs: JobStore, sweep_interval: Duration, retention: Option<RetentionPolicy>, shutdown: Arc<AtomicBool>) {
    let mut next_sweep = Instant::now();
    let mut next_expiry = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= next_sweep {
            let reset = sweep_once(&jobs);
            if reset > 0 {
                info!("Returned {} stalled jobs to the queue", reset);
            }
            next_sweep = now + sweep_interval;
        }
        if let Some(policy) = &retention {
            if now >= next_expiry {
                let removed = expire_once(policy);
                debug!("Retention pass removed {} artifacts", removed);
                next_expiry = now + policy.interval;
            }
        }
        thread::sleep(TICK);
    }
    debug!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::db::Database;
    use crate::queue::NewPage;
    use crate::storage::ArtifactKind;
    use tempfile::TempDir;

    #[test]
    fn test_sweep_once_resets_stalled_job() {
        let config = WorkerConfig {
            stale_timeout_secs: 0,
            ..Default::default()
        };
        let jobs = JobStore::new(Database::open_in_memory().unwrap(), &config);
        let id = jobs
            .enqueue(
                "st-nicholas",
                None,
                &[NewPage {
                    filename: "a.png".into(),
                    source_ref: "upload/aa/a".into(),
                }],
            )
            .unwrap();
        jobs.claim_next("crashed-worker").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(sweep_once(&jobs), 1);
        assert_eq!(jobs.get(&id).unwrap().unwrap().status, "queued");
        assert_eq!(jobs.incidents(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_expire_once_keeps_fresh_artifacts() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        let reference = artifacts.put(ArtifactKind::RawOcr, b"{}").unwrap();
        let policy = RetentionPolicy {
            artifacts: artifacts.clone(),
            max_age: Duration::from_secs(3600),
            interval: Duration::from_secs(60),
        };
        assert_eq!(expire_once(&policy), 0);
        assert!(artifacts.exists(&reference));
    }

    #[test]
    fn test_start_and_stop() {
        let jobs = JobStore::new(Database::open_in_memory().unwrap(), &WorkerConfig::default());
        let sweeper = Sweeper::start(jobs, Duration::from_secs(60), None).unwrap();
        sweeper.stop();
    }
}
