//! Durable job queue over the `jobs` and `pages` tables.
//!
//! Several worker processes may share one database file. Claims are taken
//! under `BEGIN IMMEDIATE` and every later status change is guarded by the
//! claim token, so a job reclaimed from a stalled worker cannot be finished
//! by the worker that lost it.

use std::time::Duration;

use chrono::Utc;

use crate::config::WorkerConfig;
use crate::db::job_repo::{self, Claim, DeadLetterRow, IncidentRow, JobRow, RequeueOutcome};
use crate::db::page_repo::{self, PageRow};
use crate::db::{timestamp, Database, DatabaseError};
use crate::error::StaleJobError;

pub mod status;

pub use status::{JobStatus, PageStatus};

/// A page to enqueue: its display name and the stored upload artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPage {
    pub filename: String,
    pub source_ref: String,
}

/// A job held by one worker. The token must accompany every status change.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRow,
    pub claim_token: String,
    pub reclaimed_from: Option<String>,
}

impl ClaimedJob {
    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.job.tenant_id
    }
}

fn offset(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[derive(Clone)]
pub struct JobStore {
    db: Database,
    max_retries: u32,
    retry_delay: Duration,
    stale_timeout: Duration,
}

impl JobStore {
    pub fn new(db: Database, config: &WorkerConfig) -> Self {
        Self {
            db,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            stale_timeout: config.stale_timeout(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Creates a queued job with one pending page per entry, atomically.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        batch_id: Option<&str>,
        pages: &[NewPage],
    ) -> Result<String, DatabaseError> {
        let now = timestamp(Utc::now());
        let job = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            batch_id: batch_id.map(str::to_string),
            status: JobStatus::Queued.as_str().to_string(),
            retry_count: 0,
            error: None,
            user_message: None,
            claimed_by: None,
            claimed_at: None,
            claim_token: None,
            not_before: now.clone(),
            cancel_requested: false,
            created_at: now.clone(),
            updated_at: now.clone(),
            completed_at: None,
        };

        self.db.immediate(|conn| {
            job_repo::insert(conn, &job)?;
            for (i, page) in pages.iter().enumerate() {
                let row = PageRow::new(
                    uuid::Uuid::new_v4().to_string(),
                    &job.id,
                    i as u32 + 1,
                    &page.filename,
                    page.source_ref.clone(),
                    &now,
                );
                page_repo::insert(conn, &row)?;
            }
            Ok(())
        })?;

        log::info!("Enqueued job {} with {} pages", job.id, pages.len());
        Ok(job.id)
    }

    /// Claims the oldest eligible job, reclaiming one whose worker exceeded
    /// the staleness timeout.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, DatabaseError> {
        let now = Utc::now();
        let stale_before = now - offset(self.stale_timeout);
        let token = uuid::Uuid::new_v4().to_string();
        let claim = job_repo::claim_next(
            &self.db,
            worker_id,
            &token,
            &timestamp(now),
            &timestamp(stale_before),
        )?;

        Ok(claim.map(|Claim { job, reclaimed_from }| {
            if let Some(ref previous) = reclaimed_from {
                log::warn!(
                    "Worker {} reclaimed job {} from stalled worker {}",
                    worker_id,
                    job.id,
                    previous
                );
            }
            ClaimedJob {
                job,
                claim_token: token,
                reclaimed_from,
            }
        }))
    }

    /// Moves a claimed job to a terminal status. Returns `false` when the
    /// claim was lost.
    pub fn finish(
        &self,
        claim: &ClaimedJob,
        status: JobStatus,
        error: Option<&str>,
        user_message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let finished = job_repo::finish(
            &self.db,
            claim.id(),
            &claim.claim_token,
            status.as_str(),
            error,
            user_message,
            &timestamp(Utc::now()),
        )?;
        if !finished {
            log::warn!("Job {} was reclaimed before it could be marked {}", claim.id(), status);
        }
        Ok(finished)
    }

    /// Requeues after a transient failure with exponential delay, or
    /// dead-letters the job once the retry budget is spent.
    pub fn requeue(
        &self,
        claim: &ClaimedJob,
        error: &str,
        user_message: &str,
        context: &serde_json::Value,
    ) -> Result<RequeueOutcome, DatabaseError> {
        let now = Utc::now();
        let factor = 2u32.saturating_pow(claim.job.retry_count.min(16));
        let delay = self.retry_delay.saturating_mul(factor);
        let not_before = now + offset(delay);
        let context = crate::db::to_json("context", context)?;

        let outcome = job_repo::requeue(
            &self.db,
            claim.id(),
            &claim.claim_token,
            error,
            user_message,
            self.max_retries,
            &timestamp(not_before),
            &context,
            &timestamp(now),
        )?;
        match &outcome {
            RequeueOutcome::Requeued { retry_count, not_before } => {
                log::info!("Job {} requeued (retry {}) until {}", claim.id(), retry_count, not_before)
            }
            RequeueOutcome::DeadLettered { retry_count } => {
                log::error!("Job {} dead-lettered after {} retries: {}", claim.id(), retry_count, error)
            }
            RequeueOutcome::ClaimLost => {
                log::warn!("Job {} was reclaimed before it could be requeued", claim.id())
            }
        }
        Ok(outcome)
    }

    /// Resets jobs stuck in `processing` past the staleness timeout.
    pub fn sweep_stale(&self) -> Result<Vec<StaleJobError>, DatabaseError> {
        let now = Utc::now();
        let stale_before = now - offset(self.stale_timeout);
        let reset = job_repo::sweep_stale(&self.db, &timestamp(stale_before), &timestamp(now))?;
        let stale: Vec<StaleJobError> = reset
            .into_iter()
            .map(|(job_id, claimed_by, claimed_at)| StaleJobError {
                job_id,
                claimed_by,
                claimed_at,
            })
            .collect();
        for job in &stale {
            log::warn!("{}; returned to the queue", job);
        }
        Ok(stale)
    }

    pub fn request_cancel(&self, job_id: &str) -> Result<bool, DatabaseError> {
        job_repo::request_cancel(&self.db, job_id, &timestamp(Utc::now()))
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool, DatabaseError> {
        job_repo::is_cancel_requested(&self.db, job_id)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRow>, DatabaseError> {
        job_repo::find_by_id(&self.db, job_id)
    }

    pub fn pages(&self, job_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
        page_repo::list_for_job(&self.db, job_id)
    }

    pub fn dead_letters(&self, tenant_id: Option<&str>) -> Result<Vec<DeadLetterRow>, DatabaseError> {
        job_repo::list_dead_letters(&self.db, tenant_id)
    }

    pub fn incidents(&self, job_id: &str) -> Result<Vec<IncidentRow>, DatabaseError> {
        job_repo::list_incidents(&self.db, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_retries: u32, stale_timeout_secs: u64) -> JobStore {
        let config = WorkerConfig {
            max_retries,
            retry_delay_ms: 0,
            stale_timeout_secs,
            ..Default::default()
        };
        JobStore::new(Database::open_in_memory().unwrap(), &config)
    }

    fn pages(n: usize) -> Vec<NewPage> {
        (0..n)
            .map(|i| NewPage {
                filename: format!("page-{}.png", i + 1),
                source_ref: format!("upload/aa/{}", i),
            })
            .collect()
    }

    #[test]
    fn test_enqueue_creates_pending_pages() {
        let jobs = store(3, 600);
        let id = jobs.enqueue("st-nicholas", Some("batch-7"), &pages(3)).unwrap();

        let job = jobs.get(&id).unwrap().unwrap();
        assert_eq!(job.status, "queued");
        assert_eq!(job.batch_id.as_deref(), Some("batch-7"));

        let rows = jobs.pages(&id).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(rows.iter().all(|p| p.status == "pending"));
    }

    #[test]
    fn test_claim_and_finish() {
        let jobs = store(3, 600);
        let id = jobs.enqueue("t", None, &pages(1)).unwrap();

        let claim = jobs.claim_next("worker-a").unwrap().unwrap();
        assert_eq!(claim.id(), id);
        assert!(jobs.claim_next("worker-b").unwrap().is_none());

        assert!(jobs.finish(&claim, JobStatus::Completed, None, None).unwrap());
        let job = jobs.get(&id).unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert!(job.completed_at.is_some());
        assert!(!jobs.finish(&claim, JobStatus::Failed, None, None).unwrap());
    }

    #[test]
    fn test_retries_are_bounded() {
        let jobs = store(2, 600);
        let id = jobs.enqueue("t", None, &pages(1)).unwrap();
        let context = serde_json::json!({ "pages": [] });

        for expected in 1..=2 {
            let claim = jobs.claim_next("w").unwrap().unwrap();
            match jobs.requeue(&claim, "timeout", "retrying", &context).unwrap() {
                RequeueOutcome::Requeued { retry_count, .. } => assert_eq!(retry_count, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        let claim = jobs.claim_next("w").unwrap().unwrap();
        assert_eq!(
            jobs.requeue(&claim, "timeout", "retrying", &context).unwrap(),
            RequeueOutcome::DeadLettered { retry_count: 2 }
        );
        assert!(jobs.claim_next("w").unwrap().is_none());

        let job = jobs.get(&id).unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(jobs.dead_letters(None).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_returns_stale_jobs() {
        let jobs = store(3, 0);
        let id = jobs.enqueue("t", None, &pages(1)).unwrap();
        jobs.claim_next("stalled").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let stale = jobs.sweep_stale().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id, id);
        assert_eq!(stale[0].claimed_by, "stalled");
        assert_eq!(jobs.get(&id).unwrap().unwrap().status, "queued");
        assert_eq!(jobs.incidents(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_claim_loses_finish() {
        let jobs = store(3, 0);
        jobs.enqueue("t", None, &pages(1)).unwrap();
        let first = jobs.claim_next("a").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = jobs.claim_next("b").unwrap().unwrap();
        assert_eq!(second.reclaimed_from.as_deref(), Some("a"));

        assert!(!jobs.finish(&first, JobStatus::Completed, None, None).unwrap());
        assert!(jobs.finish(&second, JobStatus::Completed, None, None).unwrap());
    }

    #[test]
    fn test_cancel_request() {
        let jobs = store(3, 600);
        let id = jobs.enqueue("t", None, &pages(1)).unwrap();
        assert!(!jobs.is_cancel_requested(&id).unwrap());
        assert!(jobs.request_cancel(&id).unwrap());
        assert!(jobs.is_cancel_requested(&id).unwrap());
    }
}
