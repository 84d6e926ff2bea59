//! Runs one claimed job: pages in bounded parallel, then continuation
//! stitching and draft creation, then the job's terminal status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, info_span, warn};

use crate::config::AutoCommitConfig;
use crate::db::page_repo::{self, PageRow};
use crate::db::{timestamp, DatabaseError};
use crate::drafts::{skip_reasons, DraftManager};
use crate::pipeline::error::{MSG_CANCELLED, MSG_NO_TEXT};
use crate::pipeline::{
    BroadcastProgress, PageContext, PageError, PageOutcome, Pipeline, ProgressEvent, ProgressReporter,
};
use crate::progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
use crate::queue::{ClaimedJob, JobStatus, JobStore, PageStatus};
use crate::record::RecordCandidate;
use crate::sanitize::redact_name;

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { drafts: usize, failed_pages: usize },
    Failed { user_message: String },
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    /// Stopped on request; stored as a failed job.
    Cancelled,
    /// Another worker reclaimed the job before it finished here.
    ClaimLost,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub worker_id: String,
    pub outcome: JobOutcome,
}

/// A page that ended with an error in this run.
struct PageFailure {
    ordinal: u32,
    error: PageError,
}

pub struct Orchestrator {
    jobs: JobStore,
    pipeline: Pipeline,
    drafts: DraftManager,
    page_parallelism: usize,
    progress: Option<JobProgressBroadcaster>,
    autocommit: Option<AutoCommitConfig>,
}

impl Orchestrator {
    pub fn new(jobs: JobStore, pipeline: Pipeline, drafts: DraftManager, page_parallelism: usize) -> Self {
        Self {
            jobs,
            pipeline,
            drafts,
            page_parallelism: page_parallelism.max(1),
            progress: None,
            autocommit: None,
        }
    }

    pub fn with_progress(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.progress = Some(broadcaster);
        self
    }

    /// Commits drafts clearing `config.threshold` once their job completes.
    pub fn with_autocommit(mut self, config: &AutoCommitConfig) -> Self {
        self.autocommit = config.enabled.then(|| config.clone());
        self
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Claims and runs one job. `None` when the queue has nothing eligible.
    pub fn run_once(&self, worker_id: &str) -> Result<Option<JobReport>, DatabaseError> {
        let Some(claim) = self.jobs.claim_next(worker_id)? else {
            return Ok(None);
        };
        let outcome = self.process(&claim)?;
        Ok(Some(JobReport {
            job_id: claim.id().to_string(),
            worker_id: worker_id.to_string(),
            outcome,
        }))
    }

    /// Drives a claimed job to a terminal status or back to the queue.
    pub fn process(&self, claim: &ClaimedJob) -> Result<JobOutcome, DatabaseError> {
        let _job_span = info_span!("job", job_id = %claim.id(), tenant_id = %claim.tenant_id()).entered();
        let db = self.jobs.db();
        self.emit(claim, JobPhase::Claimed, "Job claimed for processing");

        // A crashed attempt may have left pages mid-stage.
        page_repo::transition_all(
            db,
            claim.id(),
            &[PageStatus::Processing.as_str()],
            PageStatus::Pending.as_str(),
            &timestamp(Utc::now()),
        )?;

        if self.cancel_requested(claim) {
            return self.cancel(claim);
        }

        let pages = self.jobs.pages(claim.id())?;
        let pending: Vec<PageRow> = pages
            .iter()
            .filter(|p| p.status.parse::<PageStatus>().map_or(true, |s| !s.is_settled()))
            .cloned()
            .collect();
        if pending.len() < pages.len() {
            info!(
                skipped = pages.len() - pending.len(),
                "Resuming job; settled pages are kept"
            );
        }

        let failures = self.run_pages(claim, pending);

        if failures.iter().any(|f| matches!(f.error, PageError::Cancelled)) || self.cancel_requested(claim) {
            return self.cancel(claim);
        }

        if let Some(transient) = failures.iter().find(|f| f.error.is_transient()) {
            return self.requeue(claim, transient);
        }

        self.finish(claim)
    }

    fn cancel_requested(&self, claim: &ClaimedJob) -> bool {
        match self.jobs.is_cancel_requested(claim.id()) {
            Ok(flag) => flag,
            Err(e) => {
                warn!("Cancellation check failed: {}", e);
                false
            }
        }
    }

    /// Processes pages with at most `page_parallelism` in flight. Each page
    /// row is persisted as soon as its run ends.
    fn run_pages(&self, claim: &ClaimedJob, pending: Vec<PageRow>) -> Vec<PageFailure> {
        if pending.is_empty() {
            return Vec::new();
        }
        let reporter: Box<dyn ProgressReporter> = match &self.progress {
            Some(b) => Box::new(BroadcastProgress::new(claim.id(), claim.tenant_id(), b.clone())),
            None => Box::new(crate::pipeline::NoopProgress),
        };
        let reporter = reporter.as_ref();
        let next = AtomicUsize::new(0);
        let failures = Mutex::new(Vec::new());
        let job_span = tracing::Span::current();
        let threads = self.page_parallelism.min(pending.len());

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    let _enter = job_span.enter();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(page) = pending.get(i) else {
                            break;
                        };
                        if let Some(failure) = self.run_page(claim, page.clone(), reporter) {
                            if let Ok(mut guard) = failures.lock() {
                                guard.push(failure);
                            }
                        }
                    }
                });
            }
        });

        let mut failures = failures.into_inner().unwrap_or_default();
        failures.sort_by_key(|f| f.ordinal);
        failures
    }

    fn run_page(&self, claim: &ClaimedJob, page: PageRow, progress: &dyn ProgressReporter) -> Option<PageFailure> {
        let _page_span = info_span!(
            "page",
            page_id = %page.id,
            ordinal = page.ordinal,
            file = %redact_name(&page.filename)
        )
        .entered();
        let db = self.jobs.db();
        let ordinal = page.ordinal;
        let page_id = page.id.clone();

        if let Err(e) = page_repo::set_status(db, &page.id, PageStatus::Processing.as_str(), &timestamp(Utc::now())) {
            warn!("Failed to mark page processing: {}", e);
            return Some(PageFailure {
                ordinal,
                error: e.into(),
            });
        }
        progress.report(ProgressEvent::PageStarted {
            page_id: &page_id,
            ordinal,
        });

        let mut ctx = PageContext::new(claim.id(), claim.tenant_id(), page);
        let cancelled = || self.cancel_requested(claim);
        let result = self.pipeline.run(&mut ctx, &cancelled, progress);

        let (status, failure) = match result {
            Ok(outcome) => {
                if let PageOutcome::Extracted { candidates } = outcome {
                    debug!(candidates, "Page extracted");
                }
                ctx.page.error = None;
                ctx.page.user_message = None;
                (outcome.status(), None)
            }
            Err(error) => {
                let status = if matches!(error, PageError::Cancelled) {
                    PageStatus::Cancelled
                } else if error.is_transient() {
                    PageStatus::Pending
                } else {
                    PageStatus::Failed
                };
                warn!(transient = error.is_transient(), "Page stopped: {}", error);
                ctx.page.error = Some(error.to_string());
                ctx.page.user_message = Some(error.user_message().to_string());
                (status, Some(PageFailure { ordinal, error }))
            }
        };

        ctx.page.status = status.as_str().to_string();
        ctx.page.updated_at = timestamp(Utc::now());
        if let Err(e) = page_repo::update(db, &ctx.page) {
            warn!("Failed to persist page state: {}", e);
            if failure.is_none() {
                return Some(PageFailure {
                    ordinal,
                    error: e.into(),
                });
            }
        }
        progress.report(ProgressEvent::PageFinished {
            page_id: &page_id,
            ordinal,
            status: status.as_str(),
            error: failure.as_ref().map(|f| f.error.user_message()),
        });
        failure
    }

    /// All pages are settled: stitch continuations, create drafts, then
    /// complete the job unless every page failed.
    fn finish(&self, claim: &ClaimedJob) -> Result<JobOutcome, DatabaseError> {
        let db = self.jobs.db();
        let pages = self.jobs.pages(claim.id())?;

        let mut extracted: Vec<(PageRow, Vec<RecordCandidate>)> = Vec::new();
        for page in &pages {
            let status = page.status.parse::<PageStatus>().ok();
            if !matches!(status, Some(PageStatus::Extracted | PageStatus::Completed)) {
                continue;
            }
            let candidates = match page.candidates_ref.as_deref() {
                Some(reference) => match self.pipeline.artifacts().get_json::<Vec<RecordCandidate>>(reference) {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        // Artifact lost: run the page again on the next attempt.
                        warn!(page_id = %page.id, "Candidates unavailable: {}", e);
                        page_repo::set_status(db, &page.id, PageStatus::Pending.as_str(), &timestamp(Utc::now()))?;
                        let failure = PageFailure {
                            ordinal: page.ordinal,
                            error: e.into(),
                        };
                        return self.requeue(claim, &failure);
                    }
                },
                None => Vec::new(),
            };
            extracted.push((page.clone(), candidates));
        }

        let stitched = stitch_continuations(&mut extracted, |c| self.pipeline.scorer().refresh(c));
        if stitched > 0 {
            debug!(stitched, "Stitched records across page breaks");
        }

        let mut drafts = 0;
        let mut eligible = Vec::new();
        for (page, candidates) in &extracted {
            for (index, candidate) in candidates.iter().enumerate() {
                let draft = match self.drafts.create(claim.id(), &page.id, claim.tenant_id(), index as u32, candidate) {
                    Ok(draft) => draft,
                    Err(e) => {
                        let failure = PageFailure {
                            ordinal: page.ordinal,
                            error: e.into(),
                        };
                        return self.requeue(claim, &failure);
                    }
                };
                drafts += 1;
                if let Some(config) = &self.autocommit {
                    let reasons = skip_reasons(candidate, config.threshold);
                    if reasons.is_empty() {
                        eligible.push(draft.id);
                    } else {
                        debug!(draft_id = %draft.id, ?reasons, "Draft stays in review");
                    }
                }
            }
            page_repo::set_status(db, &page.id, PageStatus::Completed.as_str(), &timestamp(Utc::now()))?;
        }
        if let Some(b) = &self.progress {
            let mut event = JobProgressEvent::new(
                claim.id(),
                claim.tenant_id(),
                JobPhase::DraftsCreated,
                &format!("Created {} drafts", drafts),
            );
            event.drafts = Some(drafts as u32);
            b.send(event);
        }

        let failed: Vec<&PageRow> = pages
            .iter()
            .filter(|p| p.status == PageStatus::Failed.as_str())
            .collect();
        if !pages.is_empty() && failed.len() == pages.len() {
            let user_message = failed
                .iter()
                .find_map(|p| p.user_message.clone())
                .unwrap_or_else(|| MSG_NO_TEXT.to_string());
            let error = failed
                .iter()
                .filter_map(|p| p.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            if !self.jobs.finish(claim, JobStatus::Failed, Some(&error), Some(&user_message))? {
                return Ok(JobOutcome::ClaimLost);
            }
            info!("Job failed: every page failed");
            if let Some(b) = &self.progress {
                b.send(JobProgressEvent::failed(claim.id(), claim.tenant_id(), &user_message));
            }
            return Ok(JobOutcome::Failed { user_message });
        }

        if !self.jobs.finish(claim, JobStatus::Completed, None, None)? {
            return Ok(JobOutcome::ClaimLost);
        }
        info!(drafts, failed_pages = failed.len(), "Job completed");
        self.autocommit(claim, &eligible, drafts - eligible.len());
        self.emit(claim, JobPhase::Completed, "Processing completed");
        Ok(JobOutcome::Completed {
            drafts,
            failed_pages: failed.len(),
        })
    }

    /// Runs after the job completed, so a failure here only leaves the
    /// drafts in review.
    fn autocommit(&self, claim: &ClaimedJob, eligible: &[String], skipped: usize) {
        let Some(config) = &self.autocommit else {
            return;
        };
        if eligible.is_empty() {
            debug!(skipped, "No draft eligible for auto-commit");
            return;
        }
        if let Err(e) = self
            .drafts
            .autocommit(claim.id(), claim.tenant_id(), eligible, skipped, config.threshold)
        {
            warn!("Auto-commit failed; drafts stay in review: {}", e);
        }
    }

    fn requeue(&self, claim: &ClaimedJob, failure: &PageFailure) -> Result<JobOutcome, DatabaseError> {
        let db = self.jobs.db();
        page_repo::transition_all(
            db,
            claim.id(),
            &[PageStatus::Processing.as_str()],
            PageStatus::Pending.as_str(),
            &timestamp(Utc::now()),
        )?;
        let pages = self.jobs.pages(claim.id())?;
        let context = json!({
            "job": {
                "id": claim.job.id,
                "tenantId": claim.job.tenant_id,
                "batchId": claim.job.batch_id,
                "retryCount": claim.job.retry_count,
                "createdAt": claim.job.created_at,
            },
            "failedPage": failure.ordinal,
            "pages": pages.iter().map(|p| json!({
                "id": p.id,
                "ordinal": p.ordinal,
                "status": p.status,
                "error": p.error,
            })).collect::<Vec<_>>(),
        });

        let error = failure.error.to_string();
        let user_message = failure.error.user_message();
        let outcome = self.jobs.requeue(claim, &error, user_message, &context)?;
        Ok(match outcome {
            crate::db::job_repo::RequeueOutcome::Requeued { retry_count, .. } => {
                self.emit(claim, JobPhase::Requeued, &format!("Retry {} scheduled", retry_count));
                JobOutcome::Requeued { retry_count }
            }
            crate::db::job_repo::RequeueOutcome::DeadLettered { retry_count } => {
                if let Some(b) = &self.progress {
                    b.send(JobProgressEvent::failed(claim.id(), claim.tenant_id(), user_message));
                }
                JobOutcome::DeadLettered { retry_count }
            }
            crate::db::job_repo::RequeueOutcome::ClaimLost => JobOutcome::ClaimLost,
        })
    }

    /// Leaves finished pages as they are and marks the rest cancelled. The
    /// job itself ends `failed` with the cancellation message.
    fn cancel(&self, claim: &ClaimedJob) -> Result<JobOutcome, DatabaseError> {
        page_repo::transition_all(
            self.jobs.db(),
            claim.id(),
            &[PageStatus::Pending.as_str(), PageStatus::Processing.as_str()],
            PageStatus::Cancelled.as_str(),
            &timestamp(Utc::now()),
        )?;
        if !self
            .jobs
            .finish(claim, JobStatus::Failed, Some("cancelled on request"), Some(MSG_CANCELLED))?
        {
            return Ok(JobOutcome::ClaimLost);
        }
        info!("Job cancelled");
        if let Some(b) = &self.progress {
            b.send(JobProgressEvent::failed(claim.id(), claim.tenant_id(), MSG_CANCELLED));
        }
        Ok(JobOutcome::Cancelled)
    }

    fn emit(&self, claim: &ClaimedJob, phase: JobPhase, message: &str) {
        if let Some(b) = &self.progress {
            b.send(JobProgressEvent::new(claim.id(), claim.tenant_id(), phase, message));
        }
    }
}

/// Folds a page's leading `continues_previous` record into the open record
/// of the directly preceding page. A page consumed entirely by the fragment
/// passes the open record on, so one entry can span several pages. Returns
/// the number of fragments stitched.
pub fn stitch_continuations(
    pages: &mut [(PageRow, Vec<RecordCandidate>)],
    rescore: impl Fn(&mut RecordCandidate),
) -> usize {
    let mut stitched = 0;
    // Index of the page whose last record a fragment would extend.
    let mut open: Option<usize> = None;
    for i in 0..pages.len() {
        let mut consumed = false;
        if let Some(o) = open.filter(|_| pages[i].0.ordinal == pages[i - 1].0.ordinal + 1) {
            let (before, after) = pages.split_at_mut(i);
            let current = &mut after[0].1;
            if let Some(target) = before[o].1.last_mut() {
                let continues = current
                    .first()
                    .is_some_and(|c| c.continues_previous && c.record_type == target.record_type);
                if continues {
                    target.absorb_continuation(current.remove(0));
                    rescore(target);
                    stitched += 1;
                    consumed = current.is_empty();
                }
            }
        }
        if !pages[i].1.is_empty() {
            open = Some(i);
        } else if !consumed {
            open = None;
        }
    }
    stitched
}
