//! The surface the surrounding application binds to: job submission,
//! status, the review queue and the draft operations.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{Config, EngineConfig, EngineKind};
use crate::corrections::CorrectionMemory;
use crate::db::job_repo::{DeadLetterRow, IncidentRow};
use crate::db::usage_repo::{self, UsageSummary};
use crate::db::autocommit_repo::BatchRow;
use crate::db::{draft_repo, Database, DatabaseError};
use crate::drafts::{DraftManager, FusionDraft, RecordsStore, ReviewFilter, RollbackReport, SqliteRecordsStore};
use crate::engine::{OcrClient, OcrEngine, RateLimiter, ReplayEngine, TesseractEngine, VisionEngine};
use crate::error::{ConfigError, MetricaError, Result};
use crate::ingest::{Ingestor, PdfRenderer, SubmittedFile};
use crate::layout::TemplateRegistry;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::progress::{JobProgressBroadcaster, JobProgressEvent};
use crate::queue::JobStore;
use crate::secrets::resolve_secret;
use crate::storage::ArtifactStore;
use crate::worker::{JobReport, Orchestrator, RetentionPolicy, Sweeper, WorkerPool};

/// Per-page part of [`JobStatusReport`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStatusReport {
    pub page_id: String,
    pub ordinal: u32,
    pub filename: String,
    pub status: String,
    pub record_type: Option<String>,
    pub classification_confidence: Option<f64>,
    pub quality_score: Option<f64>,
    pub needs_review: bool,
    pub detected_language: Option<String>,
    pub drafts: u32,
    pub user_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub job_id: String,
    pub tenant_id: String,
    pub batch_id: Option<String>,
    pub status: String,
    pub retry_count: u32,
    pub error: Option<String>,
    pub user_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub pages: Vec<PageStatusReport>,
}

/// Builds the recognition engine named in config.
pub fn build_engine(config: &EngineConfig) -> std::result::Result<Arc<dyn OcrEngine>, ConfigError> {
    let engine: Arc<dyn OcrEngine> = match config.kind {
        EngineKind::Tesseract => Arc::new(TesseractEngine::new(&config.languages)),
        EngineKind::Vision => {
            let key = resolve_secret(
                config.api_key.as_deref(),
                config.api_key_file.as_deref(),
                config.api_key_env.as_deref(),
            )?;
            let engine = VisionEngine::new(
                config.endpoint.as_deref(),
                key,
                config.languages.clone(),
                config.retry_policy().timeout,
            )
            .map_err(|e| ConfigError::Validation {
                message: e.to_string(),
            })?;
            Arc::new(engine)
        }
        EngineKind::Replay => {
            let dir = config
                .replay_directory
                .as_deref()
                .ok_or_else(|| ConfigError::Validation {
                    message: "engine.replay_directory is required for the replay engine".to_string(),
                })?;
            Arc::new(ReplayEngine::from_directory(dir))
        }
    };
    Ok(engine)
}

/// Everything a process needs to accept jobs, run workers and serve
/// review calls. Cheap to share behind an `Arc`.
pub struct Metrica {
    config: Config,
    db: Database,
    artifacts: ArtifactStore,
    jobs: JobStore,
    ingestor: Ingestor,
    drafts: DraftManager,
    orchestrator: Arc<Orchestrator>,
    progress: JobProgressBroadcaster,
}

impl Metrica {
    /// Opens the configured database and engine, with records committed
    /// into the local `records` table.
    pub fn open(config: Config) -> Result<Self> {
        let path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "no database_path configured and no home directory found".to_string(),
        })?;
        let db = Database::open(&path)?;
        let engine = build_engine(&config.engine)?;
        let store: Arc<dyn RecordsStore> = Arc::new(SqliteRecordsStore::new(db.clone()));
        Self::assemble(config, db, engine, store)
    }

    /// Wires the components around an explicit database, engine and
    /// records store.
    pub fn assemble(
        config: Config,
        db: Database,
        engine: Arc<dyn OcrEngine>,
        store: Arc<dyn RecordsStore>,
    ) -> Result<Self> {
        let mut registry = TemplateRegistry::with_builtins();
        if let Some(dir) = config.template_directory() {
            registry.load_directory(&dir)?;
        }

        let artifacts = ArtifactStore::new(config.artifact_directory());
        let engine_cfg = &config.engine;
        let limiter = Arc::new(RateLimiter::new(engine_cfg.requests_per_second, engine_cfg.burst));
        let client = OcrClient::new(
            engine,
            limiter,
            db.clone(),
            artifacts.clone(),
            engine_cfg.retry_policy(),
            engine_cfg.cache_capacity,
            engine_cfg.cost_per_page_micros,
        );

        let memory = CorrectionMemory::new(db.clone(), config.corrections.clone());
        let drafts = DraftManager::new(
            db.clone(),
            memory.clone(),
            store,
            config.extraction.age_tolerance_years,
        );
        let jobs = JobStore::new(db.clone(), &config.worker);
        let pipeline = Pipeline::from_config(
            Arc::new(PipelineConfig::from_config(&config)),
            client,
            Arc::new(registry),
            memory,
            artifacts.clone(),
        );
        let progress = JobProgressBroadcaster::default();
        let orchestrator = Orchestrator::new(jobs.clone(), pipeline, drafts.clone(), config.worker.page_parallelism)
            .with_progress(progress.clone())
            .with_autocommit(&config.autocommit);

        Ok(Self {
            ingestor: Ingestor::new(config.preprocess.pdf_dpi).with_spread_split(config.preprocess.split_spreads),
            config,
            db,
            artifacts,
            jobs,
            drafts,
            orchestrator: Arc::new(orchestrator),
            progress,
        })
    }

    /// Replaces the PDF rasterizer.
    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.ingestor = Ingestor::with_renderer(renderer, self.config.preprocess.pdf_dpi)
            .with_spread_split(self.config.preprocess.split_spreads);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// The review surface: assign, edit, acknowledge, finalize, commit and
    /// reject.
    pub fn drafts(&self) -> &DraftManager {
        &self.drafts
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobProgressEvent> {
        self.progress.subscribe()
    }

    /// Stores the files and enqueues one job with a page per image or PDF
    /// page. Nothing is enqueued when any file is rejected.
    pub fn submit_job(&self, tenant_id: &str, files: &[SubmittedFile]) -> Result<String> {
        self.submit_batch(tenant_id, None, files)
    }

    pub fn submit_batch(&self, tenant_id: &str, batch_id: Option<&str>, files: &[SubmittedFile]) -> Result<String> {
        let _span = tracing::info_span!("submit_job", tenant_id, files = files.len()).entered();
        let pages = self.ingestor.stage(&self.artifacts, files)?;
        Ok(self.jobs.enqueue(tenant_id, batch_id, &pages)?)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatusReport>> {
        let Some(job) = self.jobs.get(job_id)? else {
            return Ok(None);
        };
        let counts = draft_repo::count_by_page(&self.db, job_id)?;
        let pages = self
            .jobs
            .pages(job_id)?
            .into_iter()
            .map(|p| PageStatusReport {
                drafts: counts.get(&p.id).copied().unwrap_or(0),
                page_id: p.id,
                ordinal: p.ordinal,
                filename: p.filename,
                status: p.status,
                record_type: p.record_type,
                classification_confidence: p.classification_confidence,
                quality_score: p.quality_score,
                needs_review: p.needs_review,
                detected_language: p.detected_language,
                user_message: p.user_message,
            })
            .collect();

        Ok(Some(JobStatusReport {
            job_id: job.id,
            tenant_id: job.tenant_id,
            batch_id: job.batch_id,
            status: job.status,
            retry_count: job.retry_count,
            error: job.error,
            user_message: job.user_message,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            completed_at: job.completed_at,
            pages,
        }))
    }

    pub fn list_drafts_awaiting_review(
        &self,
        tenant_id: &str,
        filter: &ReviewFilter,
    ) -> Result<(Vec<FusionDraft>, u64)> {
        Ok(self.drafts.list_awaiting_review(tenant_id, filter)?)
    }

    /// Auto-commit batches recorded for a job, oldest first.
    pub fn autocommit_batches(&self, job_id: &str) -> Result<Vec<BatchRow>> {
        Ok(self.drafts.autocommit_batches(job_id)?)
    }

    /// Deletes the records of an auto-commit batch and sends its drafts
    /// back to review.
    pub fn rollback_autocommit(&self, batch_id: &str, actor: &str) -> Result<RollbackReport> {
        Ok(self.drafts.rollback_batch(batch_id, actor)?)
    }

    /// Flags a job for cancellation; workers stop it between page stages.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.jobs.request_cancel(job_id)?)
    }

    pub fn dead_letters(&self, tenant_id: Option<&str>) -> Result<Vec<DeadLetterRow>> {
        Ok(self.jobs.dead_letters(tenant_id)?)
    }

    pub fn incidents(&self, job_id: &str) -> Result<Vec<IncidentRow>> {
        Ok(self.jobs.incidents(job_id)?)
    }

    pub fn usage(&self, tenant_id: &str, from: Option<&str>, to: Option<&str>) -> Result<UsageSummary> {
        Ok(usage_repo::summarize(&self.db, tenant_id, from, to)?)
    }

    /// Claims and runs one job on the calling thread.
    pub fn run_once(&self, worker_id: &str) -> std::result::Result<Option<JobReport>, DatabaseError> {
        self.orchestrator.run_once(worker_id)
    }

    /// Runs jobs on the calling thread until none is eligible.
    pub fn drain(&self, worker_id: &str) -> Result<Vec<JobReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_once(worker_id)? {
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn start_workers(&self, id_prefix: &str) -> Result<WorkerPool> {
        let worker = &self.config.worker;
        WorkerPool::start(
            Arc::clone(&self.orchestrator),
            worker.pool_size,
            worker.poll_interval(),
            id_prefix,
        )
        .map_err(MetricaError::from)
    }

    /// Starts the stale-job sweeper together with artifact retention.
    pub fn start_sweeper(&self) -> Result<Sweeper> {
        let retention = RetentionPolicy {
            artifacts: self.artifacts.clone(),
            max_age: self.config.retention.max_age(),
            interval: self.config.retention.cleanup_interval(),
        };
        Sweeper::start(self.jobs.clone(), self.config.worker.sweep_interval(), Some(retention))
            .map_err(MetricaError::from)
    }
}
