//! Test harness for isolated end-to-end runs.
//!
//! `TestHarness` owns a temp directory holding the database and artifact
//! store, a scripted recognition engine and a fully wired [`Metrica`].
//! Jobs are run on the test thread with [`TestHarness::drain`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use metrica::drafts::ReviewFilter;
use metrica::error::{PermanentKind, TransientKind};
use metrica::{
    Config, Database, EngineError, FusionDraft, JobReport, JobStatusReport, Metrica, OcrEngine,
    RawOcrResult, SqliteRecordsStore, SubmittedFile,
};

use super::builders::page_png;

/// Returns the result registered for the image's width. The width survives
/// preprocessing of the blank test pages, unlike their bytes.
#[derive(Default)]
pub struct ScriptedEngine {
    pages: Mutex<HashMap<u32, RawOcrResult>>,
    failure: Mutex<Option<EngineError>>,
    page_failures: Mutex<HashMap<u32, EngineError>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn script(&self, width: u32, result: RawOcrResult) {
        self.pages
            .lock()
            .expect("engine script lock")
            .insert(width, result);
    }

    /// Makes every call fail with `error` until cleared.
    pub fn fail_with(&self, error: Option<EngineError>) {
        *self.failure.lock().expect("engine failure lock") = error;
    }

    /// Makes calls for one page width fail with `error` until cleared.
    pub fn fail_page_with(&self, width: u32, error: Option<EngineError>) {
        let mut failures = self.page_failures.lock().expect("engine failure lock");
        match error {
            Some(error) => failures.insert(width, error),
            None => failures.remove(&width),
        };
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn recognize(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().expect("engine failure lock").clone() {
            return Err(error);
        }
        let width = image::load_from_memory(image)
            .map_err(|e| EngineError::permanent(PermanentKind::BadImage, e.to_string()))?
            .width();
        if let Some(error) = self.page_failures.lock().expect("engine failure lock").get(&width) {
            return Err(error.clone());
        }
        self.pages
            .lock()
            .expect("engine script lock")
            .get(&width)
            .cloned()
            .ok_or_else(|| {
                EngineError::permanent(PermanentKind::InvalidRequest, format!("no script for width {}", width))
            })
    }
}

pub fn transient_failure() -> EngineError {
    EngineError::transient(TransientKind::Server(503), "service unavailable")
}

/// Settings that keep tests fast and deterministic: no backoff, a single
/// recognition attempt, immediate retries, blank pages not flagged as low
/// quality.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.database_path = Some(root.join("data").join("metrica.db").display().to_string());
    config.artifact_directory = root.join("artifacts").display().to_string();
    config.worker.pool_size = 2;
    config.worker.page_parallelism = 2;
    config.worker.max_retries = 2;
    config.worker.retry_delay_ms = 0;
    config.worker.poll_interval_ms = 20;
    config.engine.max_attempts = 1;
    config.engine.backoff_base_ms = 0;
    config.engine.backoff_max_ms = 0;
    config.engine.requests_per_second = 10_000.0;
    config.engine.burst = 100;
    config.preprocess.low_quality_threshold = 0.0;
    config
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: Config,
    pub engine: Arc<ScriptedEngine>,
    pub service: Metrica,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness after letting the caller adjust the test config.
    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = test_config(temp_dir.path());
        adjust(&mut config);

        let db_path = config.database_path().expect("database path");
        let db = Database::open(&db_path).expect("Failed to open database");
        let engine = Arc::new(ScriptedEngine::default());
        let store = Arc::new(SqliteRecordsStore::new(db.clone()));
        let service = Metrica::assemble(config.clone(), db, engine.clone(), store)
            .expect("Failed to assemble service");

        Self {
            temp_dir,
            config,
            engine,
            service,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.database_path().expect("database path")
    }

    /// Scripts one page per result (keyed by a fresh width) and submits
    /// them as a single job.
    pub fn submit_pages(&self, tenant_id: &str, first_width: u32, pages: Vec<RawOcrResult>) -> String {
        let files: Vec<SubmittedFile> = pages
            .into_iter()
            .enumerate()
            .map(|(i, result)| {
                let width = first_width + i as u32;
                self.engine.script(width, result);
                SubmittedFile::new(format!("page-{}.png", i + 1), page_png(width))
            })
            .collect();
        self.service
            .submit_job(tenant_id, &files)
            .expect("Failed to submit job")
    }

    pub fn drain(&self) -> Vec<JobReport> {
        self.service.drain("test-worker").expect("Failed to run jobs")
    }

    pub fn status(&self, job_id: &str) -> JobStatusReport {
        self.service
            .get_job_status(job_id)
            .expect("Failed to read job status")
            .expect("job exists")
    }

    /// Drafts of one job awaiting review, grouped by page in candidate order.
    pub fn drafts_for(&self, tenant_id: &str, job_id: &str) -> Vec<FusionDraft> {
        let filter = ReviewFilter {
            job_id: Some(job_id.to_string()),
            ..Default::default()
        };
        let (mut drafts, _) = self
            .service
            .list_drafts_awaiting_review(tenant_id, &filter)
            .expect("Failed to list drafts");
        drafts.sort_by(|a, b| {
            (a.page_id.as_str(), a.candidate_index).cmp(&(b.page_id.as_str(), b.candidate_index))
        });
        drafts
    }
}
