pub mod classifier;
pub mod columns;
pub mod config;
pub mod corrections;
pub mod db;
pub mod drafts;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod ingest;
pub mod layout;
pub mod pipeline;
pub mod preprocess;
pub mod progress;
pub mod queue;
pub mod record;
pub mod sanitize;
pub mod scoring;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod text;
pub mod tokenizer;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config};
pub use db::Database;
pub use drafts::{
    AutoCommitBatch, DraftManager, FusionDraft, RecordsStore, ReviewFilter, RollbackReport, SqliteRecordsStore,
    WorkflowStatus,
};
pub use engine::{OcrEngine, RawOcrResult, RawWord};
pub use error::{ConfigError, DraftError, EngineError, IngestError, MetricaError, Result, WorkerError};
pub use ingest::SubmittedFile;
pub use progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
pub use queue::{JobStatus, JobStore, PageStatus};
pub use record::{RecordCandidate, RecordType};
pub use secrets::{resolve_secret, SecretError};
pub use service::{build_engine, JobStatusReport, Metrica, PageStatusReport};
pub use worker::{JobOutcome, JobReport, Sweeper, WorkerPool};
