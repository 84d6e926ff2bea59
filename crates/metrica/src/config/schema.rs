use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.metrica/data/metrica.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_artifact_directory")]
    pub artifact_directory: String,
    /// Extra JSON layout templates, loaded on top of the built-in ones.
    #[serde(default)]
    pub template_directory: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub corrections: CorrectionsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub autocommit: AutoCommitConfig,
}

fn default_artifact_directory() -> String {
    "~/.metrica/artifacts".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            artifact_directory: default_artifact_directory(),
            template_directory: None,
            logging: LoggingConfig::default(),
            worker: WorkerConfig::default(),
            engine: EngineConfig::default(),
            preprocess: PreprocessConfig::default(),
            extraction: ExtractionConfig::default(),
            corrections: CorrectionsConfig::default(),
            retention: RetentionConfig::default(),
            autocommit: AutoCommitConfig::default(),
        }
    }
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => crate::db::default_database_path(),
        }
    }

    pub fn artifact_directory(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.artifact_directory))
    }

    pub fn template_directory(&self) -> Option<PathBuf> {
        self.template_directory
            .as_deref()
            .map(|d| PathBuf::from(expand_home(d)))
    }
}

fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_page_parallelism")]
    pub page_parallelism: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_page_parallelism() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_stale_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            page_parallelism: default_page_parallelism(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            stale_timeout_secs: default_stale_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Tesseract,
    Vision,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_kind")]
    pub kind: EngineKind,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default)]
    pub cost_per_page_micros: u64,
    #[serde(default)]
    pub replay_directory: Option<String>,
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Tesseract
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_burst() -> u32 {
    5
}

fn default_cache_capacity() -> u64 {
    1_024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            languages: default_languages(),
            endpoint: None,
            api_key: None,
            api_key_file: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            cache_capacity: default_cache_capacity(),
            cost_per_page_micros: 0,
            replay_directory: None,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> crate::engine::RetryPolicy {
        crate::engine::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_true")]
    pub orientation: bool,
    /// Extra clockwise rotation applied after EXIF orientation.
    #[serde(default)]
    pub rotation_degrees: u16,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Crop dark scanner borders along the edges.
    #[serde(default = "default_true")]
    pub border_crop: bool,
    /// Cut two-page spreads into separate pages at ingest.
    #[serde(default = "default_true")]
    pub split_spreads: bool,
    #[serde(default = "default_true")]
    pub grayscale: bool,
    #[serde(default = "default_true")]
    pub contrast: bool,
    /// Flatten uneven illumination. Grayscale pages only.
    #[serde(default = "default_true")]
    pub background: bool,
    #[serde(default = "default_true")]
    pub denoise: bool,
    #[serde(default = "default_true")]
    pub deskew: bool,
    #[serde(default = "default_max_deskew_degrees")]
    pub max_deskew_degrees: f32,
    #[serde(default = "default_low_quality_threshold")]
    pub low_quality_threshold: f32,
    #[serde(default = "default_pdf_dpi")]
    pub pdf_dpi: u32,
}

fn default_max_dimension() -> u32 {
    3_000
}

fn default_max_deskew_degrees() -> f32 {
    15.0
}

fn default_low_quality_threshold() -> f32 {
    0.35
}

fn default_pdf_dpi() -> u32 {
    300
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            orientation: true,
            rotation_degrees: 0,
            max_dimension: default_max_dimension(),
            border_crop: true,
            split_spreads: true,
            grayscale: true,
            contrast: true,
            background: true,
            denoise: true,
            deskew: true,
            max_deskew_degrees: default_max_deskew_degrees(),
            low_quality_threshold: default_low_quality_threshold(),
            pdf_dpi: default_pdf_dpi(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_ocr")]
    pub ocr: f32,
    #[serde(default = "default_weight_proximity")]
    pub proximity: f32,
    #[serde(default = "default_weight_format")]
    pub format: f32,
}

fn default_weight_ocr() -> f32 {
    0.5
}

fn default_weight_proximity() -> f32 {
    0.2
}

fn default_weight_format() -> f32 {
    0.3
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            ocr: default_weight_ocr(),
            proximity: default_weight_proximity(),
            format: default_weight_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_classifier_min_confidence")]
    pub classifier_min_confidence: f32,
    #[serde(default = "default_anchor_similarity")]
    pub anchor_similarity: f64,
    #[serde(default = "default_template_match_threshold")]
    pub template_match_threshold: f32,
    #[serde(default = "default_min_token_confidence")]
    pub min_token_confidence: f32,
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default = "default_field_review_threshold")]
    pub field_review_threshold: f32,
    #[serde(default = "default_age_tolerance_years")]
    pub age_tolerance_years: u32,
    /// Recognize poorly structured ledger pages a second time.
    #[serde(default = "default_true")]
    pub structure_retry: bool,
}

fn default_classifier_min_confidence() -> f32 {
    0.3
}

fn default_anchor_similarity() -> f64 {
    0.8
}

fn default_template_match_threshold() -> f32 {
    0.5
}

fn default_min_token_confidence() -> f32 {
    0.35
}

fn default_field_review_threshold() -> f32 {
    0.65
}

fn default_age_tolerance_years() -> u32 {
    1
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            classifier_min_confidence: default_classifier_min_confidence(),
            anchor_similarity: default_anchor_similarity(),
            template_match_threshold: default_template_match_threshold(),
            min_token_confidence: default_min_token_confidence(),
            weights: ScoreWeights::default(),
            field_review_threshold: default_field_review_threshold(),
            age_tolerance_years: default_age_tolerance_years(),
            structure_retry: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionsConfig {
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u32,
    #[serde(default = "default_dominance")]
    pub dominance: f32,
    #[serde(default = "default_near_match_similarity")]
    pub near_match_similarity: f64,
    #[serde(default = "default_applied_confidence")]
    pub applied_confidence: f32,
}

fn default_min_frequency() -> u32 {
    2
}

fn default_dominance() -> f32 {
    0.6
}

fn default_near_match_similarity() -> f64 {
    0.9
}

fn default_applied_confidence() -> f32 {
    0.9
}

impl Default for CorrectionsConfig {
    fn default() -> Self {
        Self {
            min_frequency: default_min_frequency(),
            dominance: default_dominance(),
            near_match_similarity: default_near_match_similarity(),
            applied_confidence: default_applied_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_artifact_max_age_days")]
    pub artifact_max_age_days: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_artifact_max_age_days() -> u64 {
    90
}

fn default_cleanup_interval_secs() -> u64 {
    3_600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            artifact_max_age_days: default_artifact_max_age_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.artifact_max_age_days.saturating_mul(24 * 3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Commits high-confidence drafts without review once their job completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCommitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_autocommit_threshold")]
    pub threshold: f32,
}

fn default_autocommit_threshold() -> f32 {
    0.92
}

impl Default for AutoCommitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_autocommit_threshold(),
        }
    }
}
