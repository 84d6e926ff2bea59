use std::path::Path;

use crate::config::schema::{Config, EngineKind};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("{} must be within [0, 1], got {}", name, value)));
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!("Unsupported config version: {}", config.version)));
    }

    let worker = &config.worker;
    if worker.pool_size == 0 {
        return Err(invalid("worker.pool_size must be at least 1"));
    }
    if worker.page_parallelism == 0 {
        return Err(invalid("worker.page_parallelism must be at least 1"));
    }

    let engine = &config.engine;
    if !(engine.requests_per_second > 0.0) {
        return Err(invalid("engine.requests_per_second must be positive"));
    }
    if engine.backoff_max_ms < engine.backoff_base_ms {
        return Err(invalid("engine.backoff_max_ms must not be below engine.backoff_base_ms"));
    }
    match engine.kind {
        EngineKind::Vision => {
            if !crate::secrets::has_secret_source(
                engine.api_key.as_deref(),
                engine.api_key_file.as_deref(),
                engine.api_key_env.as_deref(),
            ) {
                return Err(invalid(
                    "engine.kind 'vision' needs one of api_key, api_key_file or api_key_env",
                ));
            }
        }
        EngineKind::Replay => {
            if engine.replay_directory.is_none() {
                return Err(invalid("engine.kind 'replay' needs engine.replay_directory"));
            }
        }
        EngineKind::Tesseract => {}
    }

    let pre = &config.preprocess;
    if !(pre.max_deskew_degrees > 0.0 && pre.max_deskew_degrees <= 45.0) {
        return Err(invalid(format!(
            "preprocess.max_deskew_degrees must be within (0, 45], got {}",
            pre.max_deskew_degrees
        )));
    }
    if pre.rotation_degrees % 90 != 0 || pre.rotation_degrees >= 360 {
        return Err(invalid("preprocess.rotation_degrees must be 0, 90, 180 or 270"));
    }
    check_unit("preprocess.low_quality_threshold", pre.low_quality_threshold.into())?;

    let ex = &config.extraction;
    check_unit("extraction.classifier_min_confidence", ex.classifier_min_confidence.into())?;
    check_unit("extraction.anchor_similarity", ex.anchor_similarity)?;
    check_unit("autocommit.threshold", config.autocommit.threshold.into())?;
    check_unit("extraction.template_match_threshold", ex.template_match_threshold.into())?;
    check_unit("extraction.min_token_confidence", ex.min_token_confidence.into())?;
    check_unit("extraction.field_review_threshold", ex.field_review_threshold.into())?;
    let w = ex.weights;
    let total = w.ocr + w.proximity + w.format;
    if w.ocr < 0.0 || w.proximity < 0.0 || w.format < 0.0 || (total - 1.0).abs() > 1e-3 {
        return Err(invalid(format!(
            "extraction.weights must be non-negative and sum to 1, got {}",
            total
        )));
    }

    let c = &config.corrections;
    if c.min_frequency == 0 {
        return Err(invalid("corrections.min_frequency must be at least 1"));
    }
    check_unit("corrections.dominance", c.dominance.into())?;
    check_unit("corrections.near_match_similarity", c.near_match_similarity)?;
    check_unit("corrections.applied_confidence", c.applied_confidence.into())?;

    Ok(())
}
