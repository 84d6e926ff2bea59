use crate::config::{Config, ExtractionConfig, PreprocessConfig};

/// The slice of [`Config`] a page pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub extraction: ExtractionConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preprocess: config.preprocess.clone(),
            extraction: config.extraction.clone(),
        }
    }
}
