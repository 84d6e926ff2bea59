//! Recognition engines and the rate-limited, cached client around them.
//!
//! Every adapter normalizes its native output to [`RawOcrResult`], which is
//! the only shape the tokenizer understands.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub mod client;
pub mod rate_limit;
pub mod replay;
pub mod structure;
pub mod tesseract;
pub mod vision;

pub use client::{CallContext, OcrClient, Recognition, RetryPolicy};
pub use rate_limit::RateLimiter;
pub use replay::ReplayEngine;
pub use tesseract::TesseractEngine;
pub use vision::VisionEngine;

/// One recognized word in source-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWord {
    pub text: String,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    /// Engine confidence in `[0, 1]`, when the engine reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Engine-agnostic recognition output for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOcrResult {
    pub engine: String,
    pub width: u32,
    pub height: u32,
    pub words: Vec<RawWord>,
}

/// A text-detection backend. Implementations block the calling thread.
pub trait OcrEngine: Send + Sync {
    /// Stable identifier used for cache keys and usage logs.
    fn name(&self) -> &str;

    fn recognize(&self, image: &[u8]) -> Result<RawOcrResult, EngineError>;
}
