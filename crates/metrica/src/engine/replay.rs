use std::collections::HashMap;
use std::path::PathBuf;

use super::{OcrEngine, RawOcrResult};
use crate::error::{EngineError, PermanentKind};
use crate::storage::content_hash;

/// Serves previously captured recognition results keyed by the SHA-256 of
/// the image, so extraction can be re-run without calling a billed engine.
pub struct ReplayEngine {
    source: ReplaySource,
}

enum ReplaySource {
    Directory(PathBuf),
    Memory(HashMap<String, RawOcrResult>),
}

impl ReplayEngine {
    /// Reads `<dir>/<sha256>.json` for each image.
    pub fn from_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: ReplaySource::Directory(dir.into()),
        }
    }

    /// Results keyed by image content hash.
    pub fn from_results(results: HashMap<String, RawOcrResult>) -> Self {
        Self {
            source: ReplaySource::Memory(results),
        }
    }
}

impl OcrEngine for ReplayEngine {
    fn name(&self) -> &str {
        "replay"
    }

    fn recognize(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        let hash = content_hash(image);
        let missing = || {
            EngineError::permanent(
                PermanentKind::InvalidRequest,
                format!("no recorded result for image {}", crate::sanitize::short_hash(&hash)),
            )
        };
        match &self.source {
            ReplaySource::Memory(results) => results.get(&hash).cloned().ok_or_else(missing),
            ReplaySource::Directory(dir) => {
                let path = dir.join(format!("{}.json", hash));
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
                    Err(e) => {
                        return Err(EngineError::permanent(
                            PermanentKind::InvalidRequest,
                            format!("failed to read recorded result: {}", e),
                        ))
                    }
                };
                serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::permanent(
                        PermanentKind::InvalidRequest,
                        format!("recorded result is not valid JSON: {}", e),
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RawWord;
    use tempfile::TempDir;

    fn sample() -> RawOcrResult {
        RawOcrResult {
            engine: "vision".to_string(),
            width: 100,
            height: 50,
            words: vec![RawWord {
                text: "Certificate".to_string(),
                left: 1.0,
                top: 2.0,
                width: 30.0,
                height: 8.0,
                confidence: Some(0.9),
            }],
        }
    }

    #[test]
    fn test_replay_from_directory() {
        let dir = TempDir::new().unwrap();
        let image = b"page-one";
        std::fs::write(
            dir.path().join(format!("{}.json", content_hash(image))),
            serde_json::to_vec(&sample()).unwrap(),
        )
        .unwrap();

        let engine = ReplayEngine::from_directory(dir.path());
        assert_eq!(engine.recognize(image).unwrap(), sample());
        assert!(!engine.recognize(b"other").unwrap_err().is_transient());
    }

    #[test]
    fn test_replay_from_memory() {
        let mut results = HashMap::new();
        results.insert(content_hash(b"img"), sample());
        let engine = ReplayEngine::from_results(results);
        assert_eq!(engine.recognize(b"img").unwrap().words.len(), 1);
    }
}
