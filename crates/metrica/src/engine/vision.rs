//! Remote document text detection over the `images:annotate` HTTP API.

use std::time::Duration;

use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{OcrEngine, RawOcrResult, RawWord};
use crate::error::{EngineError, PermanentKind, TransientKind};

pub const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

pub struct VisionEngine {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: SecretString,
    language_hints: Vec<String>,
}

impl VisionEngine {
    pub fn new(
        endpoint: Option<&str>,
        api_key: SecretString,
        language_hints: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                EngineError::permanent(
                    PermanentKind::InvalidRequest,
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or(DEFAULT_ENDPOINT).to_string(),
            api_key,
            language_hints,
        })
    }

    fn request_body(&self, image: &[u8]) -> serde_json::Value {
        json!({
            "requests": [{
                "image": { "content": base64::engine::general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": self.language_hints },
            }]
        })
    }
}

impl OcrEngine for VisionEngine {
    fn name(&self) -> &str {
        "vision"
    }

    fn recognize(&self, image: &[u8]) -> Result<RawOcrResult, EngineError> {
        let _span = tracing::info_span!("engine.vision", bytes = image.len()).entered();

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&self.request_body(image))
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(EngineError::from_status(status.as_u16(), &body));
        }
        parse_response(&body, self.name())
    }
}

fn map_transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::transient(TransientKind::Timeout, e.to_string())
    } else {
        EngineError::transient(TransientKind::Network, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    symbols: Vec<Symbol>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

// Zero coordinates are omitted from the wire format.
#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
}

/// Flattens an annotate response into word boxes.
pub(crate) fn parse_response(body: &str, engine: &str) -> Result<RawOcrResult, EngineError> {
    let parsed: AnnotateResponse = serde_json::from_str(body).map_err(|e| {
        EngineError::transient(
            TransientKind::Network,
            format!("malformed recognition response: {}", e),
        )
    })?;
    let Some(first) = parsed.responses.into_iter().next() else {
        return Ok(empty(engine));
    };
    if let Some(status) = first.error {
        // google.rpc codes: 3 INVALID_ARGUMENT, 7 PERMISSION_DENIED,
        // 8 RESOURCE_EXHAUSTED, 14 UNAVAILABLE, 16 UNAUTHENTICATED.
        return Err(match status.code {
            8 => EngineError::transient(TransientKind::RateLimited, status.message),
            14 | 13 | 4 => EngineError::transient(TransientKind::Server(503), status.message),
            7 | 16 => EngineError::permanent(PermanentKind::Auth, status.message),
            _ => EngineError::permanent(PermanentKind::BadImage, status.message),
        });
    }
    let Some(page) = first.full_text_annotation.and_then(|a| a.pages.into_iter().next()) else {
        return Ok(empty(engine));
    };

    let words = page
        .blocks
        .into_iter()
        .flat_map(|b| b.paragraphs)
        .flat_map(|p| p.words)
        .filter_map(|w| {
            let text: String = w.symbols.iter().map(|s| s.text.as_str()).collect();
            let vertices = w.bounding_box?.vertices;
            if text.trim().is_empty() || vertices.is_empty() {
                return None;
            }
            let min_x = vertices.iter().map(|v| v.x).fold(f32::INFINITY, f32::min);
            let min_y = vertices.iter().map(|v| v.y).fold(f32::INFINITY, f32::min);
            let max_x = vertices.iter().map(|v| v.x).fold(f32::NEG_INFINITY, f32::max);
            let max_y = vertices.iter().map(|v| v.y).fold(f32::NEG_INFINITY, f32::max);
            Some(RawWord {
                text,
                left: min_x,
                top: min_y,
                width: max_x - min_x,
                height: max_y - min_y,
                confidence: w.confidence,
            })
        })
        .collect();

    Ok(RawOcrResult {
        engine: engine.to_string(),
        width: page.width,
        height: page.height,
        words,
    })
}

fn empty(engine: &str) -> RawOcrResult {
    RawOcrResult {
        engine: engine.to_string(),
        width: 0,
        height: 0,
        words: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
      "responses": [{
        "fullTextAnnotation": {
          "pages": [{
            "width": 1000, "height": 1400,
            "blocks": [{
              "paragraphs": [{
                "words": [
                  {
                    "boundingBox": {"vertices": [{"x": 100, "y": 50}, {"x": 180, "y": 50}, {"x": 180, "y": 80}, {"x": 100, "y": 80}]},
                    "symbols": [{"text": "A"}, {"text": "n"}, {"text": "n"}, {"text": "a"}],
                    "confidence": 0.97
                  },
                  {
                    "boundingBox": {"vertices": [{"y": 50}, {"x": 40, "y": 50}, {"x": 40, "y": 80}, {"y": 80}]},
                    "symbols": [{"text": "1"}]
                  }
                ]
              }]
            }]
          }]
        }
      }]
    }"#;

    #[test]
    fn test_parse_words_and_boxes() {
        let result = parse_response(RESPONSE, "vision").unwrap();
        assert_eq!((result.width, result.height), (1000, 1400));
        assert_eq!(result.words.len(), 2);
        assert_eq!(result.words[0].text, "Anna");
        assert_eq!(result.words[0].left, 100.0);
        assert_eq!(result.words[0].width, 80.0);
        assert_eq!(result.words[0].confidence, Some(0.97));
        assert_eq!(result.words[1].left, 0.0);
        assert_eq!(result.words[1].confidence, None);
    }

    #[test]
    fn test_parse_error_status() {
        let body = r#"{"responses":[{"error":{"code":16,"message":"bad key"}}]}"#;
        let err = parse_response(body, "vision").unwrap_err();
        assert_eq!(err, EngineError::permanent(PermanentKind::Auth, "bad key"));

        let body = r#"{"responses":[{"error":{"code":8,"message":"quota"}}]}"#;
        assert!(parse_response(body, "vision").unwrap_err().is_transient());
    }

    #[test]
    fn test_parse_no_text() {
        let result = parse_response(r#"{"responses":[{}]}"#, "vision").unwrap();
        assert!(result.words.is_empty());
    }
}
