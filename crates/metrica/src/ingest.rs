//! Turns uploaded files into page images stored as upload artifacts.
//!
//! Images become one page each. PDFs are split into one page per PDF page:
//! the count comes from `lopdf`, rendering from poppler's `pdftoppm`.
//! With spread splitting on, a two-page spread becomes `#L` and `#R` pages.
//! Anything else is rejected before a job exists.

use std::io::Cursor;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat};

use crate::error::IngestError;
use crate::preprocess::spread;
use crate::queue::NewPage;
use crate::sanitize::redact_name;
use crate::storage::{ArtifactKind, ArtifactStore};

/// A named byte buffer submitted by a client.
#[derive(Debug, Clone)]
pub struct SubmittedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl SubmittedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Pdf,
}

/// Identifies a file from its leading bytes.
pub fn sniff(bytes: &[u8]) -> Option<FileKind> {
    const IMAGE_MAGIC: &[&[u8]] = &[
        b"\x89PNG\r\n\x1a\n",
        b"\xff\xd8\xff",
        b"GIF87a",
        b"GIF89a",
        b"BM",
        b"II*\0",
        b"MM\0*",
    ];
    if bytes.starts_with(b"%PDF-") {
        return Some(FileKind::Pdf);
    }
    if IMAGE_MAGIC.iter().any(|magic| bytes.starts_with(magic)) {
        return Some(FileKind::Image);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(FileKind::Image);
    }
    None
}

/// Magic bytes decide; the filename's MIME type is the fallback for
/// formats without a reliable signature.
pub fn detect(file: &SubmittedFile) -> Result<FileKind, IngestError> {
    let mime = mime_guess::from_path(&file.filename).first_or_octet_stream();
    if let Some(kind) = sniff(&file.bytes) {
        return Ok(kind);
    }
    const IMAGE_TYPES: [&str; 6] = [
        "image/png",
        "image/jpeg",
        "image/gif",
        "image/bmp",
        "image/tiff",
        "image/webp",
    ];
    if IMAGE_TYPES.contains(&mime.essence_str()) && !file.bytes.is_empty() {
        return Ok(FileKind::Image);
    }
    Err(IngestError::UnsupportedFile {
        filename: redact_name(&file.filename),
        mime: mime.essence_str().to_string(),
    })
}

/// Number of pages in a PDF document.
pub fn pdf_page_count(bytes: &[u8]) -> Result<usize, String> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| e.to_string())?;
    Ok(doc.get_pages().len())
}

/// Rasterizes single PDF pages.
pub trait PdfRenderer: Send + Sync {
    fn render_page(&self, pdf: &[u8], page: u32, dpi: u32) -> Result<Vec<u8>, String>;
}

/// Renders with the `pdftoppm` binary from poppler-utils.
pub struct PopplerRenderer;

impl PdfRenderer for PopplerRenderer {
    fn render_page(&self, pdf: &[u8], page: u32, dpi: u32) -> Result<Vec<u8>, String> {
        let temp_dir = std::env::temp_dir();
        let pdf_path = temp_dir.join(format!("metrica_{}.pdf", uuid::Uuid::new_v4()));
        let prefix = temp_dir.join(format!("metrica_page_{}", uuid::Uuid::new_v4()));
        std::fs::write(&pdf_path, pdf).map_err(|e| format!("Failed to write temp PDF: {}", e))?;

        let page_arg = page.to_string();
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg(&pdf_path)
            .arg(&prefix)
            .output();
        let _ = std::fs::remove_file(&pdf_path);
        let output = output.map_err(|e| {
            format!("Failed to run pdftoppm: {}. Make sure poppler-utils is installed.", e)
        })?;
        if !output.status.success() {
            return Err(format!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        // pdftoppm pads the page suffix to the width of the page count.
        let prefix = prefix.display().to_string();
        let rendered = [
            format!("{}-{}.png", prefix, page),
            format!("{}-{:02}.png", prefix, page),
            format!("{}-{:03}.png", prefix, page),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| "rendered page image not found".to_string())?;

        let bytes = std::fs::read(&rendered).map_err(|e| format!("Failed to read rendered page: {}", e));
        let _ = std::fs::remove_file(&rendered);
        bytes
    }
}

/// A single page ready to be stored.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct Ingestor {
    renderer: Arc<dyn PdfRenderer>,
    pdf_dpi: u32,
    split_spreads: bool,
}

impl Ingestor {
    pub fn new(pdf_dpi: u32) -> Self {
        Self::with_renderer(Arc::new(PopplerRenderer), pdf_dpi)
    }

    pub fn with_renderer(renderer: Arc<dyn PdfRenderer>, pdf_dpi: u32) -> Self {
        Self {
            renderer,
            pdf_dpi,
            split_spreads: false,
        }
    }

    pub fn with_spread_split(mut self, enabled: bool) -> Self {
        self.split_spreads = enabled;
        self
    }

    /// Splits the submission into pages in upload order. Fails on the first
    /// unsupported or unreadable file.
    pub fn split(&self, files: &[SubmittedFile]) -> Result<Vec<PageImage>, IngestError> {
        if files.is_empty() {
            return Err(IngestError::Empty);
        }
        let mut pages = Vec::new();
        for file in files {
            let split = match detect(file)? {
                FileKind::Image => vec![PageImage {
                    filename: file.filename.clone(),
                    bytes: file.bytes.clone(),
                }],
                FileKind::Pdf => self.split_pdf(file)?,
            };
            for page in split {
                pages.extend(self.split_spread(page));
            }
        }
        Ok(pages)
    }

    fn split_pdf(&self, file: &SubmittedFile) -> Result<Vec<PageImage>, IngestError> {
        let pdf_error = |reason: String| IngestError::PdfSplit {
            filename: redact_name(&file.filename),
            reason,
        };
        let count = pdf_page_count(&file.bytes).map_err(pdf_error)?;
        if count == 0 {
            return Err(pdf_error("document has no pages".to_string()));
        }
        let _span = tracing::info_span!("split_pdf", file = %redact_name(&file.filename), pages = count).entered();

        (1..=count as u32)
            .map(|page| {
                let bytes = self
                    .renderer
                    .render_page(&file.bytes, page, self.pdf_dpi)
                    .map_err(pdf_error)?;
                Ok(PageImage {
                    filename: format!("{}#{}", file.filename, page),
                    bytes,
                })
            })
            .collect()
    }

    /// Replaces a spread with its two pages. Pages that cannot be decoded
    /// pass through untouched; preprocessing reports them later.
    fn split_spread(&self, page: PageImage) -> Vec<PageImage> {
        if !self.split_spreads {
            return vec![page];
        }
        let Ok(img) = image::load_from_memory(&page.bytes) else {
            return vec![page];
        };
        let Some((left, right, split)) = spread::split_spread(&img) else {
            return vec![page];
        };
        match (encode_png(&left), encode_png(&right)) {
            (Ok(left), Ok(right)) => {
                tracing::info!(
                    file = %redact_name(&page.filename),
                    split_x = split.split_x,
                    confidence = split.confidence,
                    "Split two-page spread"
                );
                vec![
                    PageImage {
                        filename: format!("{}#L", page.filename),
                        bytes: left,
                    },
                    PageImage {
                        filename: format!("{}#R", page.filename),
                        bytes: right,
                    },
                ]
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to encode spread halves, keeping the spread: {}", e);
                vec![page]
            }
        }
    }

    /// Splits and stores every page as an upload artifact.
    pub fn stage(&self, artifacts: &ArtifactStore, files: &[SubmittedFile]) -> Result<Vec<NewPage>, IngestError> {
        self.split(files)?
            .into_iter()
            .map(|page| {
                let source_ref = artifacts.put(ArtifactKind::Upload, &page.bytes)?;
                Ok(NewPage {
                    filename: page.filename,
                    source_ref,
                })
            })
            .collect()
    }
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
