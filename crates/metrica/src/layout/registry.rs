//! Template lookup: built-ins plus JSON templates from a directory.

use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::classifier::PageShape;
use crate::error::ConfigError;
use crate::record::RecordType;
use crate::tokenizer::{Token, TokenizedPage};

use super::{builtin, find_anchors, ExtractionStrategy, LayoutTemplate, TemplateKind, TemplateMatch};

/// Lines within this distance of a template's header row are searched
/// for column captions.
const HEADER_BAND: f32 = 0.06;
/// Without a known header row, captions are looked for in the top part.
const HEADER_REGION: f32 = 0.35;

#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: Vec<Arc<LayoutTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for template in builtin::all() {
            registry.insert(template);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, id: &str, tenant_id: &str) -> Option<Arc<LayoutTemplate>> {
        self.templates
            .iter()
            .filter(|t| t.id == id && t.visible_to(tenant_id))
            .max_by_key(|t| t.tenant_id.is_some())
            .cloned()
    }

    /// Adds a template. For the same id and owner the highest version wins.
    pub fn insert(&mut self, template: LayoutTemplate) -> bool {
        if let Some(existing) = self
            .templates
            .iter_mut()
            .find(|t| t.id == template.id && t.tenant_id == template.tenant_id)
        {
            if existing.version >= template.version {
                return false;
            }
            *existing = Arc::new(template);
            return true;
        }
        self.templates.push(Arc::new(template));
        true
    }

    /// Loads every `*.json` template below `dir`. Hidden files are skipped;
    /// an invalid file fails the whole load.
    pub fn load_directory(&mut self, dir: &Path) -> Result<usize, ConfigError> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let hidden = path
                .strip_prefix(dir)
                .map(|rel| {
                    rel.components()
                        .any(|c| c.as_os_str().to_str().is_some_and(|s| s.starts_with('.')))
                })
                .unwrap_or(false);
            if hidden {
                continue;
            }

            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            let template: LayoutTemplate =
                serde_json::from_str(&content).map_err(|e| ConfigError::InvalidTemplate {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            template.validate().map_err(|reason| ConfigError::InvalidTemplate {
                path: path.to_path_buf(),
                reason,
            })?;
            log::debug!("Loaded layout template {} v{}", template.id, template.version);
            if self.insert(template) {
                loaded += 1;
            }
        }
        log::info!("Loaded {} layout templates from {}", loaded, crate::sanitize::redact_path(dir));
        Ok(loaded)
    }

    /// Scores the page against every template of the wanted kind visible to
    /// the tenant. Tenant templates win ties over shared ones.
    pub fn best_match(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        columns: bool,
        page: &TokenizedPage,
        anchor_similarity: f64,
        threshold: f32,
    ) -> TemplateMatch {
        let mut best: Option<(Arc<LayoutTemplate>, f32)> = None;
        for template in self.templates.iter().filter(|t| {
            t.record_type == record_type && t.is_columns() == columns && t.visible_to(tenant_id)
        }) {
            let score = template_score(template, page, anchor_similarity);
            let better = match &best {
                None => true,
                Some((current, s)) => {
                    score > *s || (score == *s && template.tenant_id.is_some() && current.tenant_id.is_none())
                }
            };
            if better {
                best = Some((template.clone(), score));
            }
        }

        match best {
            Some((template, score)) if score >= threshold => TemplateMatch::Matched { template, score },
            best => TemplateMatch::Mismatch { best },
        }
    }

    /// Chooses the extraction strategy for a classified page. Returns
    /// `None` only when a single-record page has no layout template at all.
    pub fn select(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        shape: PageShape,
        page: &TokenizedPage,
        anchor_similarity: f64,
        threshold: f32,
    ) -> Option<ExtractionStrategy> {
        let columns = shape == PageShape::Tabular;
        let found = self.best_match(tenant_id, record_type, columns, page, anchor_similarity, threshold);
        let strategy = match (columns, found) {
            (true, TemplateMatch::Matched { template, .. }) => ExtractionStrategy::Columns {
                template: Some(template),
            },
            (true, TemplateMatch::Mismatch { .. }) => ExtractionStrategy::Columns { template: None },
            (false, TemplateMatch::Matched { template, .. }) => ExtractionStrategy::Layout {
                template,
                mismatch: false,
            },
            (false, TemplateMatch::Mismatch { best }) => ExtractionStrategy::Layout {
                template: best?.0,
                mismatch: true,
            },
        };
        tracing::debug!(strategy = strategy.name(), template = ?strategy.template_id(), "Selected extraction strategy");
        Some(strategy)
    }
}

/// Fraction of fields whose anchor is present, or of column bands whose
/// caption appears in the header area.
fn template_score(template: &LayoutTemplate, page: &TokenizedPage, anchor_similarity: f64) -> f32 {
    match &template.kind {
        TemplateKind::Layout { fields } => {
            let lines = page.lines();
            let found = fields
                .iter()
                .filter(|spec| {
                    spec.anchors
                        .iter()
                        .any(|a| !find_anchors(page, &lines, a, anchor_similarity).is_empty())
                })
                .count();
            found as f32 / fields.len().max(1) as f32
        }
        TemplateKind::Columns { bands, header_y } => {
            let height = page.height.max(1) as f32;
            let in_header = |line: &&[Token]| {
                let cy = line.iter().map(|t| t.bbox.center_y()).sum::<f32>() / line.len() as f32 / height;
                match header_y {
                    Some(y) => (cy - y).abs() <= HEADER_BAND,
                    None => cy <= HEADER_REGION,
                }
            };
            let lines: Vec<&[Token]> = page.lines().into_iter().filter(in_header).collect();
            let found = bands
                .iter()
                .filter(|band| {
                    band.headers
                        .iter()
                        .any(|h| !find_anchors(page, &lines, h, anchor_similarity).is_empty())
                })
                .count();
            found as f32 / bands.len().max(1) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawOcrResult, RawWord};
    use crate::tokenizer::tokenize;
    use tempfile::TempDir;

    fn page(lines: &[(&str, f32)]) -> TokenizedPage {
        let mut words = Vec::new();
        for (text, top) in lines {
            let mut x = 50.0;
            for w in text.split_whitespace() {
                let width = 12.0 * w.chars().count() as f32;
                words.push(RawWord {
                    text: w.to_string(),
                    left: x,
                    top: *top,
                    width,
                    height: 20.0,
                    confidence: Some(0.9),
                });
                x += width + 10.0;
            }
        }
        tokenize(
            &RawOcrResult {
                engine: "test".into(),
                width: 1000,
                height: 1400,
                words,
            },
            &[],
        )
    }

    fn tenant_template(version: u32) -> LayoutTemplate {
        let mut t = builtin::baptism_certificate();
        t.tenant_id = Some("st-olga".into());
        t.version = version;
        t
    }

    #[test]
    fn test_highest_version_wins() {
        let mut registry = TemplateRegistry::with_builtins();
        let before = registry.len();
        assert!(registry.insert(tenant_template(2)));
        assert!(!registry.insert(tenant_template(1)));
        assert!(registry.insert(tenant_template(3)));
        assert_eq!(registry.len(), before + 1);
        assert_eq!(registry.get("baptism-certificate-v1", "st-olga").unwrap().version, 3);
        assert_eq!(registry.get("baptism-certificate-v1", "other").unwrap().version, 1);
    }

    #[test]
    fn test_select_layout_and_mismatch() {
        let registry = TemplateRegistry::with_builtins();
        let good = page(&[
            ("Name: Anna Petrova", 100.0),
            ("Date of Birth: 3 March 1911", 160.0),
            ("Date of Baptism: 12 March 1911", 220.0),
            ("Sponsors: Ivan Sidorov", 280.0),
            ("Priest: Fr. Ioann", 340.0),
        ]);
        let strategy = registry
            .select("t", RecordType::Baptism, PageShape::SingleRecord, &good, 0.8, 0.5)
            .unwrap();
        assert!(matches!(strategy, ExtractionStrategy::Layout { mismatch: false, .. }));
        assert_eq!(strategy.template_id(), Some("baptism-certificate-v1"));

        let poor = page(&[("Anna Petrova 1911", 100.0)]);
        let strategy = registry
            .select("t", RecordType::Baptism, PageShape::SingleRecord, &poor, 0.8, 0.5)
            .unwrap();
        assert!(matches!(strategy, ExtractionStrategy::Layout { mismatch: true, .. }));
    }

    #[test]
    fn test_select_columns() {
        let registry = TemplateRegistry::with_builtins();
        let ledger = page(&[("No Date Groom Bride Clergy Witnesses License", 413.0)]);
        let strategy = registry
            .select("t", RecordType::Marriage, PageShape::Tabular, &ledger, 0.8, 0.5)
            .unwrap();
        assert_eq!(strategy.name(), "columns");

        let unknown = page(&[("Nr Jahr Name", 50.0)]);
        let strategy = registry
            .select("t", RecordType::Marriage, PageShape::Tabular, &unknown, 0.8, 0.5)
            .unwrap();
        assert_eq!(strategy.name(), "columns_auto");
    }

    #[test]
    fn test_load_directory() {
        let dir = TempDir::new().unwrap();
        let json = serde_json::to_string(&tenant_template(5)).unwrap();
        std::fs::write(dir.path().join("olga.json"), json).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join(".drafts")).unwrap();
        std::fs::write(dir.path().join(".drafts/broken.json"), "{").unwrap();

        let mut registry = TemplateRegistry::with_builtins();
        assert_eq!(registry.load_directory(dir.path()).unwrap(), 1);
        assert_eq!(registry.get("baptism-certificate-v1", "st-olga").unwrap().version, 5);

        std::fs::write(dir.path().join("bad.json"), r#"{"id":"x"}"#).unwrap();
        let err = TemplateRegistry::new().load_directory(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTemplate { .. }));
    }
}
