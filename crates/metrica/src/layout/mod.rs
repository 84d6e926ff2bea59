//! Layout templates and the extraction strategy chosen for a page.
//!
//! A template either describes anchor phrases with search zones (one
//! record per page) or fixed column bands (ledger pages). Templates are
//! versioned and may belong to one tenant or be shared.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geometry::NormRect;
use crate::record::RecordType;

pub mod builtin;
pub mod extractor;
pub mod registry;

pub use extractor::{find_anchors, AnchorHit, LayoutExtractor};
pub use registry::TemplateRegistry;

/// Where a field's value is searched for, relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Zone {
    /// Same line, to the right of the anchor.
    Right { max_width: f32, pad: f32 },
    /// Under the anchor, starting at its left edge.
    Below { height: f32, width: f32, pad: f32 },
    /// Fixed rectangle on the page, ignoring the anchor position.
    Absolute { rect: NormRect },
}

impl Zone {
    /// Search rectangle for an anchor found at `anchor`, clamped to the page.
    pub fn resolve(&self, anchor: &NormRect) -> NormRect {
        let rect = match *self {
            Zone::Right { max_width, pad } => NormRect::new(
                anchor.x1,
                anchor.y0 - pad,
                anchor.x1 + max_width,
                anchor.y1 + pad,
            ),
            Zone::Below { height, width, pad } => NormRect::new(
                anchor.x0 - pad,
                anchor.y1,
                anchor.x0 + width,
                anchor.y1 + height,
            ),
            Zone::Absolute { rect } => rect,
        };
        rect.clamped()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: String,
    pub anchors: Vec<String>,
    pub zone: Zone,
}

/// X-range of one ledger column, in normalized page coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnBand {
    pub field: String,
    pub x0: f32,
    pub x1: f32,
    /// Header captions printed above the column.
    #[serde(default)]
    pub headers: Vec<String>,
}

impl ColumnBand {
    pub fn contains(&self, x: f32) -> bool {
        x >= self.x0 && x < self.x1
    }

    pub fn center(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TemplateKind {
    Layout {
        fields: Vec<FieldSpec>,
    },
    Columns {
        bands: Vec<ColumnBand>,
        /// Normalized y of the header row, when the format prints one.
        #[serde(default)]
        header_y: Option<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutTemplate {
    pub id: String,
    pub version: u32,
    /// `None` for templates shared by every tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub record_type: RecordType,
    #[serde(flatten)]
    pub kind: TemplateKind,
}

impl LayoutTemplate {
    pub fn is_columns(&self) -> bool {
        matches!(self.kind, TemplateKind::Columns { .. })
    }

    pub fn visible_to(&self, tenant_id: &str) -> bool {
        self.tenant_id.as_deref().map_or(true, |t| t == tenant_id)
    }

    /// Structural checks for templates loaded from disk.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("template id is empty".to_string());
        }
        if self.record_type == RecordType::Unknown {
            return Err("record_type must be baptism, marriage or funeral".to_string());
        }
        let canonical = self.record_type.canonical_fields();
        let check_field = |field: &str| {
            if canonical.contains(&field) {
                Ok(())
            } else {
                Err(format!("'{}' is not a {} field", field, self.record_type))
            }
        };
        match &self.kind {
            TemplateKind::Layout { fields } => {
                if fields.is_empty() {
                    return Err("layout template has no fields".to_string());
                }
                for spec in fields {
                    check_field(&spec.field)?;
                    if spec.anchors.iter().all(|a| a.trim().is_empty()) {
                        return Err(format!("field '{}' has no anchor phrases", spec.field));
                    }
                }
            }
            TemplateKind::Columns { bands, header_y } => {
                if bands.is_empty() {
                    return Err("column template has no bands".to_string());
                }
                for band in bands {
                    check_field(&band.field)?;
                    if !(0.0..=1.0).contains(&band.x0) || !(0.0..=1.0).contains(&band.x1) || band.x0 >= band.x1
                    {
                        return Err(format!("band '{}' has an invalid x-range", band.field));
                    }
                }
                if header_y.is_some_and(|y| !(0.0..=1.0).contains(&y)) {
                    return Err("header_y must be within [0, 1]".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Outcome of scoring a page against the available templates. A mismatch
/// is not an error: it selects the quadrant fallback.
#[derive(Debug, Clone)]
pub enum TemplateMatch {
    Matched { template: Arc<LayoutTemplate>, score: f32 },
    Mismatch { best: Option<(Arc<LayoutTemplate>, f32)> },
}

/// How a classified page is turned into candidates. Chosen once per page.
#[derive(Debug, Clone)]
pub enum ExtractionStrategy {
    Layout {
        template: Arc<LayoutTemplate>,
        /// No template scored above the threshold; extraction leans on
        /// quadrant heuristics and the record always goes to review.
        mismatch: bool,
    },
    Columns {
        /// `None` selects auto-detected bands and inferred headers.
        template: Option<Arc<LayoutTemplate>>,
    },
}

impl ExtractionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ExtractionStrategy::Layout { mismatch: false, .. } => "layout",
            ExtractionStrategy::Layout { mismatch: true, .. } => "layout_fallback",
            ExtractionStrategy::Columns { template: Some(_) } => "columns",
            ExtractionStrategy::Columns { template: None } => "columns_auto",
        }
    }

    pub fn template_id(&self) -> Option<&str> {
        match self {
            ExtractionStrategy::Layout { template, .. } => Some(&template.id),
            ExtractionStrategy::Columns { template } => template.as_deref().map(|t| t.id.as_str()),
        }
    }
}
