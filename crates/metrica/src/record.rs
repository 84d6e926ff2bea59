//! Record types, canonical field names and extracted candidates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geometry::BBox;
use crate::tokenizer::TokenizedPage;

/// Sacramental record kinds a page can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Baptism,
    Marriage,
    Funeral,
    Unknown,
}

impl RecordType {
    /// Types the classifier can positively identify.
    pub const KNOWN: [RecordType; 3] = [RecordType::Baptism, RecordType::Marriage, RecordType::Funeral];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Baptism => "baptism",
            RecordType::Marriage => "marriage",
            RecordType::Funeral => "funeral",
            RecordType::Unknown => "unknown",
        }
    }

    /// Fields that must be present for a record to be complete.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            RecordType::Baptism => &[fields::FULL_NAME, fields::BAPTISM_DATE],
            RecordType::Marriage => &[fields::GROOM_NAME, fields::BRIDE_NAME, fields::MARRIAGE_DATE],
            RecordType::Funeral => &[fields::DECEASED_NAME, fields::DEATH_DATE],
            RecordType::Unknown => &[],
        }
    }

    /// Every field a record of this type may carry.
    pub fn canonical_fields(&self) -> &'static [&'static str] {
        use fields::*;
        match self {
            RecordType::Baptism => &[
                RECORD_NUMBER,
                FULL_NAME,
                BIRTH_DATE,
                BAPTISM_DATE,
                BIRTHPLACE,
                PARENTS,
                SPONSORS,
                CLERGY,
                CHURCH,
                NOTES,
            ],
            RecordType::Marriage => &[
                RECORD_NUMBER,
                MARRIAGE_DATE,
                GROOM_NAME,
                GROOM_PARENTS,
                BRIDE_NAME,
                BRIDE_PARENTS,
                WITNESSES,
                CLERGY,
                CHURCH,
                LICENSE,
                NOTES,
            ],
            RecordType::Funeral => &[
                RECORD_NUMBER,
                DECEASED_NAME,
                BIRTH_DATE,
                DEATH_DATE,
                BURIAL_DATE,
                AGE_AT_DEATH,
                BURIAL_PLACE,
                CAUSE_OF_DEATH,
                CLERGY,
                CHURCH,
                NOTES,
            ],
            RecordType::Unknown => &[NOTES],
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baptism" => Ok(RecordType::Baptism),
            "marriage" => Ok(RecordType::Marriage),
            "funeral" => Ok(RecordType::Funeral),
            "unknown" => Ok(RecordType::Unknown),
            other => Err(format!("unknown record type '{}'", other)),
        }
    }
}

/// Canonical field names shared by templates, drafts and committed records.
pub mod fields {
    pub const RECORD_NUMBER: &str = "recordNumber";
    pub const FULL_NAME: &str = "fullName";
    pub const BIRTH_DATE: &str = "birthDate";
    pub const BAPTISM_DATE: &str = "baptismDate";
    pub const BIRTHPLACE: &str = "birthplace";
    pub const PARENTS: &str = "parents";
    pub const SPONSORS: &str = "sponsors";
    pub const CLERGY: &str = "clergy";
    pub const CHURCH: &str = "church";
    pub const MARRIAGE_DATE: &str = "marriageDate";
    pub const GROOM_NAME: &str = "groomName";
    pub const GROOM_PARENTS: &str = "groomParents";
    pub const BRIDE_NAME: &str = "brideName";
    pub const BRIDE_PARENTS: &str = "brideParents";
    pub const WITNESSES: &str = "witnesses";
    pub const LICENSE: &str = "license";
    pub const DECEASED_NAME: &str = "deceasedName";
    pub const DEATH_DATE: &str = "deathDate";
    pub const BURIAL_DATE: &str = "burialDate";
    pub const AGE_AT_DEATH: &str = "ageAtDeath";
    pub const BURIAL_PLACE: &str = "burialPlace";
    pub const CAUSE_OF_DEATH: &str = "causeOfDeath";
    pub const NOTES: &str = "notes";
}

/// Expected shape of a field's value, used for format conformance scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFormat {
    Name,
    NameList,
    Date,
    Number,
    Text,
}

impl FieldFormat {
    pub fn for_field(name: &str) -> FieldFormat {
        use fields::*;
        match name {
            FULL_NAME | GROOM_NAME | BRIDE_NAME | DECEASED_NAME | CLERGY => FieldFormat::Name,
            PARENTS | SPONSORS | WITNESSES | GROOM_PARENTS | BRIDE_PARENTS => FieldFormat::NameList,
            RECORD_NUMBER | AGE_AT_DEATH => FieldFormat::Number,
            n if n.ends_with("Date") => FieldFormat::Date,
            _ => FieldFormat::Text,
        }
    }
}

/// How a field value was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Anchor,
    Quadrant,
    Column,
    Correction,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    pub value: String,
    pub confidence: f32,
    pub needs_review: bool,
    pub method: ExtractionMethod,
    #[serde(default)]
    pub token_ids: Vec<u32>,
    /// Mean recognition confidence of the source tokens.
    pub ocr_confidence: f32,
    /// Anchor or column-band match quality.
    pub proximity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_from: Option<String>,
    /// Where on the page the value was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRegion>,
}

/// Page region a field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRegion {
    /// Union of the source token boxes, in image pixels.
    pub bbox: BBox,
    /// Token confidence weighted by token area.
    pub confidence: f32,
}

impl SourceRegion {
    /// `None` when none of `token_ids` is on the page.
    pub fn from_tokens(page: &TokenizedPage, token_ids: &[u32]) -> Option<Self> {
        let mut bbox: Option<BBox> = None;
        let (mut weighted, mut area) = (0.0_f32, 0.0_f32);
        for token in page.tokens.iter().filter(|t| token_ids.contains(&t.id)) {
            bbox = Some(bbox.map_or(token.bbox, |b| b.union(&token.bbox)));
            let a = token.bbox.area().max(1.0);
            weighted += token.confidence * a;
            area += a;
        }
        bbox.map(|bbox| SourceRegion {
            bbox,
            confidence: weighted / area,
        })
    }
}

impl FieldValue {
    pub fn extracted(
        value: String,
        method: ExtractionMethod,
        token_ids: Vec<u32>,
        ocr_confidence: f32,
        proximity: f32,
    ) -> Self {
        Self {
            value,
            confidence: 0.0,
            needs_review: false,
            method,
            token_ids,
            ocr_confidence: ocr_confidence.clamp(0.0, 1.0),
            proximity: proximity.clamp(0.0, 1.0),
            corrected_from: None,
            source: None,
        }
    }
}

/// Kinds of cross-field or format problems found on a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    MissingRequired,
    UnparseableDate,
    BirthAfterBaptism,
    DeathBeforeBirth,
    MarriageAfterDeath,
    BurialBeforeDeath,
    AgeMismatch,
    LowImageQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub code: ViolationCode,
    pub fields: Vec<String>,
    pub message: String,
}

/// One logical record extracted from one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCandidate {
    pub record_type: RecordType,
    pub fields: BTreeMap<String, FieldValue>,
    pub confidence: f32,
    pub needs_review: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// First ledger row on the page with no key-column value.
    #[serde(default)]
    pub continues_previous: bool,
    /// Last ledger row running into the bottom edge of the page.
    #[serde(default)]
    pub may_continue: bool,
    /// Table structure score of the page, for ledger rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_score: Option<f32>,
}

impl RecordCandidate {
    pub fn new(record_type: RecordType) -> Self {
        Self {
            record_type,
            fields: BTreeMap::new(),
            confidence: 0.0,
            needs_review: false,
            violations: Vec::new(),
            row_index: None,
            template_id: None,
            continues_previous: false,
            may_continue: false,
            structure_score: None,
        }
    }

    /// Locates every field's source tokens on `page`.
    pub fn attach_sources(&mut self, page: &TokenizedPage) {
        for field in self.fields.values_mut() {
            field.source = SourceRegion::from_tokens(page, &field.token_ids);
        }
    }

    /// Non-empty fields without a located source region.
    pub fn unsourced_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, f)| !f.value.trim().is_empty() && f.source.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|f| f.value.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// Appends the fields of a continuation fragment (the top of the next
    /// page) onto this record.
    pub fn absorb_continuation(&mut self, fragment: RecordCandidate) {
        for (name, part) in fragment.fields {
            match self.fields.get_mut(&name) {
                Some(existing) if !part.value.trim().is_empty() => {
                    if existing.value.trim().is_empty() {
                        existing.value = part.value;
                    } else {
                        existing.value = format!("{} {}", existing.value.trim_end(), part.value.trim());
                    }
                    existing.token_ids.extend(part.token_ids);
                    existing.ocr_confidence = existing.ocr_confidence.min(part.ocr_confidence);
                    existing.confidence = existing.confidence.min(part.confidence);
                    existing.needs_review = true;
                }
                Some(_) => {}
                None => {
                    let mut part = part;
                    part.needs_review = true;
                    self.fields.insert(name, part);
                }
            }
        }
        self.may_continue = fragment.may_continue;
        self.needs_review = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_round_trip_names() {
        for rt in RecordType::KNOWN {
            assert_eq!(rt.as_str().parse::<RecordType>().unwrap(), rt);
        }
        assert!("confirmation".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_required_fields_are_canonical() {
        for rt in RecordType::KNOWN {
            for field in rt.required_fields() {
                assert!(rt.canonical_fields().contains(field));
            }
        }
    }

    #[test]
    fn test_field_formats() {
        assert_eq!(FieldFormat::for_field(fields::BAPTISM_DATE), FieldFormat::Date);
        assert_eq!(FieldFormat::for_field(fields::GROOM_NAME), FieldFormat::Name);
        assert_eq!(FieldFormat::for_field(fields::SPONSORS), FieldFormat::NameList);
        assert_eq!(FieldFormat::for_field(fields::AGE_AT_DEATH), FieldFormat::Number);
        assert_eq!(FieldFormat::for_field(fields::CHURCH), FieldFormat::Text);
    }

    #[test]
    fn test_absorb_continuation_appends_text() {
        let mut head = RecordCandidate::new(RecordType::Marriage);
        head.fields.insert(
            fields::WITNESSES.to_string(),
            FieldValue::extracted("Ivan Petrov,".into(), ExtractionMethod::Column, vec![1], 0.9, 1.0),
        );
        let mut tail = RecordCandidate::new(RecordType::Marriage);
        tail.continues_previous = true;
        tail.fields.insert(
            fields::WITNESSES.to_string(),
            FieldValue::extracted("Anna Sidorova".into(), ExtractionMethod::Column, vec![7], 0.8, 1.0),
        );
        tail.fields.insert(
            fields::LICENSE.to_string(),
            FieldValue::extracted("L-12".into(), ExtractionMethod::Column, vec![8], 0.8, 1.0),
        );

        head.absorb_continuation(tail);
        assert_eq!(head.value(fields::WITNESSES), Some("Ivan Petrov, Anna Sidorova"));
        assert_eq!(head.value(fields::LICENSE), Some("L-12"));
        assert!(head.needs_review);
        assert_eq!(head.fields[fields::WITNESSES].token_ids, vec![1, 7]);
    }

    fn page(words: &[(u32, f32, f32, f32)]) -> TokenizedPage {
        use crate::tokenizer::{Script, Token};
        TokenizedPage {
            width: 1000,
            height: 1000,
            tokens: words
                .iter()
                .map(|&(id, x, w, confidence)| Token {
                    id,
                    text: format!("w{}", id),
                    bbox: BBox::new(x, 100.0, w, 20.0),
                    script: Script::Latin,
                    line: 0,
                    confidence,
                })
                .collect(),
            rule_lines: Vec::new(),
            detected_language: None,
        }
    }

    #[test]
    fn test_sources_cover_their_tokens() {
        let page = page(&[(1, 100.0, 100.0, 0.9), (2, 220.0, 300.0, 0.5), (3, 600.0, 50.0, 0.99)]);
        let mut c = RecordCandidate::new(RecordType::Baptism);
        c.fields.insert(
            fields::FULL_NAME.to_string(),
            FieldValue::extracted("Anna Petrova".into(), ExtractionMethod::Anchor, vec![1, 2], 0.7, 1.0),
        );
        c.fields.insert(
            fields::NOTES.to_string(),
            FieldValue::extracted("added by hand".into(), ExtractionMethod::Manual, Vec::new(), 1.0, 1.0),
        );
        c.attach_sources(&page);

        let source = c.fields[fields::FULL_NAME].source.unwrap();
        assert_eq!(source.bbox, BBox::new(100.0, 100.0, 420.0, 20.0));
        // The wider, less certain token dominates.
        assert!((source.confidence - 0.6).abs() < 1e-4, "{}", source.confidence);
        assert_eq!(c.unsourced_fields(), vec![fields::NOTES]);
    }
}
