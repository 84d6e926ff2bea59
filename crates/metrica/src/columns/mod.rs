//! Ledger pages: tokens are assigned to column bands, lines are grouped
//! into records, and each record becomes one candidate.
//!
//! Bands come from a column template when one matched, otherwise from
//! valleys in the horizontal token density with headers inferred from
//! captions.

use std::collections::BTreeMap;

use crate::config::ExtractionConfig;
use crate::layout::{ColumnBand, LayoutTemplate, TemplateKind};
use crate::record::{fields, ExtractionMethod, FieldValue, RecordCandidate, RecordType};
use crate::tokenizer::{Token, TokenizedPage};

pub mod headers;
pub mod rows;

use rows::{LineInfo, RowGroup};

const BINS: usize = 200;
/// A bin is occupied when more than this share of data lines cover it.
const OCCUPANCY: f32 = 0.10;
/// Narrower valleys are word spacing, not column separators.
const MIN_GAP: f32 = 0.02;
const MIN_COLUMN_WIDTH: f32 = 0.01;
/// Captions are looked for above this line when no header row is known.
const HEADER_REGION: f32 = 0.35;
/// Slack below a template's header row still treated as header.
const HEADER_SLACK: f32 = 0.03;
/// A record ending this close to the bottom edge may continue overleaf.
const BOTTOM_MARGIN: f32 = 0.04;
/// Proximity factor for tokens that fell outside every band.
const OUTSIDE_BAND: f32 = 0.5;

#[derive(Debug, Clone)]
struct Column {
    x0: f32,
    x1: f32,
    field: Option<String>,
    caption: String,
    /// Quality of the caption-to-field mapping.
    quality: f32,
}

impl Column {
    fn distance(&self, x: f32) -> f32 {
        if x < self.x0 {
            self.x0 - x
        } else if x > self.x1 {
            x - self.x1
        } else {
            0.0
        }
    }
}

fn nearest(columns: &[Column], x: f32) -> Option<usize> {
    columns
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.distance(x).total_cmp(&b.1.distance(x)))
        .map(|(i, _)| i)
}

#[derive(Debug, Clone)]
pub struct ColumnMapper {
    anchor_similarity: f64,
    min_token_confidence: f32,
}

impl ColumnMapper {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            anchor_similarity: config.anchor_similarity,
            min_token_confidence: config.min_token_confidence,
        }
    }

    /// Produces one candidate per ledger row, top to bottom.
    pub fn map_columns(
        &self,
        page: &TokenizedPage,
        record_type: RecordType,
        template: Option<&LayoutTemplate>,
    ) -> Vec<RecordCandidate> {
        let strategy = if template.is_some() { "columns" } else { "columns_auto" };
        let _span = tracing::info_span!("extract", strategy, record_type = %record_type).entered();

        let lines = page.lines();
        let height = page.height.max(1) as f32;
        let line_center = |line: &[Token]| {
            line.iter().map(|t| t.bbox.center_y()).sum::<f32>() / line.len() as f32 / height
        };

        let (columns, data): (Vec<Column>, Vec<&[Token]>) = match template.map(|t| &t.kind) {
            Some(TemplateKind::Columns { bands, header_y }) => {
                let limit = header_y.map_or(HEADER_REGION, |y| y + HEADER_SLACK);
                let header = self.find_header(page, &lines, record_type, limit, &line_center);
                let data = lines
                    .iter()
                    .enumerate()
                    .filter(|(i, line)| match header {
                        Some(h) => *i > h,
                        None => header_y.map_or(true, |y| line_center(&line[..]) > y),
                    })
                    .map(|(_, line)| *line)
                    .collect();
                (bands.iter().map(band_column).collect(), data)
            }
            _ => {
                let header = self.find_header(page, &lines, record_type, HEADER_REGION, &line_center);
                let data: Vec<&[Token]> = match header {
                    Some(h) => lines[h + 1..].to_vec(),
                    None => lines.clone(),
                };
                let bounds = detect_columns(page, &data);
                let header_line = header.map(|h| lines[h]).unwrap_or(&[]);
                (self.label_columns(page, &bounds, header_line, record_type), data)
            }
        };

        if columns.is_empty() || data.is_empty() {
            tracing::debug!("No ledger rows found");
            return Vec::new();
        }

        // Per data line, the tokens of each column.
        let cells: Vec<Vec<Vec<(&Token, f32)>>> = data
            .iter()
            .map(|line| {
                let mut row = vec![Vec::new(); columns.len()];
                for token in line.iter().filter(|t| t.confidence >= self.min_token_confidence) {
                    let x = page.norm(token).center().0;
                    if let Some(i) = nearest(&columns, x) {
                        let fit = if columns[i].distance(x) > 0.0 { OUTSIDE_BAND } else { 1.0 };
                        row[i].push((token, fit));
                    }
                }
                row
            })
            .collect();

        let key = key_column(&columns, &cells, record_type);
        let infos: Vec<LineInfo> = data
            .iter()
            .zip(&cells)
            .map(|(line, row)| LineInfo {
                center: line_center(&line[..]),
                bottom: line.iter().map(|t| t.bbox.bottom()).fold(0.0, f32::max) / height,
                has_key: !row[key].is_empty(),
            })
            .collect();
        let groups = rows::segment(&infos, &page.rule_lines);

        let template_id = template.map(|t| t.id.clone());
        let last = groups.len().saturating_sub(1);
        let candidates: Vec<RecordCandidate> = groups
            .iter()
            .enumerate()
            .filter_map(|(index, group)| {
                let mut candidate = build_candidate(record_type, &columns, &cells, group)?;
                candidate.row_index = Some(index as u32);
                candidate.template_id = template_id.clone();
                candidate.continues_previous = group.continues_previous;
                candidate.may_continue = index == last
                    && group
                        .lines
                        .last()
                        .is_some_and(|&l| infos[l].bottom >= 1.0 - BOTTOM_MARGIN);
                Some(candidate)
            })
            .collect();

        tracing::debug!(
            columns = columns.len(),
            lines = data.len(),
            records = candidates.len(),
            "Column mapping finished"
        );
        candidates
    }

    /// First line above `limit` naming at least two fields.
    fn find_header(
        &self,
        page: &TokenizedPage,
        lines: &[&[Token]],
        record_type: RecordType,
        limit: f32,
        line_center: &dyn Fn(&[Token]) -> f32,
    ) -> Option<usize> {
        lines
            .iter()
            .take_while(|line| line_center(&line[..]) <= limit)
            .position(|line| headers::header_hits(page, line, record_type, self.anchor_similarity) >= 2)
    }

    /// Maps detected columns to fields from the header tokens above them.
    /// Each header token goes to its nearest column, which splits merged
    /// captions across the columns they span.
    fn label_columns(
        &self,
        page: &TokenizedPage,
        bounds: &[(f32, f32)],
        header: &[Token],
        record_type: RecordType,
    ) -> Vec<Column> {
        let mut columns: Vec<Column> = bounds
            .iter()
            .map(|&(x0, x1)| Column {
                x0,
                x1,
                field: None,
                caption: String::new(),
                quality: 1.0,
            })
            .collect();

        let mut captions: Vec<Vec<&Token>> = vec![Vec::new(); columns.len()];
        for token in header {
            if let Some(i) = nearest(&columns, page.norm(token).center().0) {
                captions[i].push(token);
            }
        }

        for (column, tokens) in columns.iter_mut().zip(captions) {
            column.caption = tokens.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join(" ");
            let whole = headers::canonical_field(&column.caption, record_type, self.anchor_similarity);
            let best = whole.or_else(|| {
                tokens
                    .iter()
                    .filter_map(|t| headers::canonical_field(&t.text, record_type, self.anchor_similarity))
                    .max_by(|a, b| a.1.total_cmp(&b.1))
            });
            if let Some((field, similarity)) = best {
                column.field = Some(field.to_string());
                column.quality = similarity as f32;
            }
        }
        columns
    }
}

fn band_column(band: &ColumnBand) -> Column {
    Column {
        x0: band.x0,
        x1: band.x1,
        field: Some(band.field.clone()),
        caption: band.headers.first().cloned().unwrap_or_else(|| band.field.clone()),
        quality: 1.0,
    }
}

/// The column whose presence marks the start of a record: the record
/// number when the ledger has one, else the first required field, else
/// the leftmost column.
fn key_column(columns: &[Column], cells: &[Vec<Vec<(&Token, f32)>>], record_type: RecordType) -> usize {
    let used = |i: usize| cells.iter().any(|row| !row[i].is_empty());
    let find = |field: &str| {
        columns
            .iter()
            .position(|c| c.field.as_deref() == Some(field))
            .filter(|&i| used(i))
    };
    find(fields::RECORD_NUMBER)
        .or_else(|| record_type.required_fields().first().and_then(|f| find(*f)))
        .or_else(|| (0..columns.len()).find(|&i| used(i)))
        .unwrap_or(0)
}

fn build_candidate(
    record_type: RecordType,
    columns: &[Column],
    cells: &[Vec<Vec<(&Token, f32)>>],
    group: &RowGroup,
) -> Option<RecordCandidate> {
    let mut values: BTreeMap<String, Vec<(&Token, f32, f32)>> = BTreeMap::new();
    let mut notes: Vec<String> = Vec::new();
    let mut note_tokens: Vec<(&Token, f32, f32)> = Vec::new();

    for (i, column) in columns.iter().enumerate() {
        let tokens: Vec<(&Token, f32)> = group.lines.iter().flat_map(|&l| cells[l][i].iter().copied()).collect();
        if tokens.is_empty() {
            continue;
        }
        match &column.field {
            Some(field) => values
                .entry(field.clone())
                .or_default()
                .extend(tokens.into_iter().map(|(t, fit)| (t, fit, column.quality))),
            None => {
                let caption = if column.caption.is_empty() {
                    format!("Column {}", i + 1)
                } else {
                    column.caption.clone()
                };
                notes.push(format!("{}: {}", caption, join(tokens.iter().map(|(t, _)| *t))));
                note_tokens.extend(tokens.into_iter().map(|(t, fit)| (t, fit, OUTSIDE_BAND)));
            }
        }
    }

    if values.is_empty() && notes.is_empty() {
        return None;
    }

    let mut candidate = RecordCandidate::new(record_type);
    for (field, tokens) in values {
        candidate.fields.insert(field, field_value(join(tokens.iter().map(|(t, ..)| *t)), &tokens));
    }
    if !notes.is_empty() {
        candidate
            .fields
            .insert(fields::NOTES.to_string(), field_value(notes.join("; "), &note_tokens));
    }
    Some(candidate)
}

fn join<'a>(tokens: impl Iterator<Item = &'a Token>) -> String {
    tokens.map(|t| t.text.as_str()).collect::<Vec<_>>().join(" ")
}

fn field_value(value: String, tokens: &[(&Token, f32, f32)]) -> FieldValue {
    let n = tokens.len().max(1) as f32;
    let ocr = tokens.iter().map(|(t, ..)| t.confidence).sum::<f32>() / n;
    let proximity = tokens.iter().map(|(_, fit, quality)| fit * quality).sum::<f32>() / n;
    FieldValue::extracted(
        value,
        ExtractionMethod::Column,
        tokens.iter().map(|(t, ..)| t.id).collect(),
        ocr,
        proximity,
    )
}

/// Column bounds from valleys in the horizontal occupancy of data lines.
pub fn detect_columns(page: &TokenizedPage, lines: &[&[Token]]) -> Vec<(f32, f32)> {
    if lines.is_empty() {
        return Vec::new();
    }
    let bin = |x: f32| ((x.clamp(0.0, 1.0) * BINS as f32) as usize).min(BINS - 1);

    let mut counts = [0usize; BINS];
    for line in lines {
        let mut covered = [false; BINS];
        for token in line.iter() {
            let rect = page.norm(token);
            for b in bin(rect.x0)..=bin(rect.x1) {
                covered[b] = true;
            }
        }
        for (count, hit) in counts.iter_mut().zip(covered) {
            *count += hit as usize;
        }
    }

    let threshold = OCCUPANCY * lines.len() as f32;
    let occupied: Vec<bool> = counts.iter().map(|&c| c as f32 > threshold).collect();
    let (Some(first), Some(last)) = (
        occupied.iter().position(|&o| o),
        occupied.iter().rposition(|&o| o),
    ) else {
        return Vec::new();
    };

    let min_gap = (MIN_GAP * BINS as f32).ceil() as usize;
    let mut separators = Vec::new();
    let mut b = first;
    while b <= last {
        if occupied[b] {
            b += 1;
            continue;
        }
        let start = b;
        while b <= last && !occupied[b] {
            b += 1;
        }
        if b - start >= min_gap {
            separators.push((start + b) as f32 / 2.0 / BINS as f32);
        }
    }

    let mut edges = vec![0.0];
    edges.extend(separators);
    edges.push(1.0);
    // Drop the separator after any column narrower than the minimum.
    let mut i = 1;
    while i + 1 < edges.len() {
        if edges[i] - edges[i - 1] < MIN_COLUMN_WIDTH {
            edges.remove(i);
        } else {
            i += 1;
        }
    }
    edges.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawOcrResult, RawWord};
    use crate::layout::builtin;
    use crate::tokenizer::tokenize;

    /// Places each cell's words starting at the given x (pixels).
    fn ledger(rows: &[(f32, Vec<(f32, &str)>)]) -> TokenizedPage {
        let mut words = Vec::new();
        for (top, cells) in rows {
            for (left, text) in cells {
                let mut x = *left;
                for w in text.split_whitespace() {
                    let width = 9.0 * w.chars().count() as f32;
                    words.push(RawWord {
                        text: w.to_string(),
                        left: x,
                        top: *top,
                        width,
                        height: 16.0,
                        confidence: Some(0.92),
                    });
                    x += width + 6.0;
                }
            }
        }
        tokenize(
            &RawOcrResult {
                engine: "test".into(),
                width: 2000,
                height: 1400,
                words,
            },
            &[],
        )
    }

    fn mapper() -> ColumnMapper {
        ColumnMapper::new(&ExtractionConfig::default())
    }

    #[test]
    fn test_detect_columns_from_valleys() {
        let page = ledger(&[
            (100.0, vec![(100.0, "aaaa"), (600.0, "bbbb"), (1200.0, "cccc")]),
            (140.0, vec![(100.0, "aaaaaa"), (600.0, "bb"), (1200.0, "cccccc")]),
        ]);
        let lines = page.lines();
        let columns = detect_columns(&page, &lines);
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].0, 0.0);
        assert!(columns[0].1 > 0.08 && columns[0].1 < 0.3);
        assert!(columns[1].1 > 0.31 && columns[1].1 < 0.6);
        assert_eq!(columns[2].1, 1.0);
    }

    #[test]
    fn test_template_bands_with_wrapped_cell() {
        let template = builtin::marriage_ledger();
        let page = ledger(&[
            (
                400.0,
                vec![(60.0, "No"), (140.0, "Date"), (300.0, "Groom"), (720.0, "Bride"), (1320.0, "Witnesses")],
            ),
            (
                480.0,
                vec![(60.0, "1"), (140.0, "12.05.1912"), (300.0, "Ivan Petrov"), (720.0, "Anna Orlova"), (1320.0, "Pavel Sokolov,")],
            ),
            (505.0, vec![(1320.0, "Ilya Morozov")]),
            (
                560.0,
                vec![(60.0, "2"), (140.0, "19.05.1912"), (300.0, "Fyodor Lebedev"), (720.0, "Olga Kozlova")],
            ),
        ]);
        let records = mapper().map_columns(&page, RecordType::Marriage, Some(&template));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value(fields::GROOM_NAME), Some("Ivan Petrov"));
        assert_eq!(records[0].value(fields::WITNESSES), Some("Pavel Sokolov, Ilya Morozov"));
        assert_eq!(records[0].value(fields::MARRIAGE_DATE), Some("12.05.1912"));
        assert_eq!(records[1].value(fields::BRIDE_NAME), Some("Olga Kozlova"));
        assert_eq!(records[1].row_index, Some(1));
        assert_eq!(records[1].template_id.as_deref(), Some("marriage-ledger-v1"));
        assert!(!records[0].continues_previous);
        assert_eq!(records[0].fields[fields::GROOM_NAME].method, ExtractionMethod::Column);
    }

    #[test]
    fn test_auto_detection_with_headers_and_notes() {
        let page = ledger(&[
            (
                100.0,
                vec![(100.0, "Groom"), (600.0, "Bride"), (1100.0, "Remarks"), (1600.0, "Date")],
            ),
            (
                160.0,
                vec![(100.0, "Ivan Petrov"), (600.0, "Anna Orlova"), (1100.0, "by license"), (1600.0, "12.05.1912")],
            ),
            (
                220.0,
                vec![(100.0, "Fyodor Lebedev"), (600.0, "Olga Kozlova"), (1100.0, "banns"), (1600.0, "19.05.1912")],
            ),
        ]);
        let records = mapper().map_columns(&page, RecordType::Marriage, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value(fields::GROOM_NAME), Some("Ivan Petrov"));
        assert_eq!(records[0].value(fields::BRIDE_NAME), Some("Anna Orlova"));
        assert_eq!(records[0].value(fields::MARRIAGE_DATE), Some("12.05.1912"));
        assert_eq!(records[0].value(fields::NOTES), Some("Remarks: by license"));
        assert_eq!(records[1].value(fields::GROOM_NAME), Some("Fyodor Lebedev"));
        assert!(records[0].template_id.is_none());
    }

    #[test]
    fn test_merged_header_is_split_between_columns() {
        // One caption cell "Groom and Bride" spanning both name columns.
        let page = ledger(&[
            (100.0, vec![(100.0, "No"), (280.0, "Groom"), (400.0, "and"), (560.0, "Bride")]),
            (160.0, vec![(100.0, "1"), (300.0, "Ivan"), (600.0, "Anna")]),
            (220.0, vec![(100.0, "2"), (300.0, "Pavel"), (600.0, "Olga")]),
        ]);
        let records = mapper().map_columns(&page, RecordType::Marriage, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value(fields::GROOM_NAME), Some("Pavel"));
        assert_eq!(records[1].value(fields::BRIDE_NAME), Some("Olga"));
        assert_eq!(records[1].value(fields::RECORD_NUMBER), Some("2"));
    }

    #[test]
    fn test_page_break_flags() {
        let template = builtin::marriage_ledger();
        let page = ledger(&[
            (400.0, vec![(60.0, "No"), (300.0, "Groom"), (720.0, "Bride")]),
            (450.0, vec![(1320.0, "Ilya Morozov")]),
            (500.0, vec![(60.0, "7"), (300.0, "Ivan Petrov"), (720.0, "Anna Orlova")]),
            (1360.0, vec![(60.0, "8"), (300.0, "Fyodor Lebedev"), (720.0, "Olga")]),
        ]);
        let records = mapper().map_columns(&page, RecordType::Marriage, Some(&template));
        assert_eq!(records.len(), 3);
        assert!(records[0].continues_previous);
        assert_eq!(records[0].value(fields::WITNESSES), Some("Ilya Morozov"));
        assert!(!records[1].may_continue);
        assert!(records[2].may_continue);
    }
}
