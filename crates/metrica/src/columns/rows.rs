//! Grouping ledger lines into records.

use crate::tokenizer::median;

/// A gap this many times the median line pitch always starts a record.
const GAP_FACTOR: f32 = 1.8;

/// Vertical facts about one data line, in normalized page coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineInfo {
    pub center: f32,
    pub bottom: f32,
    /// The key column has text on this line.
    pub has_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroup {
    /// Indices into the line list, top to bottom.
    pub lines: Vec<usize>,
    /// Opens without a key value: the tail of a record from the previous page.
    pub continues_previous: bool,
}

pub fn median_pitch(lines: &[LineInfo]) -> f32 {
    median(lines.windows(2).map(|w| w[1].center - w[0].center).collect())
}

/// Splits lines into records. Horizontal rules are used when at least one
/// falls between data lines; otherwise a line continues the current record
/// unless it has a key value or follows a large vertical gap.
pub fn segment(lines: &[LineInfo], rule_lines: &[f32]) -> Vec<RowGroup> {
    if lines.is_empty() {
        return Vec::new();
    }
    let first = lines[0].center;
    let last = lines[lines.len() - 1].center;
    let separating: Vec<f32> = rule_lines
        .iter()
        .copied()
        .filter(|y| *y > first && *y < last)
        .collect();

    let mut groups: Vec<RowGroup> = Vec::new();
    if !separating.is_empty() {
        let mut current_cell = None;
        for (i, line) in lines.iter().enumerate() {
            let cell = separating.iter().filter(|y| **y < line.center).count();
            if current_cell == Some(cell) {
                if let Some(group) = groups.last_mut() {
                    group.lines.push(i);
                }
            } else {
                groups.push(RowGroup {
                    lines: vec![i],
                    continues_previous: false,
                });
                current_cell = Some(cell);
            }
        }
    } else {
        let pitch = median_pitch(lines);
        for (i, line) in lines.iter().enumerate() {
            let big_gap = i > 0 && pitch > 0.0 && line.center - lines[i - 1].center > GAP_FACTOR * pitch;
            if groups.is_empty() || line.has_key || big_gap {
                groups.push(RowGroup {
                    lines: vec![i],
                    continues_previous: false,
                });
            } else if let Some(group) = groups.last_mut() {
                group.lines.push(i);
            }
        }
    }

    if let Some(first_group) = groups.first_mut() {
        first_group.continues_previous = !lines[first_group.lines[0]].has_key;
    }
    groups
}
