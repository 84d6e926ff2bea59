//! Text folding shared by keyword matching, anchors, headers and
//! correction lookups.

/// Lowercases and strips Greek tonos/dialytika so `Βάπτιση` matches
/// `βαπτιση`. Whitespace is collapsed to single spaces.
pub fn fold(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        for lower in c.to_lowercase() {
            out.push(strip_greek_accent(lower));
        }
    }
    out
}

fn strip_greek_accent(c: char) -> char {
    match c {
        'ά' => 'α',
        'έ' => 'ε',
        'ή' => 'η',
        'ί' | 'ϊ' | 'ΐ' => 'ι',
        'ό' => 'ο',
        'ύ' | 'ϋ' | 'ΰ' => 'υ',
        'ώ' => 'ω',
        'ς' => 'σ',
        other => other,
    }
}

/// [`fold`] plus removal of punctuation, for comparing field values.
pub fn normalize_value(s: &str) -> String {
    let stripped: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    fold(&stripped)
}

/// Folded text with leading and trailing punctuation removed, for matching
/// a single word such as `Name:` against a label.
pub fn fold_word(s: &str) -> String {
    fold(s.trim_matches(|c: char| !c.is_alphanumeric()))
}

/// Normalized Levenshtein similarity of two folded strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&fold(a), &fold(b))
}
