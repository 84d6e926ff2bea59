//! Lenient date parsing for handwritten and typed register entries.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::text::fold;

static RE_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").unwrap());
static RE_NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})\s*([./-])\s*(\d{1,2})\s*[./-]\s*(\d{2}|\d{4})$").unwrap()
});
static RE_ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d{1,2})(st|nd|rd|th)$").unwrap());

/// Month names, folded. English full names and abbreviations, Russian
/// genitive and nominative, Greek genitive and nominative.
const MONTHS: [&[&str]; 12] = [
    &["january", "jan", "января", "январь", "ιανουαριου", "ιανουαριοσ"],
    &["february", "feb", "февраля", "февраль", "φεβρουαριου", "φεβρουαριοσ"],
    &["march", "mar", "марта", "март", "μαρτιου", "μαρτιοσ"],
    &["april", "apr", "апреля", "апрель", "απριλιου", "απριλιοσ"],
    &["may", "мая", "май", "μαιου", "μαιοσ"],
    &["june", "jun", "июня", "июнь", "ιουνιου", "ιουνιοσ"],
    &["july", "jul", "июля", "июль", "ιουλιου", "ιουλιοσ"],
    &["august", "aug", "августа", "август", "αυγουστου", "αυγουστοσ"],
    &["september", "sep", "sept", "сентября", "сентябрь", "σεπτεμβριου", "σεπτεμβριοσ"],
    &["october", "oct", "октября", "октябрь", "οκτωβριου", "οκτωβριοσ"],
    &["november", "nov", "ноября", "ноябрь", "νοεμβριου", "νοεμβριοσ"],
    &["december", "dec", "декабря", "декабрь", "δεκεμβριου", "δεκεμβριοσ"],
];

fn month_number(word: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|names| names.contains(&word))
        .map(|i| i as u32 + 1)
}

fn full_year(y: i32, digits: usize) -> i32 {
    if digits == 2 {
        1900 + y
    } else {
        y
    }
}

/// Parses ISO, `m/d/y` (then `d/m/y`), `d.m.y`, `d-m-y` and month-name
/// forms. Two-digit years are read as 19xx.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim().trim_end_matches(|c: char| c == '.' || c == ',' || c == ';');
    if s.is_empty() {
        return None;
    }

    if let Some(c) = RE_ISO.captures(s) {
        return NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
    }

    if let Some(c) = RE_NUMERIC.captures(s) {
        let a: u32 = c[1].parse().ok()?;
        let b: u32 = c[3].parse().ok()?;
        let year = full_year(c[4].parse().ok()?, c[4].len());
        return if &c[2] == "/" {
            NaiveDate::from_ymd_opt(year, a, b).or_else(|| NaiveDate::from_ymd_opt(year, b, a))
        } else {
            NaiveDate::from_ymd_opt(year, b, a)
        };
    }

    parse_named(s)
}

fn parse_named(s: &str) -> Option<NaiveDate> {
    let folded = fold(s);
    let mut day = None;
    let mut month = None;
    let mut year = None;
    for raw in folded.split(|c: char| c.is_whitespace() || c == ',' || c == '.') {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            continue;
        }
        if let Some(m) = month_number(word) {
            month = month.or(Some(m));
            continue;
        }
        let digits = RE_ORDINAL
            .captures(word)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| word.to_string());
        if let Ok(n) = digits.parse::<i32>() {
            if digits.len() == 4 && year.is_none() {
                year = Some(n);
            } else if (1..=31).contains(&n) && day.is_none() {
                day = Some(n as u32);
            } else if digits.len() == 2 && year.is_none() {
                year = Some(full_year(n, 2));
            }
        }
    }
    NaiveDate::from_ymd_opt(year?, month?, day?)
}

/// First integer in a value such as `45`, `45 years` or `45 лет`.
pub fn parse_age(input: &str) -> Option<u32> {
    input
        .split(|c: char| !c.is_ascii_digit())
        .find(|part| !part.is_empty())
        .and_then(|part| part.parse().ok())
}

/// Whole years between two dates.
pub fn years_between(from: NaiveDate, to: NaiveDate) -> i32 {
    use chrono::Datelike;
    let mut years = to.year() - from.year();
    if (to.month(), to.day()) < (from.month(), from.day()) {
        years -= 1;
    }
    years
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, day)
    }

    #[test]
    fn test_numeric_forms() {
        assert_eq!(parse_date("1911-03-12"), d(1911, 3, 12));
        assert_eq!(parse_date("12.03.1911"), d(1911, 3, 12));
        assert_eq!(parse_date("12-03-1911"), d(1911, 3, 12));
        assert_eq!(parse_date("03/12/1911"), d(1911, 3, 12));
        // Month 25 is impossible, so the d/m/y reading applies.
        assert_eq!(parse_date("25/03/1911"), d(1911, 3, 25));
        assert_eq!(parse_date("12.03.11"), d(1911, 3, 12));
    }

    #[test]
    fn test_month_names() {
        assert_eq!(parse_date("12 March 1911"), d(1911, 3, 12));
        assert_eq!(parse_date("March 12th, 1911"), d(1911, 3, 12));
        assert_eq!(parse_date("12 марта 1911 г."), d(1911, 3, 12));
        assert_eq!(parse_date("12 Μαρτίου 1911"), d(1911, 3, 12));
        assert_eq!(parse_date("1 Sept 1905"), d(1905, 9, 1));
    }

    #[test]
    fn test_rejects_non_dates() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("Anna Petrova"), None);
        assert_eq!(parse_date("31.02.1911"), None);
        assert_eq!(parse_date("March 1911"), None);
    }

    #[test]
    fn test_age_and_years() {
        assert_eq!(parse_age("45 лет"), Some(45));
        assert_eq!(parse_age("about 7 years"), Some(7));
        assert_eq!(parse_age("infant"), None);
        assert_eq!(years_between(d(1850, 6, 1).unwrap(), d(1911, 5, 31).unwrap()), 60);
        assert_eq!(years_between(d(1850, 6, 1).unwrap(), d(1911, 6, 1).unwrap()), 61);
    }
}
