//! Cross-field consistency checks. Violations are annotations, never errors.

use chrono::NaiveDate;

use super::dates::{parse_age, parse_date, years_between};
use crate::record::{fields, FieldFormat, RecordCandidate, Violation, ViolationCode};

fn violation(code: ViolationCode, names: &[&str], message: String) -> Violation {
    Violation {
        code,
        fields: names.iter().map(|n| n.to_string()).collect(),
        message,
    }
}

/// Runs every check that applies to the candidate's fields.
pub fn check(candidate: &RecordCandidate, age_tolerance_years: u32) -> Vec<Violation> {
    let mut out = Vec::new();

    for required in candidate.record_type.required_fields() {
        if candidate.value(required).is_none() {
            out.push(violation(
                ViolationCode::MissingRequired,
                &[required],
                format!("{} is required", required),
            ));
        }
    }

    for (name, field) in &candidate.fields {
        if FieldFormat::for_field(name) == FieldFormat::Date
            && !field.value.trim().is_empty()
            && parse_date(&field.value).is_none()
        {
            out.push(Violation {
                code: ViolationCode::UnparseableDate,
                fields: vec![name.clone()],
                message: format!("'{}' is not a recognizable date", field.value),
            });
        }
    }

    let date = |name: &str| candidate.value(name).and_then(parse_date);
    let birth = date(fields::BIRTH_DATE);
    let baptism = date(fields::BAPTISM_DATE);
    let marriage = date(fields::MARRIAGE_DATE);
    let death = date(fields::DEATH_DATE);
    let burial = date(fields::BURIAL_DATE);

    let ordered = |earlier: Option<NaiveDate>, later: Option<NaiveDate>| match (earlier, later) {
        (Some(a), Some(b)) => a <= b,
        _ => true,
    };

    if !ordered(birth, baptism) {
        out.push(violation(
            ViolationCode::BirthAfterBaptism,
            &[fields::BIRTH_DATE, fields::BAPTISM_DATE],
            "birth date is after the baptism date".to_string(),
        ));
    }
    if !ordered(birth, death) {
        out.push(violation(
            ViolationCode::DeathBeforeBirth,
            &[fields::BIRTH_DATE, fields::DEATH_DATE],
            "death date is before the birth date".to_string(),
        ));
    }
    if !ordered(marriage, death) {
        out.push(violation(
            ViolationCode::MarriageAfterDeath,
            &[fields::MARRIAGE_DATE, fields::DEATH_DATE],
            "marriage date is after a recorded death".to_string(),
        ));
    }
    if !ordered(death, burial) {
        out.push(violation(
            ViolationCode::BurialBeforeDeath,
            &[fields::DEATH_DATE, fields::BURIAL_DATE],
            "burial date is before the death date".to_string(),
        ));
    }

    if let (Some(b), Some(d), Some(age)) = (
        birth,
        death,
        candidate.value(fields::AGE_AT_DEATH).and_then(parse_age),
    ) {
        let computed = years_between(b, d);
        if (computed - age as i32).unsigned_abs() > age_tolerance_years {
            out.push(violation(
                ViolationCode::AgeMismatch,
                &[fields::AGE_AT_DEATH, fields::BIRTH_DATE, fields::DEATH_DATE],
                format!("recorded age {} but dates give {}", age, computed),
            ));
        }
    }

    out
}
