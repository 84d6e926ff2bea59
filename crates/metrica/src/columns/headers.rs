//! Column header captions in English, Russian and Greek.

use crate::record::{fields, RecordType};
use crate::text::normalize_value;
use crate::tokenizer::{Token, TokenizedPage};

use crate::layout::find_anchors;

const NUMBER_CAPTIONS: &[&str] = &["No", "Number", "Nr", "№", "Record No", "Номер", "Αριθμός", "Α/Α"];
const CLERGY_CAPTIONS: &[&str] = &["Clergy", "Priest", "Officiant", "Священник", "Кто совершал", "Ιερεύς"];
const CHURCH_CAPTIONS: &[&str] = &["Church", "Parish", "Церковь", "Храм", "Ναός", "Ενορία"];

type Captions = &'static [(&'static str, &'static [&'static str])];

const BAPTISM: Captions = &[
    (fields::RECORD_NUMBER, NUMBER_CAPTIONS),
    (fields::FULL_NAME, &["Name", "Name of Child", "Child", "Имя", "Имя младенца", "Όνομα"]),
    (
        fields::BIRTH_DATE,
        &["Born", "Date of Birth", "Birth", "Рождения", "Дата рождения", "Γέννηση", "Ημερομηνία γεννήσεως"],
    ),
    (
        fields::BAPTISM_DATE,
        &["Baptized", "Date of Baptism", "Date", "Крещения", "Дата крещения", "Βάπτιση", "Ημερομηνία βαπτίσεως"],
    ),
    (fields::BIRTHPLACE, &["Place of Birth", "Birthplace", "Место рождения", "Τόπος γεννήσεως"]),
    (fields::PARENTS, &["Parents", "Родители", "Γονείς"]),
    (
        fields::SPONSORS,
        &["Sponsors", "Godparents", "Восприемники", "Крестные", "Ανάδοχος", "Ανάδοχοι"],
    ),
    (fields::CLERGY, CLERGY_CAPTIONS),
    (fields::CHURCH, CHURCH_CAPTIONS),
];

const MARRIAGE: Captions = &[
    (fields::RECORD_NUMBER, NUMBER_CAPTIONS),
    (
        fields::MARRIAGE_DATE,
        &["Date", "Date of Marriage", "Married", "Дата", "Дата венчания", "Ημερομηνία"],
    ),
    (fields::GROOM_NAME, &["Groom", "Name of Groom", "Жених", "Γαμπρός"]),
    (fields::GROOM_PARENTS, &["Groom's Parents", "Parents of Groom", "Родители жениха"]),
    (fields::BRIDE_NAME, &["Bride", "Name of Bride", "Невеста", "Νύφη"]),
    (fields::BRIDE_PARENTS, &["Bride's Parents", "Parents of Bride", "Родители невесты"]),
    (fields::WITNESSES, &["Witnesses", "Поручители", "Свидетели", "Μάρτυρες", "Κουμπάροι"]),
    (fields::CLERGY, CLERGY_CAPTIONS),
    (fields::LICENSE, &["License", "License No", "Разрешение", "Άδεια"]),
    (fields::CHURCH, CHURCH_CAPTIONS),
];

const FUNERAL: Captions = &[
    (fields::RECORD_NUMBER, NUMBER_CAPTIONS),
    (
        fields::DECEASED_NAME,
        &["Name", "Deceased", "Name of Deceased", "Умерший", "Имя", "Όνομα"],
    ),
    (
        fields::DEATH_DATE,
        &["Died", "Date of Death", "Death", "Смерти", "Дата смерти", "Θάνατος"],
    ),
    (
        fields::BURIAL_DATE,
        &["Buried", "Date of Burial", "Burial", "Погребения", "Дата погребения", "Ταφή"],
    ),
    (fields::BIRTH_DATE, &["Born", "Date of Birth", "Дата рождения"]),
    (fields::AGE_AT_DEATH, &["Age", "Возраст", "Лет", "Ηλικία"]),
    (
        fields::CAUSE_OF_DEATH,
        &["Cause", "Cause of Death", "Причина смерти", "Αιτία θανάτου"],
    ),
    (fields::BURIAL_PLACE, &["Cemetery", "Place of Burial", "Кладбище", "Κοιμητήριο"]),
    (fields::CLERGY, CLERGY_CAPTIONS),
    (fields::CHURCH, CHURCH_CAPTIONS),
];

/// Captions recognized for each field of a record type.
pub fn synonyms(record_type: RecordType) -> Captions {
    match record_type {
        RecordType::Baptism => BAPTISM,
        RecordType::Marriage => MARRIAGE,
        RecordType::Funeral => FUNERAL,
        RecordType::Unknown => &[],
    }
}

/// Best canonical field for a caption, with its similarity.
pub fn canonical_field(caption: &str, record_type: RecordType, min_similarity: f64) -> Option<(&'static str, f64)> {
    let caption = normalize_value(caption);
    if caption.is_empty() {
        return None;
    }
    let mut best: Option<(&'static str, f64)> = None;
    for &(field, captions) in synonyms(record_type) {
        for synonym in captions {
            let similarity = strsim::normalized_levenshtein(&caption, &normalize_value(synonym));
            if similarity >= min_similarity && best.map_or(true, |(_, s)| similarity > s) {
                best = Some((field, similarity));
            }
        }
    }
    best
}

/// Number of distinct fields whose caption appears on the line.
pub fn header_hits(page: &TokenizedPage, line: &[Token], record_type: RecordType, min_similarity: f64) -> usize {
    let lines = [line];
    synonyms(record_type)
        .iter()
        .filter(|(_, captions)| {
            captions
                .iter()
                .any(|c| !find_anchors(page, &lines, c, min_similarity).is_empty())
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_field_across_languages() {
        let m = RecordType::Marriage;
        assert_eq!(canonical_field("Groom", m, 0.8).unwrap().0, fields::GROOM_NAME);
        assert_eq!(canonical_field("Невеста", m, 0.8).unwrap().0, fields::BRIDE_NAME);
        assert_eq!(canonical_field("ΓΑΜΠΡΌΣ", m, 0.8).unwrap().0, fields::GROOM_NAME);
        assert_eq!(canonical_field("Groom's Parents", m, 0.8).unwrap().0, fields::GROOM_PARENTS);
        assert_eq!(canonical_field("Witneses", m, 0.8).unwrap().0, fields::WITNESSES);
        assert!(canonical_field("Remarks", m, 0.8).is_none());
    }

    #[test]
    fn test_every_field_is_canonical() {
        for rt in RecordType::KNOWN {
            for (field, _) in synonyms(rt) {
                assert!(rt.canonical_fields().contains(field), "{} {}", rt, field);
            }
        }
    }
}
