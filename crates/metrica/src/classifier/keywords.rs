//! Per-type keyword tables (English, Russian, Greek). Stems are used for
//! inflected languages and matched as substrings of folded page text.

use crate::record::RecordType;

pub const ANCHOR_WEIGHT: f32 = 2.0;
pub const KEYWORD_WEIGHT: f32 = 1.0;

/// Label phrases characteristic of the record type.
pub fn anchors(record_type: RecordType) -> &'static [&'static str] {
    match record_type {
        RecordType::Baptism => &[
            "certificate of baptism",
            "baptismal certificate",
            "date of baptism",
            "godparents",
            "sponsors",
            "свидетельство о крещении",
            "о рождении и крещении",
            "восприемники",
            "крестные",
            "πιστοποιητικό βαπτίσεως",
            "πιστοποιητικό βάπτισης",
            "ανάδοχος",
        ],
        RecordType::Marriage => &[
            "certificate of marriage",
            "marriage certificate",
            "date of marriage",
            "groom",
            "bride",
            "свидетельство о браке",
            "о бракосочетании",
            "жених",
            "невеста",
            "πιστοποιητικό γάμου",
            "γαμπρός",
            "νύφη",
        ],
        RecordType::Funeral => &[
            "certificate of death",
            "burial record",
            "date of death",
            "date of burial",
            "cause of death",
            "о смерти",
            "погребение",
            "причина смерти",
            "πιστοποιητικό θανάτου",
            "κηδεία",
            "ταφή",
        ],
        RecordType::Unknown => &[],
    }
}

/// Single words that lean towards the record type.
pub fn keywords(record_type: RecordType) -> &'static [&'static str] {
    match record_type {
        RecordType::Baptism => &[
            "baptism",
            "baptized",
            "christened",
            "born",
            "godfather",
            "godmother",
            "крещ",
            "родил",
            "восприемн",
            "βάπτισ",
            "βαπτίσ",
            "γεννήθηκε",
        ],
        RecordType::Marriage => &[
            "marriage",
            "married",
            "wedding",
            "witnesses",
            "license",
            "брак",
            "венчан",
            "поручител",
            "γάμ",
            "μάρτυρες",
            "στεφαν",
        ],
        RecordType::Funeral => &[
            "death",
            "died",
            "deceased",
            "burial",
            "buried",
            "funeral",
            "умер",
            "смерт",
            "погреб",
            "θάνατ",
            "απεβίωσε",
            "κηδεί",
        ],
        RecordType::Unknown => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_type_has_tables() {
        for rt in RecordType::KNOWN {
            assert!(!anchors(rt).is_empty());
            assert!(!keywords(rt).is_empty());
        }
        assert!(anchors(RecordType::Unknown).is_empty());
    }
}
