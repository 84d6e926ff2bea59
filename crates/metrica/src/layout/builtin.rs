//! Templates shipped with the crate. Tenants can override them by id with
//! a higher version in the template directory.

use crate::record::{fields, RecordType};

use super::{ColumnBand, FieldSpec, LayoutTemplate, TemplateKind, Zone};

const RIGHT: Zone = Zone::Right {
    max_width: 0.65,
    pad: 0.01,
};

fn spec(field: &str, anchors: &[&str]) -> FieldSpec {
    FieldSpec {
        field: field.to_string(),
        anchors: anchors.iter().map(|a| a.to_string()).collect(),
        zone: RIGHT,
    }
}

fn layout(id: &str, record_type: RecordType, fields: Vec<FieldSpec>) -> LayoutTemplate {
    LayoutTemplate {
        id: id.to_string(),
        version: 1,
        tenant_id: None,
        record_type,
        kind: TemplateKind::Layout { fields },
    }
}

fn band(field: &str, x0: f32, x1: f32, headers: &[&str]) -> ColumnBand {
    ColumnBand {
        field: field.to_string(),
        x0,
        x1,
        headers: headers.iter().map(|h| h.to_string()).collect(),
    }
}

pub fn baptism_certificate() -> LayoutTemplate {
    use fields::*;
    layout(
        "baptism-certificate-v1",
        RecordType::Baptism,
        vec![
            spec(FULL_NAME, &["Name", "Full Name", "Name of Child", "Имя", "Όνομα"]),
            spec(BIRTH_DATE, &["Date of Birth", "Born", "Дата рождения", "Ημερομηνία γεννήσεως"]),
            spec(BAPTISM_DATE, &["Date of Baptism", "Дата крещения", "Ημερομηνία βαπτίσεως"]),
            spec(BIRTHPLACE, &["Place of Birth", "Birthplace", "Место рождения", "Τόπος γεννήσεως"]),
            spec(PARENTS, &["Parents", "Родители", "Γονείς"]),
            spec(
                SPONSORS,
                &["Sponsors", "Godparents", "Восприемники", "Крестные", "Ανάδοχος", "Ανάδοχοι"],
            ),
            spec(CLERGY, &["Clergy", "Priest", "Officiant", "Священник", "Ιερεύς"]),
            spec(CHURCH, &["Church", "Parish", "Церковь", "Храм", "Ναός", "Ενορία"]),
            spec(RECORD_NUMBER, &["Record No", "Record Number", "Номер записи", "Αριθμός"]),
        ],
    )
}

pub fn marriage_certificate() -> LayoutTemplate {
    use fields::*;
    layout(
        "marriage-certificate-v1",
        RecordType::Marriage,
        vec![
            spec(GROOM_NAME, &["Groom", "Name of Groom", "Жених", "Γαμπρός"]),
            spec(BRIDE_NAME, &["Bride", "Name of Bride", "Невеста", "Νύφη"]),
            spec(
                MARRIAGE_DATE,
                &["Date of Marriage", "Married", "Дата венчания", "Ημερομηνία γάμου"],
            ),
            spec(GROOM_PARENTS, &["Groom's Parents", "Parents of Groom", "Родители жениха"]),
            spec(BRIDE_PARENTS, &["Bride's Parents", "Parents of Bride", "Родители невесты"]),
            spec(WITNESSES, &["Witnesses", "Поручители", "Свидетели", "Κουμπάρος", "Μάρτυρες"]),
            spec(CLERGY, &["Clergy", "Priest", "Officiant", "Священник", "Ιερεύς"]),
            spec(CHURCH, &["Church", "Parish", "Церковь", "Храм", "Ναός", "Ενορία"]),
            spec(LICENSE, &["License", "License No", "Разрешение", "Άδεια"]),
            spec(RECORD_NUMBER, &["Record No", "Record Number", "Номер записи", "Αριθμός"]),
        ],
    )
}

pub fn funeral_certificate() -> LayoutTemplate {
    use fields::*;
    layout(
        "funeral-certificate-v1",
        RecordType::Funeral,
        vec![
            spec(
                DECEASED_NAME,
                &["Name of Deceased", "Deceased", "Name", "Умерший", "Имя", "Όνομα"],
            ),
            spec(DEATH_DATE, &["Date of Death", "Died", "Дата смерти", "Ημερομηνία θανάτου"]),
            spec(
                BURIAL_DATE,
                &["Date of Burial", "Date of Funeral", "Buried", "Дата погребения", "Ημερομηνία ταφής"],
            ),
            spec(BIRTH_DATE, &["Date of Birth", "Born", "Дата рождения", "Ημερομηνία γεννήσεως"]),
            spec(AGE_AT_DEATH, &["Age", "Age at Death", "Возраст", "Ηλικία"]),
            spec(
                BURIAL_PLACE,
                &["Place of Burial", "Cemetery", "Место погребения", "Κοιμητήριο"],
            ),
            spec(CAUSE_OF_DEATH, &["Cause of Death", "Причина смерти", "Αιτία θανάτου"]),
            spec(CLERGY, &["Clergy", "Priest", "Officiant", "Священник", "Ιερεύς"]),
            spec(CHURCH, &["Church", "Parish", "Церковь", "Храм", "Ναός", "Ενορία"]),
        ],
    )
}

/// Bands of the parish marriage register with the header printed at
/// y = 0.295.
pub fn marriage_ledger() -> LayoutTemplate {
    use fields::*;
    LayoutTemplate {
        id: "marriage-ledger-v1".to_string(),
        version: 1,
        tenant_id: None,
        record_type: RecordType::Marriage,
        kind: TemplateKind::Columns {
            header_y: Some(0.295),
            bands: vec![
                band(RECORD_NUMBER, 0.02, 0.06, &["No", "Number", "№"]),
                band(MARRIAGE_DATE, 0.06, 0.125, &["Date", "Дата", "Ημερομηνία"]),
                band(GROOM_NAME, 0.125, 0.29, &["Groom", "Жених", "Γαμπρός"]),
                band(GROOM_PARENTS, 0.29, 0.345, &["Groom's Parents", "Родители жениха"]),
                band(BRIDE_NAME, 0.345, 0.475, &["Bride", "Невеста", "Νύφη"]),
                band(BRIDE_PARENTS, 0.475, 0.55, &["Bride's Parents", "Родители невесты"]),
                band(CLERGY, 0.55, 0.645, &["Clergy", "Priest", "Священник", "Ιερεύς"]),
                band(WITNESSES, 0.645, 0.825, &["Witnesses", "Поручители", "Μάρτυρες"]),
                band(LICENSE, 0.825, 1.0, &["License", "Разрешение", "Άδεια"]),
            ],
        },
    }
}

pub fn all() -> Vec<LayoutTemplate> {
    vec![
        baptism_certificate(),
        marriage_certificate(),
        funeral_certificate(),
        marriage_ledger(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_validate() {
        for template in all() {
            assert!(template.validate().is_ok(), "{}", template.id);
        }
    }

    #[test]
    fn test_ledger_bands_are_contiguous() {
        let TemplateKind::Columns { bands, .. } = marriage_ledger().kind else {
            panic!("ledger template must be column based");
        };
        for pair in bands.windows(2) {
            assert!((pair[0].x1 - pair[1].x0).abs() < 1e-6);
        }
    }
}
