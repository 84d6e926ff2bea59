//! Correction memory aggregation table.

use rusqlite::{params, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionRow {
    pub tenant_id: String,
    pub record_type: String,
    pub field_name: String,
    pub original_norm: String,
    pub original_value: String,
    pub corrected_value: String,
    pub frequency: u32,
    pub first_seen: String,
    pub last_seen: String,
}

impl CorrectionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            tenant_id: row.get("tenant_id")?,
            record_type: row.get("record_type")?,
            field_name: row.get("field_name")?,
            original_norm: row.get("original_norm")?,
            original_value: row.get("original_value")?,
            corrected_value: row.get("corrected_value")?,
            frequency: row.get("frequency")?,
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
        })
    }
}

/// Records one observation of `original -> corrected`.
///
/// A single statement UPSERT, so concurrent writers for the same key each
/// add exactly one to `frequency`.
#[allow(clippy::too_many_arguments)]
pub fn record(
    db: &Database,
    tenant_id: &str,
    record_type: &str,
    field_name: &str,
    original_norm: &str,
    original_value: &str,
    corrected_value: &str,
    now: &str,
) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO corrections (tenant_id, record_type, field_name, original_norm,
             original_value, corrected_value, frequency, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
             ON CONFLICT(tenant_id, record_type, field_name, original_norm, corrected_value)
             DO UPDATE SET frequency = frequency + 1, last_seen = ?7,
               original_value = excluded.original_value",
            params![
                tenant_id,
                record_type,
                field_name,
                original_norm,
                original_value,
                corrected_value,
                now,
            ],
        )?;
        let frequency = conn.query_row(
            "SELECT frequency FROM corrections
             WHERE tenant_id = ?1 AND record_type = ?2 AND field_name = ?3
               AND original_norm = ?4 AND corrected_value = ?5",
            params![tenant_id, record_type, field_name, original_norm, corrected_value],
            |r| r.get(0),
        )?;
        Ok(frequency)
    })
}

/// All corrections seen for a field of a record type, most frequent first.
pub fn list_for_field(
    db: &Database,
    tenant_id: &str,
    record_type: &str,
    field_name: &str,
) -> Result<Vec<CorrectionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM corrections
             WHERE tenant_id = ?1 AND record_type = ?2 AND field_name = ?3
             ORDER BY frequency DESC, last_seen DESC",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, record_type, field_name], CorrectionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2026-04-01T00:00:00.000Z";

    #[test]
    fn test_record_increments_frequency() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            record(&db, "t", "baptism", "clergy", "fr ioann", "Fr Ioann", "Fr. John", NOW).unwrap(),
            1
        );
        assert_eq!(
            record(&db, "t", "baptism", "clergy", "fr ioann", "FR IOANN", "Fr. John", NOW).unwrap(),
            2
        );
        record(&db, "t", "baptism", "clergy", "fr ioann", "Fr Ioann", "Fr. Ivan", NOW).unwrap();

        let rows = list_for_field(&db, "t", "baptism", "clergy").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].corrected_value, "Fr. John");
        assert_eq!(rows[0].frequency, 2);
        assert_eq!(rows[0].original_value, "FR IOANN");
    }

    #[test]
    fn test_scoped_by_tenant_and_type() {
        let db = Database::open_in_memory().unwrap();
        record(&db, "a", "baptism", "church", "st nick", "st nick", "St. Nicholas", NOW).unwrap();
        record(&db, "b", "baptism", "church", "st nick", "st nick", "St. Nikolai", NOW).unwrap();
        record(&db, "a", "funeral", "church", "st nick", "st nick", "St. Nicholas", NOW).unwrap();

        assert_eq!(list_for_field(&db, "a", "baptism", "church").unwrap().len(), 1);
        assert_eq!(list_for_field(&db, "a", "funeral", "church").unwrap().len(), 1);
        assert!(list_for_field(&db, "b", "funeral", "church").unwrap().is_empty());
    }
}
