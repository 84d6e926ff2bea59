//! The external records store drafts are committed into.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::{record_repo, Database};
use crate::record::RecordType;

/// Back-reference from a committed record to where it was extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub tenant_id: String,
    pub job_id: String,
    pub page_id: String,
    pub draft_id: String,
}

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Persists final records. Implementations must be idempotent on
/// `provenance.draft_id`: a retried commit returns the same record id.
pub trait RecordsStore: Send + Sync {
    fn persist_record(
        &self,
        record_type: RecordType,
        fields: &BTreeMap<String, String>,
        provenance: &Provenance,
    ) -> Result<String, StoreError>;

    /// Removes a record written by `persist_record`. Returns `false` when
    /// the record no longer exists.
    fn delete_record(&self, record_id: &str) -> Result<bool, StoreError>;
}

/// Stores records in the local `records` table.
#[derive(Clone)]
pub struct SqliteRecordsStore {
    db: Database,
}

impl SqliteRecordsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RecordsStore for SqliteRecordsStore {
    fn persist_record(
        &self,
        record_type: RecordType,
        fields: &BTreeMap<String, String>,
        provenance: &Provenance,
    ) -> Result<String, StoreError> {
        let row = record_repo::RecordRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: provenance.tenant_id.clone(),
            record_type: record_type.as_str().to_string(),
            fields: serde_json::to_string(fields)?,
            source_job_id: provenance.job_id.clone(),
            source_page_id: provenance.page_id.clone(),
            source_draft_id: provenance.draft_id.clone(),
            created_at: crate::db::now(),
        };
        Ok(record_repo::insert_once(&self.db, &row)?)
    }

    fn delete_record(&self, record_id: &str) -> Result<bool, StoreError> {
        Ok(record_repo::delete(&self.db, record_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_is_idempotent_per_draft() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordsStore::new(db.clone());
        let provenance = Provenance {
            tenant_id: "t".into(),
            job_id: "j".into(),
            page_id: "p".into(),
            draft_id: "d".into(),
        };
        let fields = BTreeMap::from([("fullName".to_string(), "Anna Petrova".to_string())]);
        let first = store.persist_record(RecordType::Baptism, &fields, &provenance).unwrap();
        let second = store.persist_record(RecordType::Baptism, &fields, &provenance).unwrap();
        assert_eq!(first, second);
        assert_eq!(record_repo::count_for_tenant(&db, "t").unwrap(), 1);
        let row = record_repo::find_by_id(&db, &first).unwrap().unwrap();
        assert!(row.fields.contains("Anna Petrova"));

        assert!(store.delete_record(&first).unwrap());
        assert!(!store.delete_record(&first).unwrap());
    }
}
