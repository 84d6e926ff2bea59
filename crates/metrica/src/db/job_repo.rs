//! Job repository for the `jobs`, `incidents` and `dead_letters` tables.
//!
//! Claiming is the only coordination point between workers, so every
//! status change made by a worker is a compare-and-swap on `claim_token`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub tenant_id: String,
    pub batch_id: Option<String>,
    pub status: String,
    pub retry_count: u32,
    pub error: Option<String>,
    pub user_message: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub claim_token: Option<String>,
    pub not_before: String,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            batch_id: row.get("batch_id")?,
            status: row.get("status")?,
            retry_count: row.get("retry_count")?,
            error: row.get("error")?,
            user_message: row.get("user_message")?,
            claimed_by: row.get("claimed_by")?,
            claimed_at: row.get("claimed_at")?,
            claim_token: row.get("claim_token")?,
            not_before: row.get("not_before")?,
            cancel_requested: row.get("cancel_requested")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// A successful claim. `reclaimed_from` is set when the job was taken over
/// from a worker that exceeded the staleness timeout.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: JobRow,
    pub reclaimed_from: Option<String>,
}

/// Outcome of a requeue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued { retry_count: u32, not_before: String },
    DeadLettered { retry_count: u32 },
    /// The caller no longer holds the claim.
    ClaimLost,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, tenant_id, batch_id, status, retry_count, error, user_message,
         claimed_by, claimed_at, claim_token, not_before, cancel_requested, created_at,
         updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.id,
            job.tenant_id,
            job.batch_id,
            job.status,
            job.retry_count,
            job.error,
            job.user_message,
            job.claimed_by,
            job.claimed_at,
            job.claim_token,
            job.not_before,
            job.cancel_requested,
            job.created_at,
            job.updated_at,
            job.completed_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?)
}

/// Atomically claims the oldest eligible job for `worker_id`.
///
/// Eligible means `queued` with `not_before <= now`, or `processing` with a
/// claim older than `stale_before`. Runs under `BEGIN IMMEDIATE` and finishes
/// with a compare-and-swap on the previous claim token, so two workers (even
/// in different processes) can never both win the same row.
pub fn claim_next(
    db: &Database,
    worker_id: &str,
    claim_token: &str,
    now: &str,
    stale_before: &str,
) -> Result<Option<Claim>, DatabaseError> {
    db.immediate(|conn| {
        let candidate = conn
            .query_row(
                "SELECT id, status, claim_token, claimed_by FROM jobs
                 WHERE (status = 'queued' AND not_before <= ?1)
                    OR (status = 'processing' AND claimed_at < ?2)
                 ORDER BY created_at, id
                 LIMIT 1",
                params![now, stale_before],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, status, previous_token, previous_worker)) = candidate else {
            return Ok(None);
        };

        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', claimed_by = ?1, claimed_at = ?2,
             claim_token = ?3, updated_at = ?2
             WHERE id = ?4 AND status = ?5 AND claim_token IS ?6",
            params![worker_id, now, claim_token, id, status, previous_token],
        )?;
        if changed != 1 {
            return Ok(None);
        }

        let reclaimed_from = if status == "processing" {
            let previous = previous_worker.unwrap_or_else(|| "unknown".to_string());
            insert_incident_in(
                conn,
                Some(&id),
                "stale_reclaim",
                &format!("reclaimed by {} from stalled worker {}", worker_id, previous),
                now,
            )?;
            Some(previous)
        } else {
            None
        };

        let job = find_in(conn, &id)?.ok_or(DatabaseError::Sqlite(
            rusqlite::Error::QueryReturnedNoRows,
        ))?;
        Ok(Some(Claim {
            job,
            reclaimed_from,
        }))
    })
}

/// Moves a claimed job to a terminal status. Returns `false` when the claim
/// was lost (another worker reclaimed the job).
pub fn finish(
    db: &Database,
    id: &str,
    claim_token: &str,
    status: &str,
    error: Option<&str>,
    user_message: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, error = ?4, user_message = ?5, updated_at = ?6,
             completed_at = ?6, claim_token = NULL
             WHERE id = ?1 AND claim_token = ?2 AND status = 'processing'",
            params![id, claim_token, status, error, user_message, now],
        )?;
        Ok(changed == 1)
    })
}

/// Requeues a claimed job after a transient failure, or dead-letters it once
/// `retry_count` has reached `max_retries`.
#[allow(clippy::too_many_arguments)]
pub fn requeue(
    db: &Database,
    id: &str,
    claim_token: &str,
    error: &str,
    user_message: &str,
    max_retries: u32,
    not_before: &str,
    dead_letter_context: &str,
    now: &str,
) -> Result<RequeueOutcome, DatabaseError> {
    db.immediate(|conn| {
        let current: Option<(u32, String)> = conn
            .query_row(
                "SELECT retry_count, tenant_id FROM jobs
                 WHERE id = ?1 AND claim_token = ?2 AND status = 'processing'",
                params![id, claim_token],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let Some((retry_count, tenant_id)) = current else {
            return Ok(RequeueOutcome::ClaimLost);
        };

        if retry_count >= max_retries {
            conn.execute(
                "UPDATE jobs SET status = 'failed', error = ?2, user_message = ?3,
                 updated_at = ?4, completed_at = ?4, claim_token = NULL
                 WHERE id = ?1",
                params![id, error, user_message, now],
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO dead_letters (job_id, tenant_id, retry_count, error, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, tenant_id, retry_count, error, dead_letter_context, now],
            )?;
            return Ok(RequeueOutcome::DeadLettered { retry_count });
        }

        let retry_count = retry_count + 1;
        conn.execute(
            "UPDATE jobs SET status = 'queued', retry_count = ?2, error = ?3, user_message = ?4,
             not_before = ?5, updated_at = ?6, claimed_by = NULL, claimed_at = NULL,
             claim_token = NULL
             WHERE id = ?1",
            params![id, retry_count, error, user_message, not_before, now],
        )?;
        Ok(RequeueOutcome::Requeued {
            retry_count,
            not_before: not_before.to_string(),
        })
    })
}

/// Resets jobs stuck in `processing` since before `stale_before` back to
/// `queued`, logging one incident per job. Returns the reset jobs as
/// `(id, claimed_by, claimed_at)`.
pub fn sweep_stale(
    db: &Database,
    stale_before: &str,
    now: &str,
) -> Result<Vec<(String, String, String)>, DatabaseError> {
    db.immediate(|conn| {
        let stale: Vec<(String, String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, COALESCE(claimed_by, 'unknown'), COALESCE(claimed_at, '') FROM jobs
                 WHERE status = 'processing' AND claimed_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![stale_before], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (id, claimed_by, claimed_at) in &stale {
            conn.execute(
                "UPDATE jobs SET status = 'queued', claimed_by = NULL, claimed_at = NULL,
                 claim_token = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'processing'",
                params![id, now],
            )?;
            insert_incident_in(
                conn,
                Some(id),
                "stale_sweep",
                &format!(
                    "reset to queued; claimed by {} at {}",
                    claimed_by, claimed_at
                ),
                now,
            )?;
        }
        Ok(stale)
    })
}

/// Flags a job for cancellation. Terminal jobs are left untouched.
pub fn request_cancel(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'processing')",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

pub fn is_cancel_requested(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get::<_, bool>(0),
            )
            .optional()?
            .unwrap_or(false))
    })
}

fn insert_incident_in(
    conn: &Connection,
    job_id: Option<&str>,
    kind: &str,
    message: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO incidents (job_id, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![job_id, kind, message, now],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRow {
    pub id: i64,
    pub job_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub created_at: String,
}

pub fn list_incidents(db: &Database, job_id: &str) -> Result<Vec<IncidentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, job_id, kind, message, created_at FROM incidents
             WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| {
                Ok(IncidentRow {
                    id: r.get(0)?,
                    job_id: r.get(1)?,
                    kind: r.get(2)?,
                    message: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRow {
    pub job_id: String,
    pub tenant_id: String,
    pub retry_count: u32,
    pub error: String,
    pub context: serde_json::Value,
    pub created_at: String,
}

pub fn list_dead_letters(
    db: &Database,
    tenant_id: Option<&str>,
) -> Result<Vec<DeadLetterRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT job_id, tenant_id, retry_count, error, context, created_at FROM dead_letters
             WHERE ?1 IS NULL OR tenant_id = ?1
             ORDER BY created_at DESC",
        )?;
        let raw = stmt
            .query_map(params![tenant_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(job_id, tenant_id, retry_count, error, context, created_at)| {
                Ok(DeadLetterRow {
                    job_id,
                    tenant_id,
                    retry_count,
                    error,
                    context: super::from_json("context", &context)?,
                    created_at,
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str, created_at: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            tenant_id: "st-nicholas".to_string(),
            batch_id: None,
            status: "queued".to_string(),
            retry_count: 0,
            error: None,
            user_message: None,
            claimed_by: None,
            claimed_at: None,
            claim_token: None,
            not_before: created_at.to_string(),
            cancel_requested: false,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
            completed_at: None,
        }
    }

    fn insert_job(db: &Database, job: &JobRow) {
        db.with_conn(|conn| insert(conn, job)).unwrap();
    }

    const T0: &str = "2026-01-01T00:00:00.000Z";
    const T1: &str = "2026-01-01T00:05:00.000Z";
    const T2: &str = "2026-01-01T00:20:00.000Z";

    #[test]
    fn test_claim_oldest_first() {
        let db = test_db();
        insert_job(&db, &sample_job("newer", "2026-01-01T00:00:01.000Z"));
        insert_job(&db, &sample_job("older", T0));

        let claim = claim_next(&db, "w1", "tok-1", T1, T0).unwrap().unwrap();
        assert_eq!(claim.job.id, "older");
        assert_eq!(claim.job.status, "processing");
        assert_eq!(claim.job.claimed_by.as_deref(), Some("w1"));
        assert!(claim.reclaimed_from.is_none());
    }

    #[test]
    fn test_claim_respects_not_before() {
        let db = test_db();
        let mut job = sample_job("later", T0);
        job.not_before = T2.to_string();
        insert_job(&db, &job);

        assert!(claim_next(&db, "w1", "tok", T1, T0).unwrap().is_none());
        assert!(claim_next(&db, "w1", "tok", T2, T0).unwrap().is_some());
    }

    #[test]
    fn test_claimed_job_is_not_claimed_again() {
        let db = test_db();
        insert_job(&db, &sample_job("only", T0));
        assert!(claim_next(&db, "w1", "a", T1, T0).unwrap().is_some());
        assert!(claim_next(&db, "w2", "b", T1, T0).unwrap().is_none());
    }

    #[test]
    fn test_stale_claim_is_reclaimed_with_incident() {
        let db = test_db();
        insert_job(&db, &sample_job("stuck", T0));
        claim_next(&db, "w1", "a", T0, T0).unwrap().unwrap();

        // claimed_at T0 is older than stale_before T1
        let claim = claim_next(&db, "w2", "b", T2, T1).unwrap().unwrap();
        assert_eq!(claim.reclaimed_from.as_deref(), Some("w1"));
        assert_eq!(claim.job.claim_token.as_deref(), Some("b"));

        let incidents = list_incidents(&db, "stuck").unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].kind, "stale_reclaim");

        // The original worker lost the claim.
        assert!(!finish(&db, "stuck", "a", "completed", None, None, T2).unwrap());
        assert!(finish(&db, "stuck", "b", "completed", None, None, T2).unwrap());
    }

    #[test]
    fn test_requeue_then_dead_letter() {
        let db = test_db();
        insert_job(&db, &sample_job("flaky", T0));

        for attempt in 1..=2u32 {
            claim_next(&db, "w1", "t", T2, T0).unwrap().unwrap();
            let outcome = requeue(&db, "flaky", "t", "timeout", "retrying", 2, T0, "{}", T1).unwrap();
            assert_eq!(
                outcome,
                RequeueOutcome::Requeued {
                    retry_count: attempt,
                    not_before: T0.to_string()
                }
            );
        }

        claim_next(&db, "w1", "t", T2, T0).unwrap().unwrap();
        let outcome =
            requeue(&db, "flaky", "t", "timeout", "retrying", 2, T0, r#"{"pages":[]}"#, T1).unwrap();
        assert_eq!(outcome, RequeueOutcome::DeadLettered { retry_count: 2 });

        let job = find_by_id(&db, "flaky").unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.retry_count, 2);

        let dead = list_dead_letters(&db, Some("st-nicholas")).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].context["pages"], serde_json::json!([]));
    }

    #[test]
    fn test_requeue_without_claim_is_rejected() {
        let db = test_db();
        insert_job(&db, &sample_job("idle", T0));
        let outcome = requeue(&db, "idle", "nope", "x", "x", 3, T0, "{}", T1).unwrap();
        assert_eq!(outcome, RequeueOutcome::ClaimLost);
    }

    #[test]
    fn test_sweep_stale_resets_jobs() {
        let db = test_db();
        insert_job(&db, &sample_job("a", T0));
        insert_job(&db, &sample_job("b", "2026-01-01T00:00:01.000Z"));
        claim_next(&db, "w1", "ta", T0, T0).unwrap().unwrap();
        claim_next(&db, "w2", "tb", T2, T0).unwrap().unwrap();

        let reset = sweep_stale(&db, T1, T2).unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].0, "a");
        assert_eq!(find_by_id(&db, "a").unwrap().unwrap().status, "queued");
        assert_eq!(find_by_id(&db, "b").unwrap().unwrap().status, "processing");
        assert_eq!(list_incidents(&db, "a").unwrap()[0].kind, "stale_sweep");
    }

    #[test]
    fn test_cancel_flag() {
        let db = test_db();
        insert_job(&db, &sample_job("c", T0));
        assert!(!is_cancel_requested(&db, "c").unwrap());
        assert!(request_cancel(&db, "c", T1).unwrap());
        assert!(is_cancel_requested(&db, "c").unwrap());
        assert!(!request_cancel(&db, "missing", T1).unwrap());
    }
}
