//! Forward-only schema migrations.
//!
//! Applied versions are tracked in `_migrations`; each migration runs at
//! most once, in order.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_and_pages",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_dead_letters_and_incidents",
        sql: include_str!("sql/002_create_dead_letters.sql"),
    },
    Migration {
        version: 3,
        description: "create_ocr_cache_and_usage",
        sql: include_str!("sql/003_create_ocr_usage.sql"),
    },
    Migration {
        version: 4,
        description: "create_drafts",
        sql: include_str!("sql/004_create_drafts.sql"),
    },
    Migration {
        version: 5,
        description: "create_corrections",
        sql: include_str!("sql/005_create_corrections.sql"),
    },
    Migration {
        version: 6,
        description: "create_records",
        sql: include_str!("sql/006_create_records.sql"),
    },
    Migration {
        version: 7,
        description: "create_autocommit_batches",
        sql: include_str!("sql/007_create_autocommit.sql"),
    },
];

fn applied_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |r| r.get(0))?)
}

/// Brings the schema up to date. Each version is applied in its own
/// immediate transaction, and the applied version is re-read after the
/// lock is taken, so workers opening one file at the same time never apply
/// a migration twice.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )?;

    for migration in MIGRATIONS {
        if migration.version <= applied_version(conn)? {
            continue;
        }

        conn.execute_batch("BEGIN IMMEDIATE")?;
        let applied = apply(conn, migration);
        match applied {
            Ok(true) => {
                conn.execute_batch("COMMIT")?;
                log::info!("Schema migrated to v{} ({})", migration.version, migration.description);
            }
            Ok(false) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    log::warn!("Rollback of migration v{} failed: {}", migration.version, rollback);
                }
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Returns `false` when another connection applied the version first.
fn apply(conn: &Connection, migration: &Migration) -> Result<bool, DatabaseError> {
    if migration.version <= applied_version(conn)? {
        return Ok(false);
    }
    conn.execute_batch(migration.sql)
        .map_err(|e| DatabaseError::Migration {
            version: migration.version,
            reason: e.to_string(),
        })?;
    conn.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.description],
    )?;
    Ok(true)
}
