//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                from_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ingested',
                category TEXT,
                confidence REAL,
                rationale TEXT,
                key_phrases TEXT NOT NULL DEFAULT '[]',
                model TEXT,
                importance_score REAL,
                importance TEXT,
                has_event INTEGER NOT NULL DEFAULT 0,
                has_unsubscribe INTEGER NOT NULL DEFAULT 0,
                applied_labels TEXT NOT NULL DEFAULT '[]',
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
            CREATE INDEX IF NOT EXISTS idx_items_external_id ON items(external_id);
            CREATE INDEX IF NOT EXISTS idx_items_received ON items(received_at);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                step TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_item ON checkpoints(item_id);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at);

            CREATE TABLE IF NOT EXISTS batch_jobs (
                job_id TEXT PRIMARY KEY,
                query_template TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                chunk_size INTEGER NOT NULL DEFAULT 500,
                chunk_months INTEGER NOT NULL DEFAULT 2,
                status TEXT NOT NULL DEFAULT 'pending',
                chunks_completed INTEGER NOT NULL DEFAULT 0,
                chunks_total INTEGER NOT NULL DEFAULT 0,
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_categorized INTEGER NOT NULL DEFAULT 0,
                items_labeled INTEGER NOT NULL DEFAULT 0,
                items_pending_review INTEGER NOT NULL DEFAULT 0,
                items_errors INTEGER NOT NULL DEFAULT 0,
                estimated_cost TEXT NOT NULL DEFAULT '0',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                lock_holder TEXT,
                lock_acquired_at TEXT,
                current_chunk_start TEXT,
                current_chunk_end TEXT,
                completed_ranges TEXT NOT NULL DEFAULT '[]',
                started_at TEXT,
                completed_at TEXT,
                last_activity TEXT NOT NULL DEFAULT (datetime('now')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_batch_jobs_status ON batch_jobs(status);
        "#,
    },
    Migration {
        version: 2,
        name: "review_and_feedback",
        sql: r#"
            CREATE TABLE IF NOT EXISTS review_queue (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                decision_type TEXT NOT NULL,
                proposed TEXT NOT NULL,
                resolution TEXT NOT NULL DEFAULT 'pending',
                corrected TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_review_queue_resolution ON review_queue(resolution);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_review_queue_open
                ON review_queue(item_id, decision_type)
                WHERE resolution = 'pending';

            CREATE TABLE IF NOT EXISTS feedback (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                decision_type TEXT NOT NULL,
                proposed TEXT NOT NULL,
                resolution TEXT NOT NULL,
                corrected TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_item ON feedback(item_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "items",
            "checkpoints",
            "batch_jobs",
            "review_queue",
            "feedback",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn open_review_entries_are_unique_per_item_and_type() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO items (id, external_id, thread_id, from_email, subject, received_at, created_at, updated_at)
             VALUES ('i1', 'x1', 't1', 'a@b.c', 's', '2026-01-01', '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO review_queue (id, item_id, decision_type, proposed) VALUES ('r1', 'i1', 'categorization', '\"X\"')",
            (),
        )
        .await
        .unwrap();

        // Second pending entry of the same type is rejected
        let dup = conn
            .execute(
                "INSERT INTO review_queue (id, item_id, decision_type, proposed) VALUES ('r2', 'i1', 'categorization', '\"Y\"')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A resolved entry does not block a new pending one
        conn.execute(
            "UPDATE review_queue SET resolution = 'approved' WHERE id = 'r1'",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO review_queue (id, item_id, decision_type, proposed) VALUES ('r3', 'i1', 'categorization', '\"Z\"')",
            (),
        )
        .await
        .unwrap();
    }
}
