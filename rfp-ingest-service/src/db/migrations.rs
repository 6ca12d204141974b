//! Database schema migrations.
//!
//! This module contains all database migrations and schema setup.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// This function is called during database initialization to ensure
/// the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    // Initial schema setup
    conn.execute_batch(
        r#"
        -- Documents table
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            knowledge_base_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_key TEXT NOT NULL,
            content_type TEXT,
            file_hash TEXT,
            file_size INTEGER NOT NULL DEFAULT 0,
            format TEXT,
            text_file_key TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'UPLOADED',
            status_reason TEXT,
            active_execution_id TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            text_detection_job_id TEXT,
            text_detection_task_token TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(org_id, knowledge_base_id);
        CREATE INDEX IF NOT EXISTS idx_documents_job ON documents(text_detection_job_id);

        -- Chunk items produced by the chunking step
        CREATE TABLE IF NOT EXISTS document_chunks (
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_key TEXT NOT NULL,
            PRIMARY KEY (document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Workflow executions
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            knowledge_base_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            state TEXT NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            error TEXT,
            cause TEXT,
            attempt INTEGER NOT NULL DEFAULT 1,
            next_attempt_at TEXT NOT NULL,
            map_total INTEGER NOT NULL DEFAULT 0,
            map_completed INTEGER NOT NULL DEFAULT 0,
            deadline_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- At most one in-flight execution per document
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_in_flight
            ON executions(document_id) WHERE status IN ('RUNNING', 'WAITING');
        CREATE INDEX IF NOT EXISTS idx_executions_runnable
            ON executions(status, next_attempt_at);

        -- Append-only execution history
        CREATE TABLE IF NOT EXISTS execution_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            state TEXT,
            detail TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_execution_events_execution
            ON execution_events(execution_id, id);

        -- Task tokens for parked executions
        CREATE TABLE IF NOT EXISTS task_tokens (
            token TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            state TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            output TEXT,
            error TEXT,
            cause TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_task_tokens_execution ON task_tokens(execution_id);

        -- Per-chunk state of the indexing fan-out
        CREATE TABLE IF NOT EXISTS map_items (
            execution_id TEXT NOT NULL,
            item_index INTEGER NOT NULL,
            chunk_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            PRIMARY KEY (execution_id, item_index),
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        -- Vector index
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            org_id TEXT NOT NULL,
            knowledge_base_id TEXT NOT NULL,
            chunk_key TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunk_vectors_kb
            ON chunk_vectors(org_id, knowledge_base_id);
        "#,
    )
    .map_err(DatabaseError::Query)?;

    run_settings_table_migration(conn)?;

    Ok(())
}

/// Settings table backing the hot-reloadable dynamic config.
fn run_settings_table_migration(conn: &Connection) -> ServiceResult<()> {
    let has_settings: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='settings'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .map_err(DatabaseError::Query)?;

    if !has_settings {
        tracing::info!("Creating settings table");
        conn.execute_batch(
            r#"
            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )
        .map_err(|e| DatabaseError::Migration {
            message: format!("Failed to create settings table: {}", e),
        })?;
    }

    Ok(())
}
