//! Document record operations.
//!
//! Pipeline writes go through [`Database::update_document`], a compare-and-swap
//! on `version` that only the document's active execution may perform.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::Database;
use super::models::{Document, format_timestamp};
use crate::error::{DatabaseError, PipelineError, ServiceResult};

impl Database {
    /// Insert a new document
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO documents (id, org_id, knowledge_base_id, file_name, file_key, content_type, file_hash, file_size, format, text_file_key, chunk_count, status, status_reason, active_execution_id, version, text_detection_job_id, text_detection_task_token, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                doc.id,
                doc.org_id,
                doc.knowledge_base_id,
                doc.file_name,
                doc.file_key,
                doc.content_type,
                doc.file_hash,
                doc.file_size as i64,
                doc.format.map(|f| f.as_str()),
                doc.text_file_key,
                doc.chunk_count as i64,
                doc.status.as_str(),
                doc.status_reason,
                doc.active_execution_id,
                doc.version,
                doc.text_detection_job_id,
                doc.text_detection_task_token,
                format_timestamp(&doc.created_at),
                format_timestamp(&doc.updated_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", Document::COLUMNS),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Find the document waiting on a text detection job
    pub fn find_document_by_text_detection_job(
        &self,
        job_id: &str,
    ) -> ServiceResult<Option<Document>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!(
                "SELECT {} FROM documents WHERE text_detection_job_id = ?1",
                Document::COLUMNS
            ),
            params![job_id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Check if a document with the given file_hash already exists in a
    /// knowledge base. Returns the document ID if found.
    pub fn get_document_by_hash(
        &self,
        org_id: &str,
        knowledge_base_id: &str,
        file_hash: &str,
    ) -> ServiceResult<Option<String>> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT id FROM documents WHERE org_id = ?1 AND knowledge_base_id = ?2 AND file_hash = ?3 AND status != 'FAILED'",
            params![org_id, knowledge_base_id, file_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Write the pipeline fields of `doc` on behalf of `execution_id`.
    ///
    /// Succeeds only if the stored version still equals `doc.version` and the
    /// execution owns the document. Returns the new version.
    pub fn update_document(&self, doc: &Document, execution_id: &str) -> ServiceResult<i64> {
        let conn = self.conn()?;
        write_document(&conn, doc, execution_id)
    }

    /// Store the job id next to the pending task token. No-op once the
    /// callback has already cleared the pair.
    ///
    /// Leaves `version` alone: a callback may already hold a snapshot of the
    /// document and its compare-and-swap must still succeed.
    pub fn record_text_detection_job(
        &self,
        document_id: &str,
        task_token: &str,
        job_id: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE documents SET text_detection_job_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND text_detection_task_token = ?4",
                params![job_id, format_timestamp(&Utc::now()), document_id, task_token],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Clear the job token pair once the callback has signalled the task.
    pub fn clear_text_detection_job(
        &self,
        document_id: &str,
        task_token: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE documents SET text_detection_job_id = NULL, text_detection_task_token = NULL, \
                 version = version + 1, updated_at = ?1 \
                 WHERE id = ?2 AND text_detection_task_token = ?3",
                params![format_timestamp(&Utc::now()), document_id, task_token],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }
}

/// Compare-and-swap write shared with transactional callers
pub(super) fn write_document(
    conn: &Connection,
    doc: &Document,
    execution_id: &str,
) -> ServiceResult<i64> {
    let rows = conn
        .execute(
            r#"
            UPDATE documents SET
                format = ?1, text_file_key = ?2, chunk_count = ?3, status = ?4, status_reason = ?5,
                text_detection_job_id = ?6, text_detection_task_token = ?7,
                version = version + 1, updated_at = ?8
            WHERE id = ?9 AND version = ?10 AND active_execution_id = ?11
            "#,
            params![
                doc.format.map(|f| f.as_str()),
                doc.text_file_key,
                doc.chunk_count as i64,
                doc.status.as_str(),
                doc.status_reason,
                doc.text_detection_job_id,
                doc.text_detection_task_token,
                format_timestamp(&Utc::now()),
                doc.id,
                doc.version,
                execution_id,
            ],
        )
        .map_err(DatabaseError::Query)?;

    if rows == 0 {
        return Err(PipelineError::StaleDocument {
            document_id: doc.id.clone(),
        }
        .into());
    }

    Ok(doc.version + 1)
}
