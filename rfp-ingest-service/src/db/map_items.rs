//! Indexing fan-out bookkeeping.
//!
//! Completion is counted explicitly: each item that succeeds bumps
//! `executions.map_completed` in the same transaction, and the item whose
//! increment reaches `map_total` flips the document to INDEXED.

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};

use super::Database;
use super::models::{ChunkItem, MapItem, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};

/// Counter state after an item completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapProgress {
    pub completed: usize,
    pub total: usize,
    /// True only for the single completion that marked the document INDEXED
    pub document_indexed: bool,
}

impl Database {
    /// Create one PENDING item per chunk unless the items already exist, and
    /// set the execution's `map_total`. Returns all items of the execution.
    pub fn create_map_items(
        &self,
        execution_id: &str,
        items: &[ChunkItem],
    ) -> ServiceResult<Vec<MapItem>> {
        {
            let mut conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(DatabaseError::Query)?;

            for item in items {
                tx.execute(
                    "INSERT OR IGNORE INTO map_items (execution_id, item_index, chunk_key, status, attempts) \
                     VALUES (?1, ?2, ?3, 'PENDING', 0)",
                    params![execution_id, item.index as i64, item.chunk_key],
                )
                .map_err(DatabaseError::Query)?;
            }

            tx.execute(
                "UPDATE executions SET map_total = ?1, \
                 map_completed = (SELECT COUNT(*) FROM map_items WHERE execution_id = ?2 AND status = 'SUCCEEDED'), \
                 updated_at = ?3 WHERE id = ?2",
                params![items.len() as i64, execution_id, format_timestamp(&Utc::now())],
            )
            .map_err(DatabaseError::Query)?;

            tx.commit().map_err(DatabaseError::Query)?;
        }

        self.list_map_items(execution_id)
    }

    /// All items of an execution in chunk order
    pub fn list_map_items(&self, execution_id: &str) -> ServiceResult<Vec<MapItem>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT execution_id, item_index, chunk_key, status, attempts, error \
                 FROM map_items WHERE execution_id = ?1 ORDER BY item_index",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![execution_id], MapItem::from_row)
            .map_err(DatabaseError::Query)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(items)
    }

    /// Reset FAILED items to PENDING so a new attempt of the Map state
    /// picks them up again
    pub fn reset_failed_map_items(&self, execution_id: &str) -> ServiceResult<usize> {
        let conn = self.conn()?;

        conn.execute(
            "UPDATE map_items SET status = 'PENDING', error = NULL WHERE execution_id = ?1 AND status = 'FAILED'",
            params![execution_id],
        )
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Mark an item SUCCEEDED and count it.
    ///
    /// Idempotent per item: a second completion of the same item does not
    /// increment the counter again.
    pub fn complete_map_item(
        &self,
        execution_id: &str,
        item_index: usize,
        attempts: u32,
    ) -> ServiceResult<MapProgress> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let changed = tx
            .execute(
                "UPDATE map_items SET status = 'SUCCEEDED', attempts = ?1, error = NULL \
                 WHERE execution_id = ?2 AND item_index = ?3 AND status != 'SUCCEEDED'",
                params![attempts as i64, execution_id, item_index as i64],
            )
            .map_err(DatabaseError::Query)?;

        if changed > 0 {
            tx.execute(
                "UPDATE executions SET map_completed = map_completed + 1, updated_at = ?1 WHERE id = ?2",
                params![format_timestamp(&Utc::now()), execution_id],
            )
            .map_err(DatabaseError::Query)?;
        }

        let (completed, total, document_id): (i64, i64, String) = tx
            .query_row(
                "SELECT map_completed, map_total, document_id FROM executions WHERE id = ?1",
                params![execution_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(DatabaseError::Query)?;

        let mut document_indexed = false;
        if changed > 0 && completed == total {
            let rows = tx
                .execute(
                    "UPDATE documents SET status = 'INDEXED', status_reason = NULL, version = version + 1, updated_at = ?1 \
                     WHERE id = ?2 AND active_execution_id = ?3 AND status = 'CHUNKED'",
                    params![format_timestamp(&Utc::now()), document_id, execution_id],
                )
                .map_err(DatabaseError::Query)?;
            document_indexed = rows > 0;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(MapProgress {
            completed: completed as usize,
            total: total as usize,
            document_indexed,
        })
    }

    /// Record a failed attempt of an item
    pub fn fail_map_item(
        &self,
        execution_id: &str,
        item_index: usize,
        attempts: u32,
        error: &str,
    ) -> ServiceResult<()> {
        let conn = self.conn()?;

        conn.execute(
            "UPDATE map_items SET status = 'FAILED', attempts = ?1, error = ?2 \
             WHERE execution_id = ?3 AND item_index = ?4 AND status != 'SUCCEEDED'",
            params![attempts as i64, error, execution_id, item_index as i64],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DocumentStatus, MapItemStatus};
    use crate::test_support::{sample_document, sample_execution};

    fn chunked_db(total: usize) -> (Database, Vec<ChunkItem>) {
        let db = Database::open_in_memory().unwrap();
        let mut doc = sample_document("d1");
        doc.status = DocumentStatus::Chunked;
        db.insert_document(&doc).unwrap();
        db.create_execution(&sample_execution("exec-1", "d1")).unwrap();

        let items: Vec<ChunkItem> = (0..total)
            .map(|index| ChunkItem {
                chunk_key: format!("chunks/o1/kb1/d1/{:05}.txt", index),
                index,
            })
            .collect();
        db.create_map_items("exec-1", &items).unwrap();
        (db, items)
    }

    #[test]
    fn test_completion_counter_ignores_order() {
        let (db, _) = chunked_db(3);

        // Finish out of input order; only the third completion flips the doc
        let first = db.complete_map_item("exec-1", 2, 1).unwrap();
        assert_eq!((first.completed, first.total), (1, 3));
        assert!(!first.document_indexed);

        let second = db.complete_map_item("exec-1", 0, 1).unwrap();
        assert!(!second.document_indexed);
        assert_eq!(
            db.get_document("d1").unwrap().unwrap().status,
            DocumentStatus::Chunked
        );

        let third = db.complete_map_item("exec-1", 1, 2).unwrap();
        assert_eq!(third.completed, 3);
        assert!(third.document_indexed);
        assert_eq!(
            db.get_document("d1").unwrap().unwrap().status,
            DocumentStatus::Indexed
        );
    }

    #[test]
    fn test_duplicate_completion_is_not_counted() {
        let (db, _) = chunked_db(2);

        db.complete_map_item("exec-1", 0, 1).unwrap();
        let again = db.complete_map_item("exec-1", 0, 1).unwrap();
        assert_eq!(again.completed, 1);
        assert!(!again.document_indexed);
    }

    #[test]
    fn test_create_is_idempotent_and_resets_failures() {
        let (db, items) = chunked_db(2);
        db.complete_map_item("exec-1", 0, 1).unwrap();
        db.fail_map_item("exec-1", 1, 3, "embedder down").unwrap();

        let again = db.create_map_items("exec-1", &items).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].status, MapItemStatus::Succeeded);
        assert_eq!(again[1].status, MapItemStatus::Failed);
        assert_eq!(again[1].error.as_deref(), Some("embedder down"));

        assert_eq!(db.reset_failed_map_items("exec-1").unwrap(), 1);
        let execution = db.get_execution("exec-1").unwrap().unwrap();
        assert_eq!((execution.map_completed, execution.map_total), (1, 2));
    }
}
