//! Chunk items and the vector index.
//!
//! Chunk items are recorded per document by the chunking step; vectors are
//! upserted per (document, chunk index) by the indexing fan-out.

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};

use super::Database;
use super::documents::write_document;
use super::models::{ChunkItem, ChunkVector, Document, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Replace the chunk items of a document and write the document (status,
    /// `chunk_count`) in one transaction. Returns the new document version.
    pub fn record_document_chunks(
        &self,
        doc: &Document,
        execution_id: &str,
        items: &[ChunkItem],
    ) -> ServiceResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let version = write_document(&tx, doc, execution_id)?;

        tx.execute(
            "DELETE FROM document_chunks WHERE document_id = ?1",
            params![doc.id],
        )
        .map_err(DatabaseError::Query)?;

        for item in items {
            tx.execute(
                "INSERT INTO document_chunks (document_id, chunk_index, chunk_key) VALUES (?1, ?2, ?3)",
                params![doc.id, item.index as i64, item.chunk_key],
            )
            .map_err(DatabaseError::Query)?;
        }

        // Vectors of chunks that no longer exist
        tx.execute(
            "DELETE FROM chunk_vectors WHERE document_id = ?1 AND chunk_index >= ?2",
            params![doc.id, items.len() as i64],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(version)
    }

    /// Chunk items of a document in index order
    pub fn list_document_chunks(&self, document_id: &str) -> ServiceResult<Vec<ChunkItem>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT chunk_key, chunk_index FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![document_id], |row| {
                let index: i64 = row.get(1)?;
                Ok(ChunkItem {
                    chunk_key: row.get(0)?,
                    index: index as usize,
                })
            })
            .map_err(DatabaseError::Query)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(items)
    }

    /// Insert or replace the vector of one chunk
    pub fn upsert_chunk_vector(&self, vector: &ChunkVector) -> ServiceResult<()> {
        let conn = self.conn()?;

        // Convert f32 slice to bytes
        let embedding_bytes: Vec<u8> = vector
            .embedding
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();

        conn.execute(
            r#"
            INSERT INTO chunk_vectors (document_id, chunk_index, org_id, knowledge_base_id, chunk_key, content, embedding, model, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                org_id = excluded.org_id,
                knowledge_base_id = excluded.knowledge_base_id,
                chunk_key = excluded.chunk_key,
                content = excluded.content,
                embedding = excluded.embedding,
                model = excluded.model,
                updated_at = excluded.updated_at
            "#,
            params![
                vector.document_id,
                vector.chunk_index as i64,
                vector.org_id,
                vector.knowledge_base_id,
                vector.chunk_key,
                vector.content,
                embedding_bytes,
                vector.model,
                format_timestamp(&Utc::now()),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Vectors of a document in chunk order
    pub fn list_chunk_vectors(&self, document_id: &str) -> ServiceResult<Vec<ChunkVector>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT document_id, chunk_index, org_id, knowledge_base_id, chunk_key, content, embedding, model, updated_at \
                 FROM chunk_vectors WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![document_id], ChunkVector::from_row)
            .map_err(DatabaseError::Query)?;

        let mut vectors = Vec::new();
        for row in rows {
            vectors.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DocumentStatus;
    use crate::test_support::sample_document;

    fn vector(index: usize, value: f32) -> ChunkVector {
        ChunkVector {
            document_id: "d1".to_string(),
            chunk_index: index,
            org_id: "o1".to_string(),
            knowledge_base_id: "kb1".to_string(),
            chunk_key: format!("chunks/o1/kb1/d1/{:05}.txt", index),
            content: format!("chunk {}", index),
            embedding: vec![value, -value, 0.5],
            model: "nomic-embed-text".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_vector_upsert_replaces_by_key() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();

        db.upsert_chunk_vector(&vector(0, 1.0)).unwrap();
        db.upsert_chunk_vector(&vector(1, 2.0)).unwrap();
        db.upsert_chunk_vector(&vector(0, 3.0)).unwrap();

        let vectors = db.list_chunk_vectors("d1").unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].embedding, vec![3.0, -3.0, 0.5]);
        assert_eq!(vectors[1].chunk_index, 1);
    }

    #[test]
    fn test_record_chunks_replaces_previous_run() {
        let db = Database::open_in_memory().unwrap();
        let mut doc = sample_document("d1");
        doc.active_execution_id = Some("exec-1".to_string());
        db.insert_document(&doc).unwrap();
        db.upsert_chunk_vector(&vector(0, 1.0)).unwrap();
        db.upsert_chunk_vector(&vector(5, 1.0)).unwrap();

        let items: Vec<ChunkItem> = (0..2)
            .map(|index| ChunkItem {
                chunk_key: format!("chunks/o1/kb1/d1/{:05}.txt", index),
                index,
            })
            .collect();
        doc.status = DocumentStatus::Chunked;
        doc.chunk_count = items.len();
        db.record_document_chunks(&doc, "exec-1", &items).unwrap();

        assert_eq!(db.list_document_chunks("d1").unwrap(), items);
        let stored = db.get_document("d1").unwrap().unwrap();
        assert_eq!(stored.chunk_count, 2);
        assert_eq!(stored.status, DocumentStatus::Chunked);
        // The stale vector past the new chunk count is gone
        assert_eq!(db.list_chunk_vectors("d1").unwrap().len(), 1);
    }
}
