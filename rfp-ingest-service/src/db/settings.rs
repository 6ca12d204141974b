//! Stored overrides for the hot-reloadable pipeline config.
//!
//! Keys are the dotted setting names (`chunking.max_chars`,
//! `pipeline.index_max_concurrency`, ...), values are JSON.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;
use tracing::warn;

use super::Database;
use super::models::format_timestamp;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Every stored override. A value that no longer parses is skipped, so
    /// the setting falls back to its file/env default.
    pub fn get_all_settings(&self) -> ServiceResult<HashMap<String, serde_json::Value>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT key, value FROM settings ORDER BY key")
            .map_err(DatabaseError::Query)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(DatabaseError::Query)?;

        let mut overrides = HashMap::new();
        for row in rows {
            let (key, raw) = row.map_err(DatabaseError::Query)?;
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    overrides.insert(key, value);
                }
                Err(e) => warn!(key = %key, error = %e, "Ignoring unreadable setting override"),
            }
        }

        Ok(overrides)
    }

    /// Apply a batch of overrides atomically. Null removes the override.
    pub fn set_settings(&self, updates: HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        let now = format_timestamp(&Utc::now());

        for (key, value) in updates {
            if value.is_null() {
                tx.execute("DELETE FROM settings WHERE key = ?1", params![key])
                    .map_err(DatabaseError::Query)?;
                continue;
            }

            let raw = serde_json::to_string(&value).map_err(DatabaseError::Serialization)?;
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, raw, now],
            )
            .map_err(DatabaseError::Query)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_override_reverts_to_default() {
        let db = Database::open_in_memory().unwrap();

        db.set_settings(HashMap::from([
            ("chunking.max_chars".to_string(), json!(1200)),
            ("embeddings.model".to_string(), json!("bge-m3")),
        ]))
        .unwrap();
        assert_eq!(db.get_all_settings().unwrap().len(), 2);

        db.set_settings(HashMap::from([(
            "chunking.max_chars".to_string(),
            serde_json::Value::Null,
        )]))
        .unwrap();

        let stored = db.get_all_settings().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["embeddings.model"], json!("bge-m3"));
    }

    #[test]
    fn test_unreadable_override_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        db.set_settings(HashMap::from([(
            "pipeline.index_max_concurrency".to_string(),
            json!(4),
        )]))
        .unwrap();
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES ('chunking.min_chars', '{oops', '')",
                [],
            )
            .unwrap();

        let stored = db.get_all_settings().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["pipeline.index_max_concurrency"], json!(4));
    }
}
