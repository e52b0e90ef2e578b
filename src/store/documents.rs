//! Document row CRUD.

use super::{tx_err, Store, StoreError, StoreTx};

/// One row of the `documents` table. A row's existence means the file
/// existed on disk when `last_checked` was written.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: i64,
    pub doc_name: String,
    pub last_modified: Option<i64>,
    pub file_size: Option<i64>,
    pub content_hash: Option<String>,
    pub last_checked: Option<i64>,
}

impl Store {
    pub fn document_by_name(&self, name: &str) -> Result<Option<DocumentRow>, StoreError> {
        self.block_on(async {
            let row: Option<(i64, String, Option<i64>, Option<i64>, Option<String>, Option<i64>)> =
                sqlx::query_as(
                    "SELECT id, doc_name, last_modified, file_size, content_hash, last_checked
                     FROM documents WHERE doc_name = ?1",
                )
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(
                |(id, doc_name, last_modified, file_size, content_hash, last_checked)| {
                    DocumentRow {
                        id,
                        doc_name,
                        last_modified,
                        file_size,
                        content_hash,
                        last_checked,
                    }
                },
            ))
        })
    }

    /// All registered document names (relative paths).
    pub fn document_names(&self) -> Result<Vec<String>, StoreError> {
        self.block_on(async {
            let rows: Vec<(String,)> = sqlx::query_as("SELECT doc_name FROM documents")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.into_iter().map(|(name,)| name).collect())
        })
    }

    pub fn document_count(&self) -> Result<u64, StoreError> {
        self.block_on(async {
            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
                .fetch_one(&self.pool)
                .await?;
            Ok(row.0 as u64)
        })
    }

    /// Insert a placeholder row so the new document has an id before its
    /// chunks are written. Committed immediately in its own transaction.
    pub fn insert_document_placeholder(&self, name: &str) -> Result<i64, StoreError> {
        self.block_on(async {
            let mut tx = self.pool.begin().await.map_err(tx_err)?;
            let result = sqlx::query("INSERT INTO documents (doc_name) VALUES (?1)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            let id = result.last_insert_rowid();
            tx.commit().await.map_err(tx_err)?;
            Ok(id)
        })
    }

    /// Refresh a document row after its chunks were synchronized. Returns
    /// the number of updated rows (0 means the row vanished under us).
    pub fn update_document(
        &self,
        doc_id: i64,
        name: &str,
        last_modified: i64,
        file_size: i64,
        content_hash: &str,
        last_checked: i64,
    ) -> Result<u64, StoreError> {
        self.block_on(async {
            let result = sqlx::query(
                "UPDATE documents
                 SET doc_name = ?1, last_modified = ?2, file_size = ?3,
                     content_hash = ?4, last_checked = ?5
                 WHERE id = ?6",
            )
            .bind(name)
            .bind(last_modified)
            .bind(file_size)
            .bind(content_hash)
            .bind(last_checked)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }
}

impl StoreTx<'_> {
    /// Delete a document row; returns changed-row count so the caller can
    /// assert exactly one.
    pub fn delete_document(&mut self, doc_id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
                .bind(doc_id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }
}
