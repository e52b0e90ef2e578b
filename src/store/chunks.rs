//! Chunk row CRUD, plus the full-text rows that must move with them.
//!
//! Every mutation that touches a chunk row also touches its `text_search`
//! row inside the same transaction, so a search never observes a chunk
//! with one index presence but not the other.

use super::{Store, StoreError, StoreTx};

/// Chunk row as loaded for reconciliation: id, position, payload digest.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: i64,
    /// 1-based position; NULL while a reindex is parking the row.
    pub chunk_index: Option<i64>,
    pub content_hash: String,
}

/// A chunk about to be inserted for `(doc, embedding)`.
#[derive(Debug)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub content_hash: String,
    pub begin_line: i64,
    pub end_line: i64,
}

/// Move an existing chunk row to a new position (its index was parked at
/// NULL earlier in the same transaction).
#[derive(Debug)]
pub struct ReindexUpdate {
    pub chunk_id: i64,
    pub chunk_index: i64,
    pub begin_line: i64,
    pub end_line: i64,
}

impl Store {
    /// Existing chunk rows for one `(document, embedding)` pair.
    pub fn chunks_for(&self, doc_id: i64, embedding_id: i64) -> Result<Vec<ChunkRow>, StoreError> {
        self.block_on(async {
            let rows: Vec<(i64, Option<i64>, String)> = sqlx::query_as(
                "SELECT chunk_id, chunk_index, content_hash FROM chunks
                 WHERE doc_id = ?1 AND embedding_id = ?2",
            )
            .bind(doc_id)
            .bind(embedding_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|(chunk_id, chunk_index, content_hash)| ChunkRow {
                    chunk_id,
                    chunk_index,
                    content_hash,
                })
                .collect())
        })
    }

    pub fn chunk_ids_for_document(&self, doc_id: i64) -> Result<Vec<i64>, StoreError> {
        self.block_on(async {
            let rows: Vec<(i64,)> =
                sqlx::query_as("SELECT chunk_id FROM chunks WHERE doc_id = ?1")
                    .bind(doc_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }

    pub fn chunk_ids_for_embedding(&self, embedding_id: i64) -> Result<Vec<i64>, StoreError> {
        self.block_on(async {
            let rows: Vec<(i64,)> =
                sqlx::query_as("SELECT chunk_id FROM chunks WHERE embedding_id = ?1")
                    .bind(embedding_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }

    pub fn chunk_count(&self) -> Result<u64, StoreError> {
        self.block_on(async {
            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
                .fetch_one(&self.pool)
                .await?;
            Ok(row.0 as u64)
        })
    }
}

impl StoreTx<'_> {
    /// Park a chunk row's position at NULL so its uniqueness slot frees up
    /// for another row during a reindex shuffle.
    pub fn clear_chunk_index(&mut self, chunk_id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("UPDATE chunks SET chunk_index = NULL WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }

    pub fn apply_reindex(&mut self, update: &ReindexUpdate) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query(
                "UPDATE chunks SET chunk_index = ?1, begin_line = ?2, end_line = ?3
                 WHERE chunk_id = ?4",
            )
            .bind(update.chunk_index)
            .bind(update.begin_line)
            .bind(update.end_line)
            .bind(update.chunk_id)
            .execute(&mut **tx)
            .await?;
            Ok(result.rows_affected())
        })
    }

    pub fn delete_chunk(&mut self, chunk_id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("DELETE FROM chunks WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }

    /// Delete all chunk rows of a document, returning the count.
    pub fn delete_chunks_for_document(&mut self, doc_id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("DELETE FROM chunks WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }

    /// Insert a chunk row and return its id.
    pub fn insert_chunk(
        &mut self,
        doc_id: i64,
        embedding_id: i64,
        chunk: &NewChunk,
    ) -> Result<i64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query(
                "INSERT INTO chunks
                 (doc_id, embedding_id, chunk_index, content_hash, begin_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(doc_id)
            .bind(embedding_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content_hash)
            .bind(chunk.begin_line)
            .bind(chunk.end_line)
            .execute(&mut **tx)
            .await?;
            Ok(result.last_insert_rowid())
        })
    }

    /// Insert or replace the full-text row for a chunk. FTS5 has no
    /// INSERT OR REPLACE, so this is a delete followed by an insert.
    pub fn upsert_text_row(
        &mut self,
        chunk_id: i64,
        content: &str,
        metadata: &str,
    ) -> Result<(), StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            sqlx::query("DELETE FROM text_search WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
            sqlx::query(
                "INSERT INTO text_search (content, metadata, chunk_id) VALUES (?1, ?2, ?3)",
            )
            .bind(content)
            .bind(metadata)
            .bind(chunk_id)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
    }

    /// Delete the full-text row for a chunk, returning the count.
    pub fn delete_text_row(&mut self, chunk_id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("DELETE FROM text_search WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }
}
