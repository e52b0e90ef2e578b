//! Embedding configuration rows.
//!
//! Configs are soft-deleted: a removed config flips `valid = 0` and its row
//! lingers until the background sweep has garbage-collected its chunks and
//! dropped its vector table.

use serde::{Deserialize, Serialize};

use super::{tx_err, Store, StoreError, StoreTx};

/// A desired embedding configuration, as supplied by the frontend or
/// settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    pub config_name: String,
    pub model_name: String,
    pub model_path: String,
    pub max_input_length: i64,
}

/// An `embedding_config` row.
#[derive(Debug, Clone)]
pub struct EmbeddingConfigRow {
    pub id: i64,
    pub config_name: String,
    pub model_name: String,
    pub model_path: String,
    pub max_input_length: i64,
    pub valid: bool,
}

impl EmbeddingConfigRow {
    fn matches(&self, config: &EmbeddingConfig) -> bool {
        self.config_name == config.config_name
            && self.model_name == config.model_name
            && self.model_path == config.model_path
            && self.max_input_length == config.max_input_length
    }
}

impl Store {
    pub fn valid_embedding_configs(&self) -> Result<Vec<EmbeddingConfigRow>, StoreError> {
        self.embedding_configs_where("valid = 1")
    }

    pub fn invalid_embedding_configs(&self) -> Result<Vec<EmbeddingConfigRow>, StoreError> {
        self.embedding_configs_where("valid = 0")
    }

    fn embedding_configs_where(
        &self,
        predicate: &str,
    ) -> Result<Vec<EmbeddingConfigRow>, StoreError> {
        let sql = format!(
            "SELECT id, config_name, model_name, model_path, max_input_length, valid
             FROM embedding_config WHERE {} ORDER BY id",
            predicate
        );
        self.block_on(async {
            let rows: Vec<(i64, String, String, String, i64, bool)> =
                sqlx::query_as(&sql).fetch_all(&self.pool).await?;
            Ok(rows
                .into_iter()
                .map(
                    |(id, config_name, model_name, model_path, max_input_length, valid)| {
                        EmbeddingConfigRow {
                            id,
                            config_name,
                            model_name,
                            model_path,
                            max_input_length,
                            valid,
                        }
                    },
                )
                .collect())
        })
    }

    /// Diff the stored configs against `configs`: insert rows for new
    /// configs, flip `valid = 0` for rows no longer wanted. A config
    /// matches only if all four attributes are equal, so editing any field
    /// retires the old row and creates a fresh embedding id.
    ///
    /// An empty slice is a no-op (the caller is reloading, not clearing).
    pub fn update_embedding_configs(
        &self,
        configs: &[EmbeddingConfig],
    ) -> Result<(), StoreError> {
        if configs.is_empty() {
            return Ok(());
        }
        let existing = self.embedding_configs_where("1 = 1")?;
        self.block_on(async {
            let mut tx = self.pool.begin().await.map_err(tx_err)?;

            let mut unmatched: Vec<&EmbeddingConfigRow> =
                existing.iter().filter(|row| row.valid).collect();
            for config in configs {
                if let Some(pos) = unmatched.iter().position(|row| row.matches(config)) {
                    unmatched.remove(pos);
                    continue;
                }
                sqlx::query(
                    "INSERT INTO embedding_config
                     (config_name, model_name, model_path, max_input_length)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&config.config_name)
                .bind(&config.model_name)
                .bind(&config.model_path)
                .bind(config.max_input_length)
                .execute(&mut *tx)
                .await?;
            }
            for row in unmatched {
                sqlx::query("UPDATE embedding_config SET valid = 0 WHERE id = ?1")
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await.map_err(tx_err)?;
            Ok(())
        })
    }
}

impl StoreTx<'_> {
    /// Remove a retired config row once its chunks are gone.
    pub fn delete_embedding_config(&mut self, id: i64) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query("DELETE FROM embedding_config WHERE id = ?1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected())
        })
    }
}
