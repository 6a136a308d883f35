//! SQLite-backed [`CheckpointStorage`] for Trellis agents.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), trellis_checkpoint_sqlite::CheckpointSqlError> {
//! use trellis_checkpoint_sqlite::SqliteCheckpointStorage;
//!
//! let storage = SqliteCheckpointStorage::builder("sqlite://checkpoints.db?mode=rwc")
//!     .max_connections(4)
//!     .build()
//!     .await?;
//! # let _ = storage;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod schema;

use std::convert::TryFrom;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use trellis_graph::{Checkpoint, CheckpointFilter, CheckpointStorage, GraphError};

pub use error::CheckpointSqlError;
pub use schema::run_migrations;

const UPSERT_CHECKPOINT_SQL: &str = "INSERT OR REPLACE INTO checkpoints (\
    run_id, checkpoint_id, created_at, created_at_nanos, node, node_path_json, \
    subgraph_inputs_json, last_input_json, last_input_type, history_json, \
    executed_tool_calls_json, version\
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_CHECKPOINTS_SQL: &str = "SELECT checkpoint_id, created_at, node_path_json, \
    subgraph_inputs_json, last_input_json, last_input_type, history_json, \
    executed_tool_calls_json, version \
    FROM checkpoints \
    WHERE run_id = ? \
    AND (? IS NULL OR node = ?) \
    AND (? IS NULL OR created_at_nanos > ?) \
    ORDER BY created_at_nanos ASC, version ASC";

const SELECT_LATEST_CHECKPOINT_SQL: &str = "SELECT checkpoint_id, created_at, node_path_json, \
    subgraph_inputs_json, last_input_json, last_input_type, history_json, \
    executed_tool_calls_json, version \
    FROM checkpoints \
    WHERE run_id = ? \
    AND (? IS NULL OR node = ?) \
    AND (? IS NULL OR created_at_nanos > ?) \
    ORDER BY created_at_nanos DESC, version DESC \
    LIMIT 1";

#[derive(Debug, Clone)]
pub struct SqliteCheckpointStorage {
    pool: sqlx::SqlitePool,
}

#[derive(Debug, Clone)]
pub struct SqliteCheckpointStorageBuilder {
    database_url: String,
    max_connections: u32,
}

impl SqliteCheckpointStorage {
    pub fn builder(database_url: impl Into<String>) -> SqliteCheckpointStorageBuilder {
        SqliteCheckpointStorageBuilder {
            database_url: database_url.into(),
            max_connections: 1,
        }
    }

    /// Wraps an existing pool and brings its schema up to date.
    pub async fn from_pool(pool: sqlx::SqlitePool) -> Result<Self, CheckpointSqlError> {
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Removes every checkpoint of a run and returns how many were dropped.
    pub async fn delete_run(&self, run_id: &str) -> Result<u64, CheckpointSqlError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointSqlError> {
        let created_at_nanos = checkpoint.created_at.timestamp_nanos_opt().ok_or_else(|| {
            CheckpointSqlError::Corrupt(format!(
                "created_at {} is outside the storable range",
                checkpoint.created_at
            ))
        })?;
        let version = i64::try_from(checkpoint.version).map_err(|_| {
            CheckpointSqlError::Corrupt(format!(
                "version {} does not fit into i64",
                checkpoint.version
            ))
        })?;

        sqlx::query(UPSERT_CHECKPOINT_SQL)
            .bind(run_id)
            .bind(&checkpoint.checkpoint_id)
            .bind(
                checkpoint
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            )
            .bind(created_at_nanos)
            .bind(checkpoint.node())
            .bind(serde_json::to_string(&checkpoint.node_path)?)
            .bind(serde_json::to_string(&checkpoint.subgraph_inputs)?)
            .bind(serde_json::to_string(&checkpoint.last_input)?)
            .bind(&checkpoint.last_input_type)
            .bind(serde_json::to_string(&checkpoint.history)?)
            .bind(serde_json::to_string(&checkpoint.executed_tool_calls)?)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select(
        &self,
        sql: &'static str,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, CheckpointSqlError> {
        let created_after = match filter.created_after {
            Some(instant) => Some(instant.timestamp_nanos_opt().ok_or_else(|| {
                CheckpointSqlError::Corrupt(format!("{instant} is outside the storable range"))
            })?),
            None => None,
        };

        let rows = sqlx::query(sql)
            .bind(run_id)
            .bind(filter.node.as_deref())
            .bind(filter.node.as_deref())
            .bind(created_after)
            .bind(created_after)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(checkpoint_from_row).collect()
    }
}

impl SqliteCheckpointStorageBuilder {
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub async fn build(self) -> Result<SqliteCheckpointStorage, CheckpointSqlError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(CheckpointSqlError::Connection)?;

        run_migrations(&pool).await?;
        tracing::debug!(
            max_connections = self.max_connections,
            "sqlite checkpoint storage ready"
        );

        Ok(SqliteCheckpointStorage { pool })
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, CheckpointSqlError> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|err| CheckpointSqlError::Corrupt(format!("invalid created_at: {err}")))?;
    let version: i64 = row.try_get("version")?;
    let version = u64::try_from(version)
        .map_err(|_| CheckpointSqlError::Corrupt(format!("negative version {version}")))?;

    Ok(Checkpoint {
        checkpoint_id: row.try_get("checkpoint_id")?,
        created_at,
        node_path: serde_json::from_str(&row.try_get::<String, _>("node_path_json")?)?,
        subgraph_inputs: serde_json::from_str(
            &row.try_get::<String, _>("subgraph_inputs_json")?,
        )?,
        last_input: serde_json::from_str(&row.try_get::<String, _>("last_input_json")?)?,
        last_input_type: row.try_get("last_input_type")?,
        history: serde_json::from_str(&row.try_get::<String, _>("history_json")?)?,
        executed_tool_calls: serde_json::from_str(
            &row.try_get::<String, _>("executed_tool_calls_json")?,
        )?,
        version,
    })
}

#[async_trait::async_trait]
impl CheckpointStorage for SqliteCheckpointStorage {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), GraphError> {
        Ok(self.insert(run_id, checkpoint).await?)
    }

    async fn get_checkpoints(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, GraphError> {
        Ok(self.select(SELECT_CHECKPOINTS_SQL, run_id, filter).await?)
    }

    async fn get_latest_checkpoint(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Option<Checkpoint>, GraphError> {
        let mut latest = self
            .select(SELECT_LATEST_CHECKPOINT_SQL, run_id, filter)
            .await?;
        Ok(latest.pop())
    }

    async fn delete_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, GraphError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ? AND checkpoint_id = ?")
            .bind(run_id)
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await
            .map_err(CheckpointSqlError::from)?;
        Ok(result.rows_affected() > 0)
    }
}
