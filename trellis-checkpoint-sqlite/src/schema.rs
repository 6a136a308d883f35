use sqlx::SqlitePool;

use crate::error::CheckpointSqlError;

pub const CHECKPOINTS_TABLE: &str = "checkpoints";

// `created_at` keeps the exact RFC 3339 text; `created_at_nanos` drives
// ordering and the `created_after` filter.
const CREATE_CHECKPOINTS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS checkpoints (\
    run_id TEXT NOT NULL,\
    checkpoint_id TEXT NOT NULL,\
    created_at TEXT NOT NULL,\
    created_at_nanos INTEGER NOT NULL,\
    node TEXT,\
    node_path_json TEXT NOT NULL,\
    subgraph_inputs_json TEXT NOT NULL DEFAULT '[]',\
    last_input_json TEXT NOT NULL,\
    last_input_type TEXT NOT NULL,\
    history_json TEXT NOT NULL,\
    executed_tool_calls_json TEXT NOT NULL DEFAULT '[]',\
    version INTEGER NOT NULL,\
    PRIMARY KEY (run_id, checkpoint_id)\
)";

const CREATE_CHECKPOINTS_ORDER_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS \
    checkpoints_run_order ON checkpoints (run_id, created_at_nanos, version)";

const MIGRATION_STATEMENTS_SQL: [&str; 2] = [
    CREATE_CHECKPOINTS_TABLE_SQL,
    CREATE_CHECKPOINTS_ORDER_INDEX_SQL,
];

/// Idempotent; safe to run on every connect.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), CheckpointSqlError> {
    for statement in MIGRATION_STATEMENTS_SQL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(CheckpointSqlError::Migration)?;
    }
    Ok(())
}
