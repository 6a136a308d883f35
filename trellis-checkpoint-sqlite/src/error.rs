use thiserror::Error;
use trellis_graph::GraphError;

#[derive(Debug, Error)]
pub enum CheckpointSqlError {
    #[error("failed to connect to sqlite: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("checkpoint migration failed: {0}")]
    Migration(#[source] sqlx::Error),
    #[error("checkpoint query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt checkpoint row: {0}")]
    Corrupt(String),
}

impl From<CheckpointSqlError> for GraphError {
    fn from(error: CheckpointSqlError) -> Self {
        GraphError::Checkpoint(error.to_string())
    }
}
