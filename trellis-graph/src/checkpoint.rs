use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_core::{Message, Value};

use crate::GraphError;

/// Immutable snapshot of a run: history plus the position to resume at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    /// Enclosing subgraph names followed by the leaf node name.
    pub node_path: Vec<String>,
    /// Input of each enclosing subgraph node, outermost first; one entry per
    /// `node_path` element before the leaf.
    #[serde(default)]
    pub subgraph_inputs: Vec<Value>,
    pub last_input: Value,
    pub last_input_type: String,
    pub history: Vec<Message>,
    /// Ids of the tool calls that had run on the recording context when the
    /// node started.
    #[serde(default)]
    pub executed_tool_calls: Vec<String>,
    pub version: u64,
}

impl Checkpoint {
    pub fn node(&self) -> Option<&str> {
        self.node_path.last().map(String::as_str)
    }
}

/// Selects checkpoints by leaf node name and creation time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckpointFilter {
    pub node: Option<String>,
    /// Exclusive lower bound.
    pub created_after: Option<DateTime<Utc>>,
}

impl CheckpointFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn node(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            created_after: None,
        }
    }

    pub fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.created_after = Some(instant);
        self
    }

    pub fn matches(&self, checkpoint: &Checkpoint) -> bool {
        if let Some(node) = &self.node {
            if checkpoint.node() != Some(node.as_str()) {
                return false;
            }
        }
        match self.created_after {
            Some(after) => checkpoint.created_at > after,
            None => true,
        }
    }
}

/// Orders oldest first; ties broken by version.
pub fn sort_checkpoints(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.version.cmp(&b.version))
    });
}

/// Where checkpoints live. Implementations must return checkpoints oldest
/// first.
#[async_trait::async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn save_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint)
        -> Result<(), GraphError>;

    async fn get_checkpoints(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, GraphError>;

    async fn get_latest_checkpoint(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Option<Checkpoint>, GraphError> {
        Ok(self.get_checkpoints(run_id, filter).await?.pop())
    }

    /// Returns whether a checkpoint was removed.
    async fn delete_checkpoint(&self, run_id: &str, checkpoint_id: &str)
        -> Result<bool, GraphError>;
}

#[derive(Clone, Default)]
pub struct InMemoryCheckpointStorage {
    inner: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), GraphError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| GraphError::Checkpoint("lock".into()))?;
        let run = guard.entry(run_id.to_string()).or_default();
        run.retain(|existing| existing.checkpoint_id != checkpoint.checkpoint_id);
        run.push(checkpoint.clone());
        sort_checkpoints(run);
        Ok(())
    }

    async fn get_checkpoints(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, GraphError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| GraphError::Checkpoint("lock".into()))?;
        Ok(guard
            .get(run_id)
            .map(|run| {
                run.iter()
                    .filter(|checkpoint| filter.matches(checkpoint))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, GraphError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| GraphError::Checkpoint("lock".into()))?;
        let Some(run) = guard.get_mut(run_id) else {
            return Ok(false);
        };
        let before = run.len();
        run.retain(|checkpoint| checkpoint.checkpoint_id != checkpoint_id);
        Ok(run.len() != before)
    }
}
