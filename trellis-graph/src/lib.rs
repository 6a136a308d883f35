//! Typed graph runtime for LLM agents: graph builder, traversal, the feature
//! pipeline, and checkpoint/rollback.

mod checkpoint;
mod config;
mod context;
mod conversation;
mod edge;
mod error;
mod file_storage;
mod graph;
mod node;
pub mod nodes;
mod persistence;
pub mod pipeline;
mod position;
mod rollback;
mod runtime;
mod storage;
pub mod strategies;

pub use checkpoint::{
    sort_checkpoints, Checkpoint, CheckpointFilter, CheckpointStorage, InMemoryCheckpointStorage,
};
pub use config::{ExecutionConfig, ExecutionOptions};
pub use context::{AgentContext, CancelHandle, ResumeTarget};
pub use conversation::Conversation;
pub use edge::Route;
pub use error::{ErrorKind, GraphError};
pub use file_storage::FileCheckpointStorage;
pub use graph::{Graph, GraphBuilder, NodeHandle, SubgraphOptions, FINISH, START};
pub use node::{FnNode, GraphNode};
pub use persistence::{Persistence, PersistenceConfig, RollbackStrategy};
pub use position::{ExecutionPosition, PositionSnapshot};
pub use rollback::{RollbackToolRegistry, RollbackToolRegistryBuilder};
pub use runtime::run_graph;
pub use storage::{AgentStorage, StorageKey};
