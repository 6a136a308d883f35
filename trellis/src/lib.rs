//! Umbrella crate for Trellis.
//!
//! Core types are re-exported at the root; the graph runtime, the agent
//! facade and the sqlite checkpoint storage sit behind the `graph`, `agent`
//! and `sqlite` features.

pub use trellis_core::*;

#[cfg(feature = "agent")]
pub use trellis_agent as agent;
#[cfg(feature = "graph")]
pub use trellis_graph as graph;
#[cfg(feature = "sqlite")]
pub use trellis_checkpoint_sqlite as sqlite;

pub mod prelude {
    pub use trellis_core::{
        FunctionTool, LlmRequest, LlmResponse, Message, ModelExecutor, ParameterKind, Role,
        Tool, ToolCall, ToolParameter, ToolRegistry, TrellisError,
    };

    #[cfg(feature = "graph")]
    pub use trellis_graph::{
        run_graph, AgentContext, ErrorKind, GraphBuilder, GraphError, Persistence,
        PersistenceConfig, RollbackStrategy, Route, SubgraphOptions,
    };

    #[cfg(feature = "agent")]
    pub use trellis_agent::{
        Agent, AgentBuilder, AgentState, EventHandler, EventHandlerConfig, TraceConfig,
        TraceFeature,
    };

    #[cfg(feature = "sqlite")]
    pub use trellis_checkpoint_sqlite::SqliteCheckpointStorage;
}
