//! Collaborator contracts shared by the trellis crates: conversation messages,
//! the model executor, tools and their registry.

mod error;
mod llm;
mod registry;
mod tool;
mod value;

pub use error::{ToolError, TrellisError};
pub use llm::{
    LlmRequest, LlmResponse, Message, ModelExecutor, Role, StreamAccumulator, StreamFrame,
    ToolCall, ToolSpec,
};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use tool::{
    encode_result, FunctionTool, FunctionToolBuilder, ParameterKind, Tool, ToolDescriptor,
    ToolParameter, TypedTool, TypedToolAdapter,
};
pub use value::{type_name_of, IntoValue, NodeValue, TryFromValue, Value};
