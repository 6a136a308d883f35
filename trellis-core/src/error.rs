use thiserror::Error;

/// Failures reported by the collaborators the engine consumes: model executors
/// and tools.
#[derive(Debug, Error)]
pub enum TrellisError {
    #[error("Model executor failed: {0}")]
    ModelExecutor(String),
    #[error("Model returned an unusable response: {0}")]
    InvalidModelResponse(String),
    #[error("Tool call failed for '{tool_name}': {reason}")]
    ToolCallFailed { tool_name: String, reason: String },
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

/// Errors produced while decoding tool arguments or running a tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("result could not be encoded: {0}")]
    Encoding(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    /// Whether the failure happened before the tool body ran.
    pub fn is_validation(&self) -> bool {
        matches!(self, ToolError::InvalidArgs(_))
    }
}
