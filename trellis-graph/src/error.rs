use serde::Serialize;
use thiserror::Error;
use trellis_core::TrellisError;

use crate::pipeline::EventKind;

/// Coarse category of a [`GraphError`], stable across wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Configuration,
    ToolValidation,
    ToolExecution,
    ModelCall,
    DeadEnd,
    Checkpoint,
    Restore,
    Interceptor,
    Node,
    StepLimit,
    Cancelled,
    Serialization,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("tool '{tool}' rejected the call: {reason}")]
    ToolValidation { tool: String, reason: String },
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecution { tool: String, reason: String },
    #[error("model call failed: {0}")]
    ModelCall(String),
    #[error("no outgoing edge matched the output of '{node}'")]
    DeadEnd { node: String },
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error(
        "feature '{feature}' failed while handling {kind:?}{}",
        reporting_suffix(.reported)
    )]
    Interceptor {
        feature: String,
        kind: EventKind,
        #[source]
        source: Box<GraphError>,
        /// The node or run failure that was being reported when the
        /// interceptor failed.
        reported: Option<Box<GraphError>>,
    },
    #[error("node failed: {node}")]
    NodeFailed {
        node: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Max steps exceeded: reached {reached}, limit {max}")]
    MaxStepsExceeded { max: usize, reached: usize },
    #[error("run was cancelled")]
    Cancelled,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    pub fn custom(message: impl Into<String>) -> Self {
        GraphError::Custom(message.into())
    }

    /// Wraps any error raised by user node code.
    pub fn node(
        node: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        GraphError::NodeFailed {
            node: node.into(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Configuration(_) => ErrorKind::Configuration,
            GraphError::ToolValidation { .. } => ErrorKind::ToolValidation,
            GraphError::ToolExecution { .. } => ErrorKind::ToolExecution,
            GraphError::ModelCall(_) => ErrorKind::ModelCall,
            GraphError::DeadEnd { .. } => ErrorKind::DeadEnd,
            GraphError::Checkpoint(_) => ErrorKind::Checkpoint,
            GraphError::Restore(_) => ErrorKind::Restore,
            GraphError::Interceptor { .. } => ErrorKind::Interceptor,
            // A wrapped engine error keeps its own category.
            GraphError::NodeFailed { source, .. } => source
                .downcast_ref::<GraphError>()
                .map(GraphError::kind)
                .unwrap_or(ErrorKind::Node),
            GraphError::MaxStepsExceeded { .. } => ErrorKind::StepLimit,
            GraphError::Cancelled => ErrorKind::Cancelled,
            GraphError::Serialization(_) => ErrorKind::Serialization,
            GraphError::Custom(_) => ErrorKind::Node,
        }
    }

    /// Turns an interceptor error raised while `failure` was being reported
    /// into the run's error, keeping `failure` attached.
    pub(crate) fn while_reporting(self, failure: GraphError) -> Self {
        match self {
            GraphError::Interceptor {
                feature,
                kind,
                source,
                ..
            } => GraphError::Interceptor {
                feature,
                kind,
                source,
                reported: Some(Box::new(failure)),
            },
            other => other,
        }
    }

    /// Node path the error was raised at, when the runtime recorded one.
    pub fn node_path(&self) -> Option<&str> {
        match self {
            GraphError::NodeFailed { node, .. } | GraphError::DeadEnd { node } => Some(node),
            _ => None,
        }
    }

    /// Attaches the failing node path unless the error already carries its
    /// own position or must stay recognisable to callers.
    pub(crate) fn at_node(self, path: &str) -> Self {
        match self {
            GraphError::NodeFailed { .. }
            | GraphError::DeadEnd { .. }
            | GraphError::MaxStepsExceeded { .. }
            | GraphError::Cancelled
            | GraphError::Interceptor { .. }
            | GraphError::Restore(_) => self,
            other => GraphError::NodeFailed {
                node: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

fn reporting_suffix(reported: &Option<Box<GraphError>>) -> String {
    match reported {
        Some(failure) => format!(" while reporting: {failure}"),
        None => String::new(),
    }
}

impl From<TrellisError> for GraphError {
    fn from(error: TrellisError) -> Self {
        match error {
            TrellisError::ModelExecutor(reason) | TrellisError::InvalidModelResponse(reason) => {
                GraphError::ModelCall(reason)
            }
            TrellisError::ToolCallFailed { tool_name, reason } => GraphError::ToolExecution {
                tool: tool_name,
                reason,
            },
            TrellisError::UnknownTool(tool) => GraphError::ToolValidation {
                tool,
                reason: "tool is not available in this scope".to_string(),
            },
            TrellisError::DuplicateTool(name) => {
                GraphError::Configuration(format!("duplicate tool name: {name}"))
            }
            TrellisError::InvalidConfig(reason) => GraphError::Configuration(reason),
            TrellisError::Cancelled => GraphError::Cancelled,
            TrellisError::Serde(err) => GraphError::Serialization(err),
            TrellisError::Custom(message) => GraphError::Custom(message),
        }
    }
}
