use serde::Serialize;
use trellis_core::{LlmRequest, LlmResponse, StreamFrame, ToolCall, Value};
use uuid::Uuid;

use crate::ErrorKind;

/// Discriminant of [`LifecycleEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    RunStarting,
    RunCompleted,
    RunFailed,
    NodeStarting,
    NodeCompleted,
    NodeFailed,
    LlmCallStarting,
    LlmCallCompleted,
    LlmStreamFrame,
    ToolCallStarting,
    ToolValidationFailed,
    ToolCallFailed,
    ToolCallSucceeded,
}

/// Payload types that can be intercepted individually.
pub trait EventPayload: Send + Sync + 'static {
    const KIND: EventKind;

    fn extract(event: &LifecycleEvent) -> Option<&Self>;

    fn into_event(self) -> LifecycleEvent;
}

#[derive(Clone, Debug, Serialize)]
pub struct RunStarting {
    pub run_id: String,
    pub input: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunCompleted {
    pub run_id: String,
    pub output: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunFailed {
    pub run_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStarting {
    pub node: String,
    pub node_path: Vec<String>,
    pub step_id: Uuid,
    pub parent_step_id: Uuid,
    pub input: Value,
    pub input_type: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeCompleted {
    pub node: String,
    pub node_path: Vec<String>,
    pub step_id: Uuid,
    pub parent_step_id: Uuid,
    pub input: Value,
    pub input_type: String,
    pub output: Value,
    pub output_type: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeFailed {
    pub node: String,
    pub node_path: Vec<String>,
    pub step_id: Uuid,
    pub parent_step_id: Uuid,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LlmCallStarting {
    pub step_id: Uuid,
    pub model: String,
    pub request: LlmRequest,
}

#[derive(Clone, Debug, Serialize)]
pub struct LlmCallCompleted {
    pub step_id: Uuid,
    pub model: String,
    pub response: LlmResponse,
}

#[derive(Clone, Debug, Serialize)]
pub struct LlmStreamFrame {
    pub step_id: Uuid,
    pub model: String,
    pub frame: StreamFrame,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallStarting {
    pub step_id: Uuid,
    pub call: ToolCall,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolValidationFailed {
    pub step_id: Uuid,
    pub call: ToolCall,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallFailed {
    pub step_id: Uuid,
    pub call: ToolCall,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallSucceeded {
    pub step_id: Uuid,
    pub call: ToolCall,
    pub result: Value,
}

/// Every event the runtime and the distinguished nodes fire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RunStarting(RunStarting),
    RunCompleted(RunCompleted),
    RunFailed(RunFailed),
    NodeStarting(NodeStarting),
    NodeCompleted(NodeCompleted),
    NodeFailed(NodeFailed),
    LlmCallStarting(LlmCallStarting),
    LlmCallCompleted(LlmCallCompleted),
    LlmStreamFrame(LlmStreamFrame),
    ToolCallStarting(ToolCallStarting),
    ToolValidationFailed(ToolValidationFailed),
    ToolCallFailed(ToolCallFailed),
    ToolCallSucceeded(ToolCallSucceeded),
}

macro_rules! payloads {
    ($($name:ident),* $(,)?) => {
        impl LifecycleEvent {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(LifecycleEvent::$name(_) => EventKind::$name,)*
                }
            }
        }

        $(
            impl EventPayload for $name {
                const KIND: EventKind = EventKind::$name;

                fn extract(event: &LifecycleEvent) -> Option<&Self> {
                    match event {
                        LifecycleEvent::$name(payload) => Some(payload),
                        _ => None,
                    }
                }

                fn into_event(self) -> LifecycleEvent {
                    LifecycleEvent::$name(self)
                }
            }

            impl From<$name> for LifecycleEvent {
                fn from(payload: $name) -> Self {
                    LifecycleEvent::$name(payload)
                }
            }
        )*
    };
}

payloads!(
    RunStarting,
    RunCompleted,
    RunFailed,
    NodeStarting,
    NodeCompleted,
    NodeFailed,
    LlmCallStarting,
    LlmCallCompleted,
    LlmStreamFrame,
    ToolCallStarting,
    ToolValidationFailed,
    ToolCallFailed,
    ToolCallSucceeded,
);
