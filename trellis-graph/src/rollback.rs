use std::collections::HashMap;
use std::sync::Arc;

use trellis_core::{Message, Role, Tool, ToolCall, ToolRegistry};

use crate::GraphError;

/// Forward tool name to the tool that undoes it.
///
/// ```rust
/// use trellis_core::{FunctionTool, ParameterKind, ToolParameter};
/// use trellis_graph::RollbackToolRegistry;
///
/// let remove_user = FunctionTool::builder("remove_user", "Deletes a user")
///     .parameter(ToolParameter::required("name", ParameterKind::String, ""))
///     .handler(|_args| async move { Ok(serde_json::Value::Null) });
/// let rollback = RollbackToolRegistry::builder()
///     .register("create_user", remove_user)
///     .build();
/// assert!(rollback.inverse_of("create_user").is_some());
/// ```
#[derive(Clone, Default)]
pub struct RollbackToolRegistry {
    inverses: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for RollbackToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pairs: Vec<(&str, &str)> = self
            .inverses
            .iter()
            .map(|(forward, inverse)| (forward.as_str(), inverse.name()))
            .collect();
        pairs.sort();
        f.debug_map().entries(pairs).finish()
    }
}

impl RollbackToolRegistry {
    pub fn builder() -> RollbackToolRegistryBuilder {
        RollbackToolRegistryBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inverses.len()
    }

    pub fn inverse_of(&self, forward: &str) -> Option<&Arc<dyn Tool>> {
        self.inverses.get(forward)
    }

    /// Every forward tool must be registered with the agent and its inverse
    /// must take the same arguments.
    pub(crate) fn validate(&self, tools: &ToolRegistry) -> Result<(), GraphError> {
        for (forward, inverse) in self.inverses.iter() {
            let descriptor = tools.descriptor(forward).ok_or_else(|| {
                GraphError::Configuration(format!(
                    "rollback pairing references unknown tool '{forward}'"
                ))
            })?;
            if !descriptor.same_shape(inverse.descriptor()) {
                return Err(GraphError::Configuration(format!(
                    "inverse tool '{}' does not take the same arguments as '{forward}'",
                    inverse.name()
                )));
            }
        }
        Ok(())
    }

    /// Pairs each of `executed` (oldest first) with its inverse, most recent
    /// first. Fails before anything runs if a call has no inverse.
    pub(crate) fn plan(&self, executed: &[ToolCall]) -> Result<Vec<RollbackStep>, GraphError> {
        executed
            .iter()
            .rev()
            .map(|call| -> Result<RollbackStep, GraphError> {
                let inverse = self.inverse_of(&call.name).ok_or_else(|| {
                    GraphError::Restore(format!(
                        "no rollback tool registered for '{}' (call {})",
                        call.name, call.id
                    ))
                })?;
                Ok(RollbackStep {
                    forward: call.clone(),
                    inverse: Arc::clone(inverse),
                })
            })
            .collect()
    }
}

/// Tool calls whose results entered `current` after `checkpoint`, oldest
/// first. `None` when `current` no longer extends `checkpoint` (it was
/// compressed or rewritten since), so the history alone cannot tell.
///
/// Requests are resolved against the whole of `current`: a checkpoint taken
/// at a tool node already holds the assistant request but not the result.
pub(crate) fn calls_after(
    current: &[Message],
    checkpoint: &[Message],
) -> Result<Option<Vec<ToolCall>>, GraphError> {
    let shared = current
        .iter()
        .zip(checkpoint)
        .take_while(|(now, then)| now == then)
        .count();
    if shared < checkpoint.len() && shared < current.len() {
        return Ok(None);
    }

    let requested: HashMap<&str, &ToolCall> = current
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .flat_map(|message| &message.tool_calls)
        .map(|call| (call.id.as_str(), call))
        .collect();
    let segment = current.get(checkpoint.len()..).unwrap_or_default();
    result_ids(segment)
        .map(|id| {
            requested
                .get(id)
                .map(|call| (*call).clone())
                .ok_or_else(|| {
                    GraphError::Restore(format!("tool result '{id}' has no matching request"))
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Call ids of the tool results in `messages`.
pub(crate) fn result_ids(messages: &[Message]) -> impl Iterator<Item = &str> {
    messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .map(|message| message.tool_call_id.as_deref().unwrap_or_default())
}

pub(crate) struct RollbackStep {
    pub(crate) forward: ToolCall,
    pub(crate) inverse: Arc<dyn Tool>,
}

#[derive(Default)]
pub struct RollbackToolRegistryBuilder {
    inverses: HashMap<String, Arc<dyn Tool>>,
}

impl RollbackToolRegistryBuilder {
    pub fn register<T: Tool + 'static>(self, forward: impl Into<String>, inverse: T) -> Self {
        self.register_arc(forward, Arc::new(inverse))
    }

    pub fn register_arc(mut self, forward: impl Into<String>, inverse: Arc<dyn Tool>) -> Self {
        self.inverses.insert(forward.into(), inverse);
        self
    }

    pub fn build(self) -> RollbackToolRegistry {
        RollbackToolRegistry {
            inverses: Arc::new(self.inverses),
        }
    }
}
