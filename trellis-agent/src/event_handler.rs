use std::sync::Arc;

use trellis_graph::pipeline::{
    EventKind, EventPayload, Feature, LlmCallCompleted, LlmCallStarting, LlmStreamFrame,
    NodeCompleted, NodeFailed, NodeStarting, PipelineBuilder, RunCompleted, RunFailed,
    RunStarting, ToolCallFailed, ToolCallStarting, ToolCallSucceeded, ToolValidationFailed,
};
use trellis_graph::GraphError;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

macro_rules! callbacks {
    ($($field:ident: $payload:ident => $method:ident),* $(,)?) => {
        /// Plain callbacks per lifecycle event, run synchronously in the order
        /// they were added.
        ///
        /// ```rust
        /// use trellis_agent::EventHandlerConfig;
        ///
        /// let config = EventHandlerConfig::default()
        ///     .on_node_completed(|event| println!("{} done", event.node))
        ///     .on_run_failed(|event| eprintln!("run failed: {}", event.message));
        /// assert_eq!(config.len(), 2);
        /// ```
        #[derive(Default)]
        pub struct EventHandlerConfig {
            $($field: Vec<Callback<$payload>>,)*
        }

        impl EventHandlerConfig {
            $(
                pub fn $method(mut self, callback: impl Fn(&$payload) + Send + Sync + 'static) -> Self {
                    self.$field.push(Arc::new(callback));
                    self
                }
            )*

            /// Number of registered callbacks.
            pub fn len(&self) -> usize {
                0 $(+ self.$field.len())*
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            fn register(self, pipeline: &mut PipelineBuilder) -> Vec<EventKind> {
                let mut kinds = Vec::new();
                $(
                    if !self.$field.is_empty() {
                        kinds.push(<$payload as EventPayload>::KIND);
                        let callbacks = self.$field;
                        pipeline.intercept::<$payload, _>(EventHandler::NAME, move |event, _ctx| {
                            for callback in &callbacks {
                                callback(event);
                            }
                            Box::pin(async { Ok(()) })
                        });
                    }
                )*
                kinds
            }
        }
    };
}

callbacks!(
    run_starting: RunStarting => on_run_starting,
    run_completed: RunCompleted => on_run_completed,
    run_failed: RunFailed => on_run_failed,
    node_starting: NodeStarting => on_node_starting,
    node_completed: NodeCompleted => on_node_completed,
    node_failed: NodeFailed => on_node_failed,
    llm_call_starting: LlmCallStarting => on_llm_call_starting,
    llm_call_completed: LlmCallCompleted => on_llm_call_completed,
    llm_stream_frame: LlmStreamFrame => on_llm_stream_frame,
    tool_call_starting: ToolCallStarting => on_tool_call_starting,
    tool_validation_failed: ToolValidationFailed => on_tool_validation_failed,
    tool_call_failed: ToolCallFailed => on_tool_call_failed,
    tool_call_succeeded: ToolCallSucceeded => on_tool_call_succeeded,
);

impl std::fmt::Debug for EventHandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlerConfig")
            .field("callbacks", &self.len())
            .finish()
    }
}

/// Forwards lifecycle events to user callbacks. Callbacks observe; they
/// cannot fail the run.
#[derive(Debug)]
pub struct EventHandler {
    kinds: Vec<EventKind>,
}

impl EventHandler {
    /// Whether any callback was registered for `kind`.
    pub fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl Feature for EventHandler {
    type Config = EventHandlerConfig;
    const NAME: &'static str = "event_handler";

    fn install(
        config: EventHandlerConfig,
        pipeline: &mut PipelineBuilder,
    ) -> Result<Arc<Self>, GraphError> {
        let kinds = config.register(pipeline);
        tracing::debug!(kinds = kinds.len(), "event handler callbacks registered");
        Ok(Arc::new(Self { kinds }))
    }
}
