use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use trellis_core::{LlmRequest, Message, ModelExecutor, ToolRegistry, Value};
use uuid::Uuid;

use crate::pipeline::{Feature, LifecycleEvent, Pipeline};
use crate::{AgentStorage, Conversation, ExecutionConfig, ExecutionPosition, GraphError};

/// Where traversal should continue after a full restore: the node path
/// (enclosing subgraph names, then the leaf), the input each enclosing
/// subgraph node received and the value to feed the leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeTarget {
    pub node_path: Vec<String>,
    pub subgraph_inputs: Vec<Value>,
    pub input: Value,
}

/// Cancels the run an [`AgentContext`] is executing. Unlike a bare
/// [`CancellationToken`], a handle follows the context across
/// [`AgentContext::reset_cancellation`].
#[derive(Clone, Debug)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            current: Arc::new(Mutex::new(token)),
        }
    }

    fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, token: CancellationToken) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn cancel(&self) {
        self.token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }
}

/// Mutable state of one agent run, threaded through every node and
/// interceptor.
pub struct AgentContext {
    run_id: String,
    history: Conversation,
    model: String,
    executor: Arc<dyn ModelExecutor>,
    tools: ToolRegistry,
    storage: AgentStorage,
    position: ExecutionPosition,
    pipeline: Arc<Pipeline>,
    cancellation: CancellationToken,
    canceller: CancelHandle,
    config: ExecutionConfig,
    steps: usize,
    resume: Option<ResumeTarget>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("run_id", &self.run_id)
            .field("model", &self.model)
            .field("history", &self.history.len())
            .field("position", &self.position)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl AgentContext {
    /// A context whose tool scope is the pipeline's full registry.
    pub fn new(executor: Arc<dyn ModelExecutor>, pipeline: Arc<Pipeline>) -> Self {
        let cancellation = CancellationToken::new();
        let canceller = CancelHandle::new(cancellation.clone());
        Self {
            run_id: Uuid::new_v4().to_string(),
            history: Conversation::new(),
            model: String::new(),
            executor,
            tools: pipeline.tools().clone(),
            storage: AgentStorage::default(),
            position: ExecutionPosition::default(),
            pipeline,
            cancellation,
            canceller,
            config: ExecutionConfig::default(),
            steps: 0,
            resume: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.history.push(Message::system(prompt));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn history(&self) -> &Conversation {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut Conversation {
        &mut self.history
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn executor(&self) -> &Arc<dyn ModelExecutor> {
        &self.executor
    }

    /// Tools visible at the current position.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn storage(&self) -> &AgentStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut AgentStorage {
        &mut self.storage
    }

    pub fn position(&self) -> &ExecutionPosition {
        &self.position
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Token of the current run. It is replaced by
    /// [`reset_cancellation`](Self::reset_cancellation); callers that must
    /// outlive a reset hold a [`CancelHandle`] instead.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// A handle that cancels whichever token the context holds when it is
    /// used, including tokens installed by later resets.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.canceller.clone()
    }

    /// Replaces a cancelled token so the context can run again.
    pub fn reset_cancellation(&mut self) {
        if self.cancellation.is_cancelled() {
            self.cancellation = CancellationToken::new();
            self.canceller.replace(self.cancellation.clone());
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn feature<F: Feature>(&self) -> Option<Arc<F>> {
        self.pipeline.feature::<F>()
    }

    /// Like [`AgentContext::feature`] but reports a missing feature as a
    /// configuration error.
    pub fn require_feature<F: Feature>(&self) -> Result<Arc<F>, GraphError> {
        self.feature::<F>().ok_or_else(|| {
            GraphError::Configuration(format!("feature '{}' is not installed", F::NAME))
        })
    }

    /// Runs every interceptor registered for the event's kind, in order.
    pub async fn fire(&mut self, event: impl Into<LifecycleEvent>) -> Result<(), GraphError> {
        let pipeline = Arc::clone(&self.pipeline);
        let event = event.into();
        pipeline.dispatch(&event, self).await
    }

    /// Current history and in-scope tool specs, addressed to the active model.
    pub fn llm_request(&self) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            messages: self.history.to_vec(),
            tools: self.tools.specs(),
        }
    }

    /// Schedules traversal to continue at `target` once the running node
    /// completes, or at the start of the next run when called between runs.
    pub fn request_resume(&mut self, target: ResumeTarget) {
        self.resume = Some(target);
    }

    pub fn pending_resume(&self) -> Option<&ResumeTarget> {
        self.resume.as_ref()
    }

    pub fn clear_resume(&mut self) {
        self.resume = None;
    }

    pub(crate) fn position_mut(&mut self) -> &mut ExecutionPosition {
        &mut self.position
    }

    pub(crate) fn swap_scope(
        &mut self,
        tools: ToolRegistry,
        model: String,
    ) -> (ToolRegistry, String) {
        let tools = std::mem::replace(&mut self.tools, tools);
        let model = std::mem::replace(&mut self.model, model);
        (tools, model)
    }

    pub(crate) fn begin_run(&mut self) {
        self.steps = 0;
        self.position.reset();
    }

    pub(crate) fn count_step(&mut self) -> Result<(), GraphError> {
        self.steps += 1;
        match self.config.max_steps {
            Some(max) if self.steps > max => Err(GraphError::MaxStepsExceeded {
                max,
                reached: self.steps,
            }),
            _ => Ok(()),
        }
    }

    /// Takes the next path element of a pending resume target with the input
    /// recorded for it: the leaf input at the last element, otherwise the
    /// input of the subgraph node to descend into, if one was recorded.
    pub(crate) fn take_resume_step(&mut self) -> Option<(String, Option<Value>)> {
        let target = self.resume.as_mut()?;
        if target.node_path.is_empty() {
            self.resume = None;
            return None;
        }
        let name = target.node_path.remove(0);
        if target.node_path.is_empty() {
            let input = std::mem::take(&mut target.input);
            self.resume = None;
            Some((name, Some(input)))
        } else if target.subgraph_inputs.is_empty() {
            Some((name, None))
        } else {
            Some((name, Some(target.subgraph_inputs.remove(0))))
        }
    }
}
