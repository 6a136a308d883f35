use std::sync::Arc;

use trellis_core::{ModelExecutor, NodeValue, ToolRegistry};
use trellis_graph::pipeline::{Feature, Pipeline, PipelineBuilder};
use trellis_graph::strategies;
use trellis_graph::{
    run_graph, AgentContext, CancelHandle, ErrorKind, ExecutionConfig, Graph, GraphError,
};
use uuid::Uuid;

use crate::AgentState;

type Installer = Box<dyn FnOnce(&mut PipelineBuilder) -> Result<(), GraphError> + Send>;

/// Collects everything an [`Agent`] needs. Features are installed in the
/// order they were added once the tool registry is known.
pub struct AgentBuilder<I, O> {
    strategy: Graph<I, O>,
    executor: Option<Arc<dyn ModelExecutor>>,
    model: String,
    system_prompt: Option<String>,
    tools: ToolRegistry,
    installers: Vec<Installer>,
    config: ExecutionConfig,
    id: Option<String>,
}

impl AgentBuilder<String, String> {
    /// Builder over the sequential call-model / run-tool loop.
    pub fn single_run() -> Result<Self, GraphError> {
        Ok(Self::new(strategies::single_run()?))
    }

    /// Builder over the loop that runs all calls of one reply concurrently.
    pub fn single_run_parallel() -> Result<Self, GraphError> {
        Ok(Self::new(strategies::single_run_parallel()?))
    }
}

impl<I: NodeValue, O: NodeValue> AgentBuilder<I, O> {
    pub fn new(strategy: Graph<I, O>) -> Self {
        Self {
            strategy,
            executor: None,
            model: String::new(),
            system_prompt: None,
            tools: ToolRegistry::empty(),
            installers: Vec::new(),
            config: ExecutionConfig::default(),
            id: None,
        }
    }

    pub fn executor(mut self, executor: impl ModelExecutor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn shared_executor(mut self, executor: Arc<dyn ModelExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn install<F>(mut self, config: F::Config) -> Self
    where
        F: Feature,
        F::Config: 'static,
    {
        self.installers.push(Box::new(move |pipeline: &mut PipelineBuilder| {
            pipeline.install::<F>(config).map(|_| ())
        }));
        self
    }

    pub fn install_with<F>(self, configure: impl FnOnce(&mut F::Config)) -> Self
    where
        F: Feature,
        F::Config: 'static,
    {
        let mut config = F::Config::default();
        configure(&mut config);
        self.install::<F>(config)
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = Some(max_steps);
        self
    }

    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Agent id, also used as the run id checkpoints are stored under.
    /// Defaults to a random UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Agent<I, O>, GraphError> {
        let executor = self.executor.ok_or_else(|| {
            GraphError::Configuration("an agent needs a model executor".to_string())
        })?;
        self.strategy.validate_tool_scopes(&self.tools)?;

        let mut pipeline = Pipeline::builder(self.tools);
        for install in self.installers {
            install(&mut pipeline)?;
        }

        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut context = AgentContext::new(executor, Arc::new(pipeline.build()))
            .with_run_id(id.clone())
            .with_model(self.model)
            .with_config(self.config);
        if let Some(prompt) = self.system_prompt {
            context = context.with_system_prompt(prompt);
        }
        tracing::debug!(agent = %id, strategy = self.strategy.name(), "agent built");

        Ok(Agent {
            id,
            strategy: self.strategy,
            context,
            state: AgentState::NotStarted,
        })
    }
}

/// A strategy graph bound to its context. Runs are serialized by `&mut self`;
/// the conversation carries over from one run to the next.
pub struct Agent<I, O> {
    id: String,
    strategy: Graph<I, O>,
    context: AgentContext,
    state: AgentState<O>,
}

impl<I, O> std::fmt::Debug for Agent<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("strategy", &self.strategy.name())
            .field("context", &self.context)
            .finish()
    }
}

impl<I: NodeValue, O: NodeValue + Clone> Agent<I, O> {
    pub fn builder(strategy: Graph<I, O>) -> AgentBuilder<I, O> {
        AgentBuilder::new(strategy)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(&mut self, input: I) -> Result<O, GraphError> {
        // A token cancelled by the previous run must not abort this one.
        if self.state.error_kind() == Some(ErrorKind::Cancelled) {
            self.context.reset_cancellation();
        }
        self.state = AgentState::Running;
        tracing::info!(agent = %self.id, strategy = self.strategy.name(), "agent run starting");

        match run_graph(&self.strategy, &mut self.context, input).await {
            Ok(output) => {
                tracing::info!(
                    agent = %self.id,
                    steps = self.context.steps(),
                    "agent run finished"
                );
                self.state = AgentState::Finished(output.clone());
                Ok(output)
            }
            Err(err) => {
                tracing::warn!(agent = %self.id, error = %err, "agent run failed");
                self.state = AgentState::Failed(err.kind(), err.to_string());
                Err(err)
            }
        }
    }

    pub fn state(&self) -> &AgentState<O> {
        &self.state
    }

    /// Output of the last run when it finished successfully.
    pub fn result(&self) -> Option<&O> {
        self.state.output()
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut AgentContext {
        &mut self.context
    }

    pub fn feature<F: Feature>(&self) -> Option<Arc<F>> {
        self.context.feature::<F>()
    }

    /// Cancelling the handle aborts the run in progress at its next
    /// suspension point. The same handle keeps working for every later run.
    pub fn cancellation_token(&self) -> CancelHandle {
        self.context.cancel_handle()
    }
}
