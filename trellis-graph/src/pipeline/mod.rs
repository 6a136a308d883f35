//! Typed event bus that features use to observe every step of a run.

mod event;
mod feature;

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use ahash::AHashMap;
use futures::future::BoxFuture;
use trellis_core::ToolRegistry;

use crate::{AgentContext, GraphError};

pub use event::{
    EventKind, EventPayload, LifecycleEvent, LlmCallCompleted, LlmCallStarting, LlmStreamFrame,
    NodeCompleted, NodeFailed, NodeStarting, RunCompleted, RunFailed, RunStarting, ToolCallFailed,
    ToolCallStarting, ToolCallSucceeded, ToolValidationFailed,
};
pub use feature::Feature;

trait ErasedInterceptor: Send + Sync {
    fn feature(&self) -> &str;

    fn call<'a>(
        &'a self,
        event: &'a LifecycleEvent,
        ctx: &'a mut AgentContext,
    ) -> BoxFuture<'a, Result<(), GraphError>>;
}

struct TypedInterceptor<E, F> {
    feature: String,
    handler: F,
    _marker: PhantomData<fn(&E)>,
}

impl<E, F> ErasedInterceptor for TypedInterceptor<E, F>
where
    E: EventPayload,
    F: for<'a> Fn(&'a E, &'a mut AgentContext) -> BoxFuture<'a, Result<(), GraphError>>
        + Send
        + Sync
        + 'static,
{
    fn feature(&self) -> &str {
        &self.feature
    }

    fn call<'a>(
        &'a self,
        event: &'a LifecycleEvent,
        ctx: &'a mut AgentContext,
    ) -> BoxFuture<'a, Result<(), GraphError>> {
        match E::extract(event) {
            Some(payload) => (self.handler)(payload, ctx),
            None => Box::pin(async { Ok(()) }),
        }
    }
}

/// Installed features and their interceptors, fixed for the agent's lifetime.
pub struct Pipeline {
    interceptors: AHashMap<EventKind, Vec<Arc<dyn ErasedInterceptor>>>,
    features: AHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    feature_names: Vec<&'static str>,
    tools: ToolRegistry,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("features", &self.feature_names)
            .field("tools", &self.tools)
            .finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        PipelineBuilder::new(ToolRegistry::empty()).build()
    }
}

impl Pipeline {
    pub fn builder(tools: ToolRegistry) -> PipelineBuilder {
        PipelineBuilder::new(tools)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn feature<F: Feature>(&self) -> Option<Arc<F>> {
        self.features
            .get(&TypeId::of::<F>())
            .cloned()
            .and_then(|instance| instance.downcast::<F>().ok())
    }

    /// Installed feature names in installation order.
    pub fn feature_names(&self) -> &[&'static str] {
        &self.feature_names
    }

    pub fn interceptor_count(&self, kind: EventKind) -> usize {
        self.interceptors.get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub(crate) async fn dispatch(
        &self,
        event: &LifecycleEvent,
        ctx: &mut AgentContext,
    ) -> Result<(), GraphError> {
        let kind = event.kind();
        let Some(interceptors) = self.interceptors.get(&kind) else {
            return Ok(());
        };
        for interceptor in interceptors {
            interceptor
                .call(event, ctx)
                .await
                .map_err(|source| GraphError::Interceptor {
                    feature: interceptor.feature().to_string(),
                    kind,
                    source: Box::new(source),
                    reported: None,
                })?;
        }
        Ok(())
    }
}

pub struct PipelineBuilder {
    tools: ToolRegistry,
    interceptors: Vec<(EventKind, Arc<dyn ErasedInterceptor>)>,
    features: AHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    feature_names: Vec<&'static str>,
}

impl PipelineBuilder {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            tools,
            interceptors: Vec::new(),
            features: AHashMap::new(),
            feature_names: Vec::new(),
        }
    }

    /// The agent's full tool registry, for install-time validation.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Registers `handler` for events of payload type `E`. Handlers of the
    /// same kind run in registration order.
    ///
    /// ```rust
    /// use trellis_core::ToolRegistry;
    /// use trellis_graph::pipeline::{NodeStarting, Pipeline};
    ///
    /// let mut builder = Pipeline::builder(ToolRegistry::empty());
    /// builder.intercept::<NodeStarting, _>("audit", |event, _ctx| {
    ///     let node = event.node.clone();
    ///     Box::pin(async move {
    ///         tracing::debug!(%node, "node starting");
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn intercept<E, F>(&mut self, feature: &str, handler: F) -> &mut Self
    where
        E: EventPayload,
        F: for<'a> Fn(&'a E, &'a mut AgentContext) -> BoxFuture<'a, Result<(), GraphError>>
            + Send
            + Sync
            + 'static,
    {
        self.interceptors.push((
            E::KIND,
            Arc::new(TypedInterceptor {
                feature: feature.to_string(),
                handler,
                _marker: PhantomData,
            }),
        ));
        self
    }

    pub fn install<F: Feature>(&mut self, config: F::Config) -> Result<Arc<F>, GraphError> {
        if self.features.contains_key(&TypeId::of::<F>()) || self.feature_names.contains(&F::NAME)
        {
            return Err(GraphError::Configuration(format!(
                "feature '{}' is already installed",
                F::NAME
            )));
        }
        let instance = F::install(config, self)?;
        let erased: Arc<dyn Any + Send + Sync> = instance.clone();
        self.features.insert(TypeId::of::<F>(), erased);
        self.feature_names.push(F::NAME);
        tracing::debug!(feature = F::NAME, "feature installed");
        Ok(instance)
    }

    /// Installs `F` with its default configuration adjusted by `configure`.
    pub fn install_with<F: Feature>(
        &mut self,
        configure: impl FnOnce(&mut F::Config),
    ) -> Result<Arc<F>, GraphError> {
        let mut config = F::Config::default();
        configure(&mut config);
        self.install::<F>(config)
    }

    pub fn build(self) -> Pipeline {
        let mut interceptors: AHashMap<EventKind, Vec<Arc<dyn ErasedInterceptor>>> =
            AHashMap::new();
        for (kind, interceptor) in self.interceptors {
            interceptors.entry(kind).or_default().push(interceptor);
        }
        Pipeline {
            interceptors,
            features: self.features,
            feature_names: self.feature_names,
            tools: self.tools,
        }
    }
}
