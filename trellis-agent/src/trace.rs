use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use trellis_core::Value;
use trellis_graph::pipeline::{
    Feature, LlmCallCompleted, LlmCallStarting, NodeCompleted, NodeFailed, NodeStarting,
    PipelineBuilder, RunCompleted, RunFailed, RunStarting, ToolCallFailed, ToolCallStarting,
    ToolCallSucceeded, ToolValidationFailed,
};
use trellis_graph::{AgentContext, GraphError};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Run,
    Node,
    ModelCall,
    ToolCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error(String),
    /// Still open when its run ended.
    Abandoned,
}

/// A finished unit of work.
#[derive(Clone, Debug, Serialize)]
pub struct Span {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub run_id: String,
    pub kind: SpanKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SpanStatus,
    /// Only recorded when [`TraceConfig::capture_payloads`] is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl Span {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TraceConfig {
    /// Keep node inputs/outputs, model requests/replies and tool arguments
    /// on spans.
    pub capture_payloads: bool,
}

impl TraceConfig {
    pub fn with_payloads(mut self) -> Self {
        self.capture_payloads = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum SpanKey {
    Run(String),
    Node(Uuid),
    Model(Uuid),
    Tool(Uuid, String),
}

#[derive(Clone, Debug)]
struct OpenSpan {
    id: Uuid,
    parent_id: Option<Uuid>,
    run_id: String,
    kind: SpanKind,
    name: String,
    started_at: DateTime<Utc>,
    input: Option<Value>,
}

/// Records spans for runs, nodes, model calls and tool calls, and mirrors
/// them as `tracing` events.
///
/// Open spans are keyed by step id, so one installed feature can serve
/// concurrent runs of agents sharing a pipeline.
pub struct TraceFeature {
    config: TraceConfig,
    open: DashMap<SpanKey, OpenSpan>,
    finished: Mutex<Vec<Span>>,
}

impl std::fmt::Debug for TraceFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceFeature")
            .field("config", &self.config)
            .field("open", &self.open.len())
            .finish()
    }
}

impl TraceFeature {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            open: DashMap::new(),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Finished spans in completion order.
    pub fn spans(&self) -> Vec<Span> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spans_for_run(&self, run_id: &str) -> Vec<Span> {
        self.spans()
            .into_iter()
            .filter(|span| span.run_id == run_id)
            .collect()
    }

    pub fn open_span_count(&self) -> usize {
        self.open.len()
    }

    pub fn clear(&self) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn payload<T: Serialize>(&self, value: &T) -> Option<Value> {
        if self.config.capture_payloads {
            serde_json::to_value(value).ok()
        } else {
            None
        }
    }

    fn open_span(
        &self,
        key: SpanKey,
        kind: SpanKind,
        name: String,
        run_id: &str,
        parent_id: Option<Uuid>,
        input: Option<Value>,
    ) {
        let span = OpenSpan {
            id: Uuid::new_v4(),
            parent_id,
            run_id: run_id.to_string(),
            kind,
            name,
            started_at: Utc::now(),
            input,
        };
        tracing::debug!(
            span_id = %span.id,
            run_id = %span.run_id,
            kind = ?span.kind,
            name = %span.name,
            "span opened"
        );
        self.open.insert(key, span);
    }

    fn close_span(&self, key: &SpanKey, status: SpanStatus, output: Option<Value>) {
        let Some((_, open)) = self.open.remove(key) else {
            return;
        };
        self.finish(open, status, output);
    }

    fn finish(&self, open: OpenSpan, status: SpanStatus, output: Option<Value>) {
        let span = Span {
            id: open.id,
            parent_id: open.parent_id,
            run_id: open.run_id,
            kind: open.kind,
            name: open.name,
            started_at: open.started_at,
            finished_at: Utc::now(),
            status,
            input: open.input,
            output,
        };
        match &span.status {
            SpanStatus::Ok => tracing::debug!(
                span_id = %span.id,
                kind = ?span.kind,
                name = %span.name,
                duration_ms = span.duration_ms(),
                "span closed"
            ),
            SpanStatus::Error(message) => tracing::warn!(
                span_id = %span.id,
                kind = ?span.kind,
                name = %span.name,
                error = %message,
                "span failed"
            ),
            SpanStatus::Abandoned => tracing::warn!(
                span_id = %span.id,
                kind = ?span.kind,
                name = %span.name,
                "span abandoned"
            ),
        }
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span);
    }

    fn span_id(&self, key: &SpanKey) -> Option<Uuid> {
        self.open.get(key).map(|span| span.id)
    }

    /// Innermost open span a node hangs off: its parent node, else the run.
    fn node_parent(&self, parent_step_id: Uuid, ctx: &AgentContext) -> Option<Uuid> {
        self.span_id(&SpanKey::Node(parent_step_id))
            .or_else(|| self.span_id(&SpanKey::Run(ctx.run_id().to_string())))
    }

    /// Closes the run span and anything of the run still open.
    fn end_run(&self, run_id: &str, status: SpanStatus, output: Option<Value>) {
        let leftovers: Vec<SpanKey> = self
            .open
            .iter()
            .filter(|entry| entry.run_id == run_id && entry.kind != SpanKind::Run)
            .map(|entry| entry.key().clone())
            .collect();
        for key in leftovers {
            if let Some((_, open)) = self.open.remove(&key) {
                self.finish(open, SpanStatus::Abandoned, None);
            }
        }
        self.close_span(&SpanKey::Run(run_id.to_string()), status, output);
    }
}

impl Feature for TraceFeature {
    type Config = TraceConfig;
    const NAME: &'static str = "trace";

    fn install(
        config: TraceConfig,
        pipeline: &mut PipelineBuilder,
    ) -> Result<Arc<Self>, GraphError> {
        let trace = Arc::new(Self::new(config));

        let me = Arc::clone(&trace);
        pipeline.intercept::<RunStarting, _>(Self::NAME, move |event, _ctx| {
            let input = me.payload(&event.input);
            me.open_span(
                SpanKey::Run(event.run_id.clone()),
                SpanKind::Run,
                event.run_id.clone(),
                &event.run_id,
                None,
                input,
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<RunCompleted, _>(Self::NAME, move |event, _ctx| {
            me.end_run(&event.run_id, SpanStatus::Ok, me.payload(&event.output));
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<RunFailed, _>(Self::NAME, move |event, _ctx| {
            me.end_run(&event.run_id, SpanStatus::Error(event.message.clone()), None);
            Box::pin(async { Ok(()) })
        });

        let me = Arc::clone(&trace);
        pipeline.intercept::<NodeStarting, _>(Self::NAME, move |event, ctx| {
            let parent = me.node_parent(event.parent_step_id, ctx);
            me.open_span(
                SpanKey::Node(event.step_id),
                SpanKind::Node,
                event.node_path.join("/"),
                ctx.run_id(),
                parent,
                me.payload(&event.input),
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<NodeCompleted, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Node(event.step_id),
                SpanStatus::Ok,
                me.payload(&event.output),
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<NodeFailed, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Node(event.step_id),
                SpanStatus::Error(event.message.clone()),
                None,
            );
            Box::pin(async { Ok(()) })
        });

        let me = Arc::clone(&trace);
        pipeline.intercept::<LlmCallStarting, _>(Self::NAME, move |event, ctx| {
            let parent = me.span_id(&SpanKey::Node(event.step_id));
            me.open_span(
                SpanKey::Model(event.step_id),
                SpanKind::ModelCall,
                event.model.clone(),
                ctx.run_id(),
                parent,
                me.payload(&event.request),
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<LlmCallCompleted, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Model(event.step_id),
                SpanStatus::Ok,
                me.payload(&event.response),
            );
            Box::pin(async { Ok(()) })
        });

        let me = Arc::clone(&trace);
        pipeline.intercept::<ToolCallStarting, _>(Self::NAME, move |event, ctx| {
            let parent = me.span_id(&SpanKey::Node(event.step_id));
            me.open_span(
                SpanKey::Tool(event.step_id, event.call.id.clone()),
                SpanKind::ToolCall,
                event.call.name.clone(),
                ctx.run_id(),
                parent,
                me.payload(&event.call.args),
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<ToolCallSucceeded, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Tool(event.step_id, event.call.id.clone()),
                SpanStatus::Ok,
                me.payload(&event.result),
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<ToolCallFailed, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Tool(event.step_id, event.call.id.clone()),
                SpanStatus::Error(event.error.clone()),
                None,
            );
            Box::pin(async { Ok(()) })
        });
        let me = Arc::clone(&trace);
        pipeline.intercept::<ToolValidationFailed, _>(Self::NAME, move |event, _ctx| {
            me.close_span(
                &SpanKey::Tool(event.step_id, event.call.id.clone()),
                SpanStatus::Error(event.error.clone()),
                None,
            );
            Box::pin(async { Ok(()) })
        });

        Ok(trace)
    }
}
