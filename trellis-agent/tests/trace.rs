use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::json;
use trellis_agent::{AgentBuilder, SpanKind, SpanStatus, TraceConfig, TraceFeature};
use trellis_core::{
    FunctionTool, LlmRequest, LlmResponse, ModelExecutor, ParameterKind, ToolCall, ToolError,
    ToolParameter, ToolRegistry, TrellisError,
};
use trellis_graph::{GraphBuilder, GraphError, SubgraphOptions};

struct ScriptedExecutor {
    replies: Mutex<VecDeque<LlmResponse>>,
}

#[async_trait::async_trait]
impl ModelExecutor for ScriptedExecutor {
    async fn execute(&self, _request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TrellisError::ModelExecutor("script exhausted".to_string()))
    }
}

fn scripted(replies: Vec<LlmResponse>) -> ScriptedExecutor {
    ScriptedExecutor {
        replies: Mutex::new(replies.into()),
    }
}

fn lookup_tool() -> FunctionTool {
    FunctionTool::builder("lookup", "Finds a record by key")
        .parameter(ToolParameter::required(
            "key",
            ParameterKind::String,
            "record key",
        ))
        .handler(|args| async move {
            match args["key"].as_str() {
                Some("known") => Ok(json!({"value": 42})),
                _ => Err(ToolError::ExecutionFailed("no such record".to_string())),
            }
        })
}

#[tokio::test]
async fn spans_nest_model_and_tool_calls_under_their_nodes() {
    let tools = ToolRegistry::builder()
        .register(lookup_tool())
        .build()
        .unwrap();
    let mut agent = AgentBuilder::single_run()
        .unwrap()
        .executor(scripted(vec![
            LlmResponse::with_tool_calls(vec![ToolCall::new(
                "c1",
                "lookup",
                json!({"key": "known"}),
            )]),
            LlmResponse::text("value is 42"),
        ]))
        .model("tracer")
        .tools(tools)
        .id("traced")
        .install::<TraceFeature>(TraceConfig::default().with_payloads())
        .build()
        .unwrap();

    agent.run("find known".to_string()).await.unwrap();

    let trace = agent.feature::<TraceFeature>().unwrap();
    assert_eq!(trace.open_span_count(), 0);
    let spans = trace.spans_for_run("traced");
    assert!(spans.iter().all(|span| span.status == SpanStatus::Ok));

    let run = spans.iter().find(|s| s.kind == SpanKind::Run).unwrap();
    assert_eq!(run.parent_id, None);
    assert_eq!(run.output, Some(json!("value is 42")));
    // The run span closes last.
    assert_eq!(spans.last().unwrap().id, run.id);

    let node = |name: &str| {
        spans
            .iter()
            .find(|s| s.kind == SpanKind::Node && s.name == name)
            .unwrap()
    };
    let call_llm = node("call_llm");
    let execute_tool = node("execute_tool");
    assert_eq!(call_llm.parent_id, Some(run.id));
    assert_eq!(call_llm.input, Some(json!("find known")));

    let models: Vec<_> = spans
        .iter()
        .filter(|s| s.kind == SpanKind::ModelCall)
        .collect();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].name, "tracer");
    assert_eq!(models[0].parent_id, Some(call_llm.id));
    assert_eq!(models[1].parent_id, Some(node("send_tool_result").id));

    let tool = spans
        .iter()
        .find(|s| s.kind == SpanKind::ToolCall)
        .unwrap();
    assert_eq!(tool.name, "lookup");
    assert_eq!(tool.parent_id, Some(execute_tool.id));
    assert_eq!(tool.input, Some(json!({"key": "known"})));
    assert_eq!(tool.output, Some(json!({"value": 42})));
    assert!(tool.finished_at >= tool.started_at);
}

#[tokio::test]
async fn failures_mark_spans_as_errors() {
    let tools = ToolRegistry::builder()
        .register(lookup_tool())
        .build()
        .unwrap();
    let mut agent = AgentBuilder::single_run()
        .unwrap()
        .executor(scripted(vec![LlmResponse::with_tool_calls(vec![
            ToolCall::new("c1", "lookup", json!({"key": "unknown"})),
        ])]))
        .tools(tools)
        .install::<TraceFeature>(TraceConfig::default())
        .build()
        .unwrap();

    agent.run("find unknown".to_string()).await.unwrap_err();

    let trace = agent.feature::<TraceFeature>().unwrap();
    let spans = trace.spans();
    let status_of = |kind: SpanKind, name: &str| {
        spans
            .iter()
            .find(|s| s.kind == kind && s.name.ends_with(name))
            .map(|s| s.status.clone())
            .unwrap()
    };
    assert!(matches!(
        status_of(SpanKind::ToolCall, "lookup"),
        SpanStatus::Error(message) if message.contains("no such record")
    ));
    assert!(matches!(
        status_of(SpanKind::Node, "execute_tool"),
        SpanStatus::Error(_)
    ));
    assert!(matches!(
        status_of(SpanKind::Run, agent.id()),
        SpanStatus::Error(_)
    ));
    assert!(spans.iter().all(|s| s.input.is_none() && s.output.is_none()));
    assert_eq!(trace.open_span_count(), 0);

    trace.clear();
    assert!(trace.spans().is_empty());
}

#[tokio::test]
async fn subgraph_nodes_hang_off_the_subgraph_span() {
    let mut inner = GraphBuilder::<u32, u32>::new("inner");
    let double = inner.add_fn_node("double", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n * 2) })
    });
    let (start, finish) = (inner.start(), inner.finish());
    inner.add_edge(&start, &double).add_edge(&double, &finish);
    let inner = inner.build().unwrap();

    let mut outer = GraphBuilder::<u32, u32>::new("outer");
    let nested = outer.add_subgraph("nested", &inner, SubgraphOptions::default());
    let (start, finish) = (outer.start(), outer.finish());
    outer.add_edge(&start, &nested).add_edge(&nested, &finish);
    let graph = outer.build().unwrap();

    let mut agent = AgentBuilder::new(graph)
        .executor(scripted(vec![]))
        .install::<TraceFeature>(TraceConfig::default())
        .build()
        .unwrap();
    assert_eq!(agent.run(4).await.unwrap(), 8);

    let spans = agent.feature::<TraceFeature>().unwrap().spans();
    let find = |name: &str| spans.iter().find(|s| s.name == name).unwrap();
    assert_eq!(find("nested/double").parent_id, Some(find("nested").id));
    assert_eq!(find("nested").parent_id, Some(find(agent.id()).id));
}
