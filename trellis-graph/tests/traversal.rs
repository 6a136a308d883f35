use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use trellis_core::{
    FunctionTool, LlmRequest, LlmResponse, ModelExecutor, ParameterKind, Role, ToolCall,
    ToolParameter, ToolRegistry, TrellisError,
};
use trellis_graph::pipeline::{
    Feature, NodeFailed, NodeStarting, Pipeline, PipelineBuilder, RunFailed,
};
use trellis_graph::strategies::single_run;
use trellis_graph::{
    run_graph, AgentContext, ErrorKind, ExecutionConfig, GraphBuilder, GraphError, Route,
    SubgraphOptions, START,
};

struct ScriptedExecutor {
    replies: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedExecutor {
    fn new(replies: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl ModelExecutor for ScriptedExecutor {
    async fn execute(&self, request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TrellisError::ModelExecutor("script exhausted".to_string()))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.events.lock().unwrap().push(entry);
    }
}

impl Feature for Recorder {
    type Config = ();
    const NAME: &'static str = "recorder";

    fn install(_config: (), pipeline: &mut PipelineBuilder) -> Result<Arc<Self>, GraphError> {
        let me = Arc::new(Self::default());
        let recorder = Arc::clone(&me);
        pipeline.intercept::<NodeStarting, _>(Self::NAME, move |event, _ctx| {
            recorder.push(format!("start:{}", event.node_path.join("/")));
            Box::pin(async { Ok(()) })
        });
        let recorder = Arc::clone(&me);
        pipeline.intercept::<NodeFailed, _>(Self::NAME, move |event, _ctx| {
            recorder.push(format!("failed:{}", event.node));
            Box::pin(async { Ok(()) })
        });
        let recorder = Arc::clone(&me);
        pipeline.intercept::<RunFailed, _>(Self::NAME, move |event, _ctx| {
            recorder.push(format!("run_failed:{:?}", event.error_kind));
            Box::pin(async { Ok(()) })
        });
        Ok(me)
    }
}

fn echo_tool() -> FunctionTool {
    FunctionTool::builder("echo", "Echoes the text argument")
        .parameter(ToolParameter::required(
            "text",
            ParameterKind::String,
            "text to echo",
        ))
        .handler(|args| async move {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Ok(json!(format!("echo: {text}")))
        })
}

fn recorded_context(tools: ToolRegistry, executor: Arc<dyn ModelExecutor>) -> AgentContext {
    let mut builder = Pipeline::builder(tools);
    builder.install::<Recorder>(()).unwrap();
    AgentContext::new(executor, Arc::new(builder.build())).with_model("scripted")
}

#[tokio::test]
async fn single_run_feeds_tool_result_back_to_the_model() {
    let executor = ScriptedExecutor::new(vec![
        LlmResponse::with_tool_calls(vec![ToolCall::new(
            "call-1",
            "echo",
            json!({"text": "hi"}),
        )]),
        LlmResponse::text("the tool said: echo: hi"),
    ]);
    let tools = ToolRegistry::builder()
        .register(echo_tool())
        .build()
        .unwrap();
    let mut ctx = recorded_context(tools, executor.clone());

    let graph = single_run().unwrap();
    let output = run_graph(&graph, &mut ctx, "hi".to_string()).await.unwrap();

    assert_eq!(output, "the tool said: echo: hi");
    let roles: Vec<Role> = ctx.history().messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(ctx.history().messages()[2].content, "echo: hi");

    let requests = executor.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[1].messages.len(), 3);

    let recorder = ctx.feature::<Recorder>().unwrap();
    assert_eq!(
        recorder.events(),
        vec![
            "start:__start__",
            "start:call_llm",
            "start:execute_tool",
            "start:send_tool_result",
            "start:__finish__",
        ]
    );
}

#[tokio::test]
async fn single_run_executes_every_call_of_a_reply() {
    let executor = ScriptedExecutor::new(vec![
        LlmResponse::with_tool_calls(vec![
            ToolCall::new("call-1", "echo", json!({"text": "one"})),
            ToolCall::new("call-2", "echo", json!({"text": "two"})),
        ]),
        LlmResponse::with_tool_calls(vec![ToolCall::new(
            "call-3",
            "echo",
            json!({"text": "three"}),
        )]),
        LlmResponse::text("done"),
    ]);
    let tools = ToolRegistry::builder()
        .register(echo_tool())
        .build()
        .unwrap();
    let mut ctx = recorded_context(tools, executor.clone());

    let graph = single_run().unwrap();
    let output = run_graph(&graph, &mut ctx, "go".to_string()).await.unwrap();

    assert_eq!(output, "done");
    let tool_results: Vec<(Option<&str>, &str)> = ctx
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_call_id.as_deref(), m.content.as_str()))
        .collect();
    assert_eq!(
        tool_results,
        vec![
            (Some("call-1"), "echo: one"),
            (Some("call-2"), "echo: two"),
            (Some("call-3"), "echo: three"),
        ]
    );
    assert_eq!(executor.requests.lock().unwrap().len(), 3);

    let recorder = ctx.feature::<Recorder>().unwrap();
    assert_eq!(
        recorder.events(),
        vec![
            "start:call_llm",
            "start:execute_tools",
            "start:send_tool_results",
            "start:execute_tool",
            "start:send_tool_result",
        ]
    );
}

#[tokio::test]
async fn first_matching_pair_wins() {
    let mut builder = GraphBuilder::<u32, String>::new("tie_break");
    let measure = builder.add_fn_node("measure", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n * 10) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder.add_edge(&start, &measure).add_conditional_edge(
        &measure,
        &finish,
        Route::new()
            .when(|n: &u32| *n > 5, |n| format!("big {n}"))
            .when(|n: &u32| *n > 1, |n| format!("medium {n}")),
    );
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let output = run_graph(&graph, &mut ctx, 1).await.unwrap();
    assert_eq!(output, "big 10");
}

#[tokio::test]
async fn non_finite_floats_pass_between_nodes_unchanged() {
    let mut builder = GraphBuilder::<f64, f64>::new("floats");
    let undefined = builder.add_fn_node("undefined", |_ctx, _x: f64| {
        Box::pin(async move { Ok::<f64, GraphError>(f64::NAN) })
    });
    let check = builder.add_fn_node("check", |_ctx, x: f64| {
        Box::pin(async move { Ok::<f64, GraphError>(x) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &undefined)
        .add_conditional_edge(&undefined, &check, Route::new().only_if(|x: &f64| x.is_nan()))
        .add_edge(&check, &finish);
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let output = run_graph(&graph, &mut ctx, 2.0).await.unwrap();

    assert!(output.is_nan());
    assert_eq!(
        ctx.feature::<Recorder>().unwrap().events(),
        vec!["start:__start__", "start:undefined", "start:check", "start:__finish__"]
    );
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Draft {
    title: String,
    #[serde(skip)]
    scratch: Vec<u8>,
}

#[tokio::test]
async fn fields_skipped_by_serde_survive_the_handoff() {
    let mut builder = GraphBuilder::<String, usize>::new("drafts");
    let open = builder.add_fn_node("open", |_ctx, title: String| {
        Box::pin(async move {
            Ok::<Draft, GraphError>(Draft {
                title,
                scratch: vec![1, 2, 3],
            })
        })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder.add_edge(&start, &open).add_conditional_edge(
        &open,
        &finish,
        Route::new().map(|draft: Draft| draft.title.len() + draft.scratch.len()),
    );
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let output = run_graph(&graph, &mut ctx, "memo".to_string()).await.unwrap();

    assert_eq!(output, 7);
}

#[tokio::test]
async fn failing_node_fires_node_failed_once_and_stops() {
    let after_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after_runs);

    let mut builder = GraphBuilder::<String, String>::new("failing");
    let boom = builder.add_fn_node("boom", |_ctx, _input: String| {
        Box::pin(async move { Err::<String, GraphError>(GraphError::custom("boom")) })
    });
    let after = builder.add_fn_node("after", move |_ctx, input: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok::<String, GraphError>(input) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &boom)
        .add_edge(&boom, &after)
        .add_edge(&after, &finish);
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let err = run_graph(&graph, &mut ctx, "go".to_string())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Node);
    assert_eq!(err.node_path(), Some("boom"));
    assert_eq!(after_runs.load(Ordering::SeqCst), 0);

    let events = ctx.feature::<Recorder>().unwrap().events();
    let failed: Vec<&String> = events.iter().filter(|e| e.starts_with("failed:")).collect();
    assert_eq!(failed, vec!["failed:boom"]);
    assert_eq!(events.last().unwrap(), "run_failed:Node");
    assert!(!events.contains(&"start:after".to_string()));
}

#[tokio::test]
async fn unmatched_output_is_a_dead_end() {
    let mut builder = GraphBuilder::<u32, u32>::new("dead_end");
    let check = builder.add_fn_node("check", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &check)
        .add_conditional_edge(&check, &finish, Route::new().only_if(|n: &u32| *n > 100));
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let err = run_graph(&graph, &mut ctx, 1).await.unwrap_err();

    assert!(matches!(err, GraphError::DeadEnd { ref node } if node == "check"));
    assert_eq!(err.kind(), ErrorKind::DeadEnd);
}

#[tokio::test]
async fn step_limit_stops_a_runaway_loop() {
    let mut builder = GraphBuilder::<u32, u32>::new("loop");
    let inc = builder.add_fn_node("inc", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n + 1) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &inc)
        .add_conditional_edge(&inc, &inc, Route::new().only_if(|n: &u32| *n < 1000))
        .add_conditional_edge(&inc, &finish, Route::new().only_if(|n: &u32| *n >= 1000));
    let graph = builder.build().unwrap();

    let executor = ScriptedExecutor::new(vec![]);
    let mut ctx = AgentContext::new(executor, Arc::new(Pipeline::default())).with_config(
        ExecutionConfig {
            max_steps: Some(5),
        },
    );
    let err = run_graph(&graph, &mut ctx, 0).await.unwrap_err();

    assert!(matches!(
        err,
        GraphError::MaxStepsExceeded { max: 5, reached: 6 }
    ));
    assert_eq!(err.kind(), ErrorKind::StepLimit);

    let mut ctx = AgentContext::new(ScriptedExecutor::new(vec![]), Arc::new(Pipeline::default()))
        .with_config(ExecutionConfig::unbounded());
    assert_eq!(run_graph(&graph, &mut ctx, 0).await.unwrap(), 1000);
}

#[tokio::test]
async fn cancellation_drops_the_running_node_and_rewinds() {
    let mut builder = GraphBuilder::<String, String>::new("slow");
    let slow = builder.add_fn_node("slow", |ctx, input: String| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ctx.history_mut().push(trellis_core::Message::assistant("late"));
            Ok::<String, GraphError>(input)
        })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder.add_edge(&start, &slow).add_edge(&slow, &finish);
    let graph = builder.build().unwrap();

    let mut ctx = recorded_context(ToolRegistry::empty(), ScriptedExecutor::new(vec![]));
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = run_graph(&graph, &mut ctx, "x".to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, GraphError::Cancelled));
    assert!(ctx.history().is_empty());
    assert_eq!(ctx.position().node(), Some(START));
    let events = ctx.feature::<Recorder>().unwrap().events();
    assert!(!events.iter().any(|e| e.starts_with("failed:")));
    assert!(!events.contains(&"start:__finish__".to_string()));

    let err = run_graph(&graph, &mut ctx, "x".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Cancelled));
    ctx.reset_cancellation();
    assert!(!ctx.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn subgraph_runs_with_its_own_tool_scope_and_model() {
    let secret = FunctionTool::builder("secret", "Not visible inside the subgraph")
        .handler(|_args| async move { Ok(json!("classified")) });
    let tools = ToolRegistry::builder()
        .register(echo_tool())
        .register(secret)
        .build()
        .unwrap();

    let mut inner = GraphBuilder::<String, String>::new("inner");
    let work = inner.add_fn_node("work", |ctx, input: String| {
        Box::pin(async move {
            let names: Vec<String> = ctx.tools().names().map(str::to_string).collect();
            let model = ctx.model().to_string();
            let path = ctx.position().subgraph_path().to_vec();
            ctx.storage_mut().set("inner_tools", names);
            ctx.storage_mut().set("inner_model", model);
            ctx.storage_mut().set("inner_path", path);
            Ok::<String, GraphError>(format!("{input}!"))
        })
    });
    let (start, finish) = (inner.start(), inner.finish());
    inner.add_edge(&start, &work).add_edge(&work, &finish);
    let inner = inner.build().unwrap();

    let mut outer = GraphBuilder::<String, String>::new("outer");
    let sub = outer.add_subgraph(
        "inner",
        &inner,
        SubgraphOptions::default()
            .with_tools(["echo"])
            .with_model("small-model"),
    );
    let after = outer.add_fn_node("after", |ctx, input: String| {
        Box::pin(async move {
            let count = ctx.tools().len();
            let model = ctx.model().to_string();
            ctx.storage_mut().set("outer_tools", count);
            ctx.storage_mut().set("outer_model", model);
            Ok::<String, GraphError>(input)
        })
    });
    let (start, finish) = (outer.start(), outer.finish());
    outer
        .add_edge(&start, &sub)
        .add_edge(&sub, &after)
        .add_edge(&after, &finish);
    let graph = outer.build().unwrap();
    graph.validate_tool_scopes(&tools).unwrap();

    let mut ctx = recorded_context(tools, ScriptedExecutor::new(vec![]));
    let output = run_graph(&graph, &mut ctx, "hey".to_string()).await.unwrap();
    assert_eq!(output, "hey!");

    let storage = ctx.storage();
    assert_eq!(
        storage.get::<Vec<String>>("inner_tools").unwrap(),
        &vec!["echo".to_string()]
    );
    assert_eq!(storage.get::<String>("inner_model").unwrap(), "small-model");
    assert_eq!(
        storage.get::<Vec<String>>("inner_path").unwrap(),
        &vec!["inner".to_string()]
    );
    assert_eq!(storage.get::<usize>("outer_tools"), Some(&2));
    assert_eq!(storage.get::<String>("outer_model").unwrap(), "scripted");

    assert_eq!(
        ctx.feature::<Recorder>().unwrap().events(),
        vec![
            "start:__start__",
            "start:inner",
            "start:inner/__start__",
            "start:inner/work",
            "start:inner/__finish__",
            "start:after",
            "start:__finish__",
        ]
    );
    assert_eq!(ctx.position().depth(), 0);
}

#[tokio::test]
async fn nested_steps_point_at_their_subgraph_step() {
    let mut inner = GraphBuilder::<u32, u32>::new("inner");
    let work = inner.add_fn_node("work", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n) })
    });
    let (start, finish) = (inner.start(), inner.finish());
    inner.add_edge(&start, &work).add_edge(&work, &finish);
    let inner = inner.build().unwrap();

    let mut outer = GraphBuilder::<u32, u32>::new("outer");
    let sub = outer.add_subgraph("nested", &inner, SubgraphOptions::default());
    let (start, finish) = (outer.start(), outer.finish());
    outer.add_edge(&start, &sub).add_edge(&sub, &finish);
    let graph = outer.build().unwrap();

    let seen: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut pipeline = Pipeline::builder(ToolRegistry::empty());
    pipeline.intercept::<NodeStarting, _>("ids", move |event, _ctx| {
        sink.lock().unwrap().push((
            event.node_path.join("/"),
            event.step_id.to_string(),
            event.parent_step_id.to_string(),
        ));
        Box::pin(async { Ok(()) })
    });
    let mut ctx = AgentContext::new(ScriptedExecutor::new(vec![]), Arc::new(pipeline.build()));
    run_graph(&graph, &mut ctx, 7).await.unwrap();

    let seen = seen.lock().unwrap();
    let step_of = |path: &str| seen.iter().find(|(p, _, _)| p == path).unwrap().clone();
    let nested = step_of("nested");
    let work = step_of("nested/work");
    let root = step_of("__start__");
    assert_eq!(work.2, nested.1);
    assert_eq!(nested.2, root.2);
    assert_eq!(root.2, ctx.position().root_step_id().to_string());
}

#[tokio::test]
async fn unknown_tool_in_a_subgraph_scope_is_rejected() {
    let mut inner = GraphBuilder::<u32, u32>::new("inner");
    let work = inner.add_fn_node("work", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n) })
    });
    let (start, finish) = (inner.start(), inner.finish());
    inner.add_edge(&start, &work).add_edge(&work, &finish);
    let inner = inner.build().unwrap();

    let mut outer = GraphBuilder::<u32, u32>::new("outer");
    let sub = outer.add_subgraph(
        "scoped",
        &inner,
        SubgraphOptions::default().with_tools(["missing"]),
    );
    let (start, finish) = (outer.start(), outer.finish());
    outer.add_edge(&start, &sub).add_edge(&sub, &finish);
    let graph = outer.build().unwrap();

    let err = graph
        .validate_tool_scopes(&ToolRegistry::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("scoped"));

    let mut ctx = AgentContext::new(ScriptedExecutor::new(vec![]), Arc::new(Pipeline::default()));
    let err = run_graph(&graph, &mut ctx, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolValidation);
    assert_eq!(err.node_path(), Some("scoped"));
}

#[tokio::test]
async fn model_failure_is_reported_with_the_node_path() {
    let executor = ScriptedExecutor::new(vec![]);
    let mut ctx = recorded_context(ToolRegistry::empty(), executor);
    let graph = single_run().unwrap();

    let err = run_graph(&graph, &mut ctx, "hello".to_string())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ModelCall);
    assert_eq!(err.node_path(), Some("call_llm"));
    assert!(ctx.history().is_empty());
}
