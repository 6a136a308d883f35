use std::sync::{Arc, Mutex};

use trellis_core::{LlmRequest, LlmResponse, ModelExecutor, ToolRegistry, TrellisError};
use trellis_graph::pipeline::{
    EventKind, Feature, NodeCompleted, NodeFailed, NodeStarting, Pipeline, PipelineBuilder,
    RunCompleted, RunStarting,
};
use trellis_graph::{
    run_graph, AgentContext, ErrorKind, Graph, GraphBuilder, GraphError, Persistence,
    PersistenceConfig,
};

struct SilentExecutor;

#[async_trait::async_trait]
impl ModelExecutor for SilentExecutor {
    async fn execute(&self, _request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        Ok(LlmResponse::text(""))
    }
}

fn doubling_graph() -> Graph<u32, u32> {
    let mut builder = GraphBuilder::<u32, u32>::new("double");
    let double = builder.add_fn_node("double", |_ctx, n: u32| {
        Box::pin(async move { Ok::<u32, GraphError>(n * 2) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder.add_edge(&start, &double).add_edge(&double, &finish);
    builder.build().unwrap()
}

type Log = Arc<Mutex<Vec<String>>>;

struct Counting {
    prefix: String,
}

impl Feature for Counting {
    type Config = (String, Log);
    const NAME: &'static str = "counting";

    fn install(
        (prefix, log): (String, Log),
        pipeline: &mut PipelineBuilder,
    ) -> Result<Arc<Self>, GraphError> {
        let sink = Arc::clone(&log);
        let tag = prefix.clone();
        pipeline.intercept::<NodeStarting, _>(Self::NAME, move |event, _ctx| {
            sink.lock().unwrap().push(format!("{tag}:before:{}", event.node));
            Box::pin(async { Ok(()) })
        });
        let sink = Arc::clone(&log);
        let tag = prefix.clone();
        pipeline.intercept::<NodeCompleted, _>(Self::NAME, move |event, _ctx| {
            sink.lock().unwrap().push(format!("{tag}:after:{}", event.node));
            Box::pin(async { Ok(()) })
        });
        Ok(Arc::new(Self { prefix }))
    }
}

struct Second;

impl Feature for Second {
    type Config = Log;
    const NAME: &'static str = "second";

    fn install(log: Log, pipeline: &mut PipelineBuilder) -> Result<Arc<Self>, GraphError> {
        pipeline.intercept::<NodeStarting, _>(Self::NAME, move |event, _ctx| {
            log.lock().unwrap().push(format!("second:before:{}", event.node));
            Box::pin(async { Ok(()) })
        });
        Ok(Arc::new(Self))
    }
}

#[derive(Debug)]
struct Veto;

impl Feature for Veto {
    type Config = ();
    const NAME: &'static str = "veto";

    fn install(_config: (), pipeline: &mut PipelineBuilder) -> Result<Arc<Self>, GraphError> {
        pipeline.intercept::<NodeStarting, _>(Self::NAME, |event, _ctx| {
            let node = event.node.clone();
            Box::pin(async move {
                if node == "double" {
                    return Err(GraphError::custom("not allowed"));
                }
                Ok(())
            })
        });
        Ok(Arc::new(Self))
    }
}

#[tokio::test]
async fn interceptors_run_in_registration_order_around_each_node() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut builder = Pipeline::builder(ToolRegistry::empty());
    builder
        .install::<Counting>(("first".to_string(), Arc::clone(&log)))
        .unwrap();
    builder.install::<Second>(Arc::clone(&log)).unwrap();
    let pipeline = Arc::new(builder.build());
    assert_eq!(pipeline.feature_names(), &["counting", "second"]);
    assert_eq!(pipeline.interceptor_count(EventKind::NodeStarting), 2);
    assert_eq!(pipeline.interceptor_count(EventKind::LlmCallStarting), 0);

    let mut ctx = AgentContext::new(Arc::new(SilentExecutor), pipeline);
    run_graph(&doubling_graph(), &mut ctx, 2).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first:before:__start__",
            "second:before:__start__",
            "first:after:__start__",
            "first:before:double",
            "second:before:double",
            "first:after:double",
            "first:before:__finish__",
            "second:before:__finish__",
            "first:after:__finish__",
        ]
    );
    assert_eq!(ctx.feature::<Counting>().unwrap().prefix, "first");
    assert!(ctx.feature::<Veto>().is_none());
    assert_eq!(
        ctx.require_feature::<Veto>().unwrap_err().kind(),
        ErrorKind::Configuration
    );
}

#[tokio::test]
async fn interceptor_failure_aborts_the_run() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut builder = Pipeline::builder(ToolRegistry::empty());
    builder.install::<Veto>(()).unwrap();
    builder
        .install::<Counting>(("c".to_string(), Arc::clone(&log)))
        .unwrap();
    let mut ctx = AgentContext::new(Arc::new(SilentExecutor), Arc::new(builder.build()));

    let err = run_graph(&doubling_graph(), &mut ctx, 2).await.unwrap_err();

    match &err {
        GraphError::Interceptor {
            feature, kind, ..
        } => {
            assert_eq!(feature, "veto");
            assert_eq!(*kind, EventKind::NodeStarting);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Interceptor);
    assert!(!log.lock().unwrap().iter().any(|e| e.ends_with(":double")));
}

struct AuditSink;

impl Feature for AuditSink {
    type Config = ();
    const NAME: &'static str = "audit";

    fn install(_config: (), pipeline: &mut PipelineBuilder) -> Result<Arc<Self>, GraphError> {
        pipeline.intercept::<NodeFailed, _>(Self::NAME, |_event, _ctx| {
            Box::pin(async { Err(GraphError::custom("audit sink down")) })
        });
        Ok(Arc::new(Self))
    }
}

#[tokio::test]
async fn failing_failure_interceptor_surfaces_with_the_node_error() {
    let mut graph = GraphBuilder::<u32, u32>::new("breaks");
    let broken = graph.add_fn_node("broken", |_ctx, _n: u32| {
        Box::pin(async { Err::<u32, GraphError>(GraphError::custom("node broke")) })
    });
    let (start, finish) = (graph.start(), graph.finish());
    graph.add_edge(&start, &broken).add_edge(&broken, &finish);
    let graph = graph.build().unwrap();

    let mut builder = Pipeline::builder(ToolRegistry::empty());
    builder.install::<AuditSink>(()).unwrap();
    let mut ctx = AgentContext::new(Arc::new(SilentExecutor), Arc::new(builder.build()));

    let err = run_graph(&graph, &mut ctx, 1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Interceptor);
    match &err {
        GraphError::Interceptor {
            feature,
            kind,
            source,
            reported,
        } => {
            assert_eq!(feature, "audit");
            assert_eq!(*kind, EventKind::NodeFailed);
            assert_eq!(source.to_string(), "audit sink down");
            let reported = reported.as_deref().expect("node error should be kept");
            assert_eq!(reported.node_path(), Some("broken"));
            assert_eq!(
                std::error::Error::source(reported).map(ToString::to_string),
                Some("node broke".to_string())
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("while reporting: node failed: broken"));
}

#[test]
fn installing_a_feature_twice_is_rejected() {
    let mut builder = Pipeline::builder(ToolRegistry::empty());
    builder.install::<Veto>(()).unwrap();
    let err = builder.install::<Veto>(()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("already installed"));
}

#[tokio::test]
async fn install_with_adjusts_the_default_config() {
    let mut builder = Pipeline::builder(ToolRegistry::empty());
    let persistence = builder
        .install_with::<Persistence>(|config| config.enable_automatic_persistence = true)
        .unwrap();
    let mut ctx = AgentContext::new(Arc::new(SilentExecutor), Arc::new(builder.build()));
    run_graph(&doubling_graph(), &mut ctx, 1).await.unwrap();
    assert_eq!(persistence.checkpoints(ctx.run_id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn one_pipeline_serves_isolated_contexts() {
    let runs: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&runs);
    let mut builder = Pipeline::builder(ToolRegistry::empty());
    builder
        .install::<Persistence>(PersistenceConfig::default().automatic())
        .unwrap();
    builder
        .intercept::<RunStarting, _>("runs", move |event, _ctx| {
            sink.lock().unwrap().push(event.run_id.clone());
            Box::pin(async { Ok(()) })
        })
        .intercept::<RunCompleted, _>("runs", |event, ctx| {
            let matches = event.run_id == ctx.run_id();
            Box::pin(async move {
                assert!(matches);
                Ok(())
            })
        });
    let pipeline = Arc::new(builder.build());
    let graph = doubling_graph();

    let mut first = AgentContext::new(Arc::new(SilentExecutor), Arc::clone(&pipeline))
        .with_run_id("first");
    let mut second = AgentContext::new(Arc::new(SilentExecutor), Arc::clone(&pipeline))
        .with_run_id("second");

    let (a, b) = tokio::join!(
        run_graph(&graph, &mut first, 3),
        run_graph(&graph, &mut second, 3)
    );
    assert_eq!(a.unwrap(), 6);
    assert_eq!(b.unwrap(), 6);

    let persistence = pipeline.feature::<Persistence>().unwrap();
    let first_checkpoints = persistence.checkpoints("first").await.unwrap();
    let second_checkpoints = persistence.checkpoints("second").await.unwrap();
    assert_eq!(first_checkpoints.len(), 1);
    assert_eq!(second_checkpoints.len(), 1);
    assert_eq!(first_checkpoints[0].node_path, second_checkpoints[0].node_path);

    let mut seen = runs.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["first", "second"]);
}
