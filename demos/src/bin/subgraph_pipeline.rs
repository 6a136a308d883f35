//! A model-free graph: words are normalized inside a subgraph, then routed
//! by length. An event handler prints the traversal as it happens.

use trellis_agent::{AgentBuilder, EventHandler, EventHandlerConfig};
use trellis_core::{LlmRequest, LlmResponse, ModelExecutor, TrellisError};
use trellis_graph::{GraphBuilder, GraphError, Route, SubgraphOptions};

struct NoModel;

#[async_trait::async_trait]
impl ModelExecutor for NoModel {
    async fn execute(&self, _request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        Err(TrellisError::ModelExecutor(
            "this graph never calls a model".to_string(),
        ))
    }
}

fn normalize() -> Result<trellis_graph::Graph<String, String>, GraphError> {
    let mut builder = GraphBuilder::<String, String>::new("normalize");
    let trim = builder.add_fn_node("trim", |_ctx, text: String| {
        Box::pin(async move { Ok::<String, GraphError>(text.trim().to_string()) })
    });
    let lower = builder.add_fn_node("lower", |_ctx, text: String| {
        Box::pin(async move { Ok::<String, GraphError>(text.to_lowercase()) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &trim)
        .add_edge(&trim, &lower)
        .add_edge(&lower, &finish);
    builder.build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subgraph_pipeline=info".parse()?),
        )
        .init();

    let inner = normalize()?;
    let mut builder = GraphBuilder::<String, String>::new("classify");
    let clean = builder.add_subgraph("clean", &inner, SubgraphOptions::default());
    let short = builder.add_fn_node("short", |_ctx, word: String| {
        Box::pin(async move { Ok::<String, GraphError>(format!("{word} is short")) })
    });
    let long = builder.add_fn_node("long", |_ctx, length: usize| {
        Box::pin(async move { Ok::<String, GraphError>(format!("{length} letters is long")) })
    });
    let (start, finish) = (builder.start(), builder.finish());
    builder
        .add_edge(&start, &clean)
        .add_conditional_edge(
            &clean,
            &short,
            Route::new().only_if(|word: &String| word.len() <= 5),
        )
        .add_conditional_edge(
            &clean,
            &long,
            Route::new().when(|word: &String| word.len() > 5, |word: String| word.len()),
        )
        .add_edge(&short, &finish)
        .add_edge(&long, &finish);
    let graph = builder.build()?;

    let events = EventHandlerConfig::default()
        .on_node_starting(|event| println!("-> {}", event.node_path.join("/")))
        .on_node_completed(|event| println!("<- {} = {}", event.node, event.output))
        .on_run_completed(|event| println!("done: {}", event.output));

    let mut agent = AgentBuilder::new(graph)
        .executor(NoModel)
        .install::<EventHandler>(events)
        .build()?;

    for word in ["  Rust ", "Trellises"] {
        let verdict = agent.run(word.to_string()).await?;
        tracing::info!(input = word, %verdict, "classified");
    }
    Ok(())
}
