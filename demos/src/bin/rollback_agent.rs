//! A single-run agent that creates users through a tool, checkpoints every
//! step into sqlite, then rolls back past the second user. The inverse tool
//! removes that user again.
//!
//! Run with `RUST_LOG=trellis_graph=debug` to watch the traversal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use trellis_agent::{AgentBuilder, TraceConfig, TraceFeature};
use trellis_checkpoint_sqlite::SqliteCheckpointStorage;
use trellis_core::{
    FunctionTool, LlmRequest, LlmResponse, ModelExecutor, ParameterKind, ToolCall,
    ToolParameter, ToolRegistry, TrellisError,
};
use trellis_graph::{Persistence, PersistenceConfig, RollbackStrategy, RollbackToolRegistry};

/// Replays canned replies in place of a hosted model.
struct ScriptedModel {
    replies: Mutex<VecDeque<LlmResponse>>,
}

#[async_trait::async_trait]
impl ModelExecutor for ScriptedModel {
    async fn execute(&self, request: LlmRequest) -> Result<LlmResponse, TrellisError> {
        tracing::info!(messages = request.messages.len(), "model called");
        self.replies
            .lock()
            .map_err(|_| TrellisError::ModelExecutor("script lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| TrellisError::ModelExecutor("script exhausted".to_string()))
    }
}

type Users = Arc<Mutex<Vec<String>>>;

fn name_parameter() -> ToolParameter {
    ToolParameter::required("name", ParameterKind::String, "user name")
}

fn create_user(users: &Users) -> FunctionTool {
    let users = Arc::clone(users);
    FunctionTool::builder("create_user", "Creates a user")
        .parameter(name_parameter())
        .handler(move |args| {
            let users = Arc::clone(&users);
            async move {
                let name = args["name"].as_str().unwrap_or_default().to_string();
                if let Ok(mut users) = users.lock() {
                    users.push(name.clone());
                }
                Ok(json!(format!("created {name}")))
            }
        })
}

fn remove_user(users: &Users) -> FunctionTool {
    let users = Arc::clone(users);
    FunctionTool::builder("remove_user", "Removes a user")
        .parameter(name_parameter())
        .handler(move |args| {
            let users = Arc::clone(&users);
            async move {
                let name = args["name"].as_str().unwrap_or_default().to_string();
                if let Ok(mut users) = users.lock() {
                    users.retain(|user| user != &name);
                }
                Ok(json!(format!("removed {name}")))
            }
        })
}

fn snapshot(users: &Users) -> Vec<String> {
    users.lock().map(|users| users.clone()).unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rollback_agent=info".parse()?),
        )
        .init();

    let users: Users = Arc::new(Mutex::new(Vec::new()));
    let storage = SqliteCheckpointStorage::builder("sqlite::memory:")
        .build()
        .await?;

    let model = ScriptedModel {
        replies: Mutex::new(VecDeque::from(vec![
            LlmResponse::with_tool_calls(vec![ToolCall::new(
                "call-alex",
                "create_user",
                json!({"name": "Alex"}),
            )]),
            LlmResponse::with_tool_calls(vec![ToolCall::new(
                "call-daniel",
                "create_user",
                json!({"name": "Daniel"}),
            )]),
            LlmResponse::text("Alex and Daniel are set up."),
        ])),
    };

    let tools = ToolRegistry::builder()
        .register(create_user(&users))
        .build()?;
    let rollback = RollbackToolRegistry::builder()
        .register("create_user", remove_user(&users))
        .build();

    let mut agent = AgentBuilder::single_run()?
        .executor(model)
        .model("scripted")
        .system_prompt("You manage user accounts.")
        .tools(tools)
        .id("onboarding")
        .install::<Persistence>(
            PersistenceConfig::default()
                .with_storage(storage.clone())
                .with_strategy(RollbackStrategy::HistoryOnly)
                .with_rollback_tools(rollback)
                .automatic(),
        )
        .install::<TraceFeature>(TraceConfig::default())
        .build()?;

    let answer = agent.run("Add Alex, then Daniel.".to_string()).await?;
    tracing::info!(%answer, users = ?snapshot(&users), "run finished");

    let persistence = agent
        .feature::<Persistence>()
        .ok_or_else(|| anyhow::anyhow!("persistence is not installed"))?;
    let checkpoints = persistence.checkpoints(agent.id()).await?;
    for checkpoint in &checkpoints {
        tracing::info!(
            version = checkpoint.version,
            node = ?checkpoint.node(),
            messages = checkpoint.history.len(),
            "checkpoint"
        );
    }

    // The first tool result has been sent back to the model; Daniel is not
    // created yet.
    let after_alex = checkpoints
        .iter()
        .find(|checkpoint| checkpoint.node() == Some("send_tool_result"))
        .ok_or_else(|| anyhow::anyhow!("no checkpoint after the first tool call"))?;
    persistence
        .rollback_to_checkpoint(agent.context_mut(), &after_alex.checkpoint_id)
        .await?;
    tracing::info!(
        users = ?snapshot(&users),
        messages = agent.context().history().len(),
        "rolled back"
    );

    if let Some(trace) = agent.feature::<TraceFeature>() {
        for span in trace.spans_for_run(agent.id()) {
            println!(
                "{:?} {} {:?} {}ms",
                span.kind,
                span.name,
                span.status,
                span.duration_ms()
            );
        }
    }
    Ok(())
}
