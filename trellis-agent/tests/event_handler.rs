use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use trellis_agent::{AgentBuilder, EventHandler, EventHandlerConfig};
use trellis_core::{
    FunctionTool, LlmRequest, LlmResponse, ModelExecutor, ParameterKind, ToolCall,
    ToolParameter, ToolRegistry, TrellisError,
};
use trellis_graph::pipeline::EventKind;

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

fn counter_tool() -> FunctionTool {
    FunctionTool::builder("count", "Counts the letters of a word")
        .parameter(ToolParameter::required(
            "word",
            ParameterKind::String,
            "word to count",
        ))
        .handler(|args| async move {
            Ok(json!(args["word"].as_str().unwrap_or_default().len()))
        })
}

type Log = Arc<Mutex<Vec<String>>>;

fn sink(log: &Log) -> impl Fn(String) + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |entry| log.lock().unwrap().push(entry)
}

fn logging_config(log: &Log) -> EventHandlerConfig {
    EventHandlerConfig::default()
        .on_run_starting({
            let push = sink(log);
            move |event| push(format!("run:{}", event.input))
        })
        .on_node_completed({
            let push = sink(log);
            move |event| push(format!("done:{}", event.node))
        })
        .on_llm_call_starting({
            let push = sink(log);
            move |event| push(format!("llm:{}", event.request.messages.len()))
        })
        .on_tool_call_starting({
            let push = sink(log);
            move |event| push(format!("tool:{}", event.call.name))
        })
        .on_tool_call_succeeded({
            let push = sink(log);
            move |event| push(format!("result:{}", event.result))
        })
        .on_run_completed({
            let push = sink(log);
            move |event| push(format!("output:{}", event.output))
        })
        .on_run_failed({
            let push = sink(log);
            move |event| push(format!("failed:{:?}", event.error_kind))
        })
}

#[tokio::test]
async fn callbacks_see_the_whole_run() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let tools = ToolRegistry::builder()
        .register(counter_tool())
        .build()
        .unwrap();
    let mut agent = AgentBuilder::single_run()
        .unwrap()
        .executor(scripted(vec![
            LlmResponse::with_tool_calls(vec![ToolCall::new(
                "c1",
                "count",
                json!({"word": "trellis"}),
            )]),
            LlmResponse::text("7 letters"),
        ]))
        .tools(tools)
        .install::<EventHandler>(logging_config(&log))
        .build()
        .unwrap();

    agent.run("count trellis".to_string()).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "run:\"count trellis\"",
            "done:__start__",
            "llm:1",
            "done:call_llm",
            "tool:count",
            "result:7",
            "done:execute_tool",
            "llm:3",
            "done:send_tool_result",
            "done:__finish__",
            "output:\"7 letters\"",
        ]
    );

    let handler = agent.feature::<EventHandler>().unwrap();
    assert!(handler.handles(EventKind::ToolCallStarting));
    assert!(!handler.handles(EventKind::NodeFailed));
}

#[tokio::test]
async fn failures_reach_the_failure_callbacks() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let push = sink(&log);
    let config =
        logging_config(&log).on_node_failed(move |event| push(format!("node_failed:{}", event.node)));
    let mut agent = AgentBuilder::single_run()
        .unwrap()
        .executor(scripted(vec![]))
        .install::<EventHandler>(config)
        .build()
        .unwrap();

    agent.run("anyone there?".to_string()).await.unwrap_err();

    let log = log.lock().unwrap();
    assert_eq!(
        log[log.len() - 2..],
        ["node_failed:call_llm", "failed:ModelCall"]
    );
}

#[test]
fn callbacks_are_counted_per_registration() {
    let config = EventHandlerConfig::default()
        .on_node_starting(|_| {})
        .on_node_starting(|_| {})
        .on_llm_stream_frame(|_| {});
    assert_eq!(config.len(), 3);
    assert!(EventHandlerConfig::default().is_empty());
}
