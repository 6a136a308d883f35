//! Ready-made graphs for the common call-model / run-tool loop.

use crate::nodes::{
    CallModel, ExecuteTool, ExecuteTools, ExecuteToolsParallel, SendToolResult, SendToolResults,
};
use crate::{Graph, GraphBuilder, GraphError, Route};

/// Sends the input to the model, runs each requested tool one at a time and
/// feeds results back until the model answers in plain text. Replies with a
/// single call go through `execute_tool`; replies with several go through
/// `execute_tools`.
pub fn single_run() -> Result<Graph<String, String>, GraphError> {
    let mut builder = GraphBuilder::<String, String>::new("single_run");
    let call_llm = builder.add_node("call_llm", CallModel);
    let execute_tool = builder.add_node("execute_tool", ExecuteTool);
    let send_tool_result = builder.add_node("send_tool_result", SendToolResult);
    let execute_tools = builder.add_node("execute_tools", ExecuteTools);
    let send_tool_results = builder.add_node("send_tool_results", SendToolResults);
    let (start, finish) = (builder.start(), builder.finish());

    // Multi-call edges come first: `on_tool_call` would take those replies
    // too and keep only their first call.
    builder
        .add_edge(&start, &call_llm)
        .add_conditional_edge(&call_llm, &execute_tools, Route::on_multiple_tool_calls())
        .add_conditional_edge(&call_llm, &execute_tool, Route::on_tool_call())
        .add_conditional_edge(&call_llm, &finish, Route::on_assistant_message())
        .add_edge(&execute_tool, &send_tool_result)
        .add_conditional_edge(&send_tool_result, &execute_tools, Route::on_multiple_tool_calls())
        .add_conditional_edge(&send_tool_result, &execute_tool, Route::on_tool_call())
        .add_conditional_edge(&send_tool_result, &finish, Route::on_assistant_message())
        .add_edge(&execute_tools, &send_tool_results)
        .add_conditional_edge(&send_tool_results, &execute_tools, Route::on_multiple_tool_calls())
        .add_conditional_edge(&send_tool_results, &execute_tool, Route::on_tool_call())
        .add_conditional_edge(&send_tool_results, &finish, Route::on_assistant_message());
    builder.build()
}

/// Like [`single_run`] but executes all calls of one reply concurrently.
pub fn single_run_parallel() -> Result<Graph<String, String>, GraphError> {
    let mut builder = GraphBuilder::<String, String>::new("single_run_parallel");
    let call_llm = builder.add_node("call_llm", CallModel);
    let execute_tools = builder.add_node("execute_tools", ExecuteToolsParallel);
    let send_tool_results = builder.add_node("send_tool_results", SendToolResults);
    let (start, finish) = (builder.start(), builder.finish());

    builder
        .add_edge(&start, &call_llm)
        .add_conditional_edge(&call_llm, &execute_tools, Route::on_tool_calls())
        .add_conditional_edge(&call_llm, &finish, Route::on_assistant_message())
        .add_edge(&execute_tools, &send_tool_results)
        .add_conditional_edge(&send_tool_results, &execute_tools, Route::on_tool_calls())
        .add_conditional_edge(&send_tool_results, &finish, Route::on_assistant_message());
    builder.build()
}
