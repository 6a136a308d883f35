//! Distinguished nodes that talk to the model executor and the tools in
//! scope, plus the routes that connect them.
//!
//! Every node here commits to the conversation only after its external call
//! has returned, so a cancelled node leaves history untouched.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use trellis_core::{
    encode_result, LlmRequest, LlmResponse, Message, NodeValue, StreamAccumulator, Tool,
    ToolCall, ToolError, Value,
};

use crate::pipeline::{
    LlmCallCompleted, LlmCallStarting, LlmStreamFrame, ToolCallFailed, ToolCallStarting,
    ToolCallSucceeded, ToolValidationFailed,
};
use crate::{AgentContext, GraphError, GraphNode, Route};

/// Outcome of one executed tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    /// Text appended to the conversation.
    pub content: String,
    pub raw: Value,
}

impl ToolResult {
    pub fn into_message(self) -> Message {
        Message::tool_result(self.call_id, self.content)
    }
}

async fn request_model(
    ctx: &mut AgentContext,
    request: LlmRequest,
) -> Result<LlmResponse, GraphError> {
    let step_id = ctx.position().step_id();
    let model = request.model.clone();
    ctx.fire(LlmCallStarting {
        step_id,
        model: model.clone(),
        request: request.clone(),
    })
    .await?;
    let executor = ctx.executor().clone();
    let response = executor.execute(request).await?;
    ctx.fire(LlmCallCompleted {
        step_id,
        model,
        response: response.clone(),
    })
    .await?;
    Ok(response)
}

/// Appends the input as a user message and asks the model for a reply.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallModel;

#[async_trait::async_trait]
impl GraphNode for CallModel {
    type Input = String;
    type Output = LlmResponse;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        input: String,
    ) -> Result<LlmResponse, GraphError> {
        let mut request = ctx.llm_request();
        request.messages.push(Message::user(input.clone()));
        let response = request_model(ctx, request).await?;
        let history = ctx.history_mut();
        history.push(Message::user(input));
        history.push(response.clone().into_message());
        Ok(response)
    }
}

/// [`CallModel`] over the executor's streaming interface. Every frame is
/// published as an [`LlmStreamFrame`] event before the reply is assembled.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallModelStreaming;

#[async_trait::async_trait]
impl GraphNode for CallModelStreaming {
    type Input = String;
    type Output = LlmResponse;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        input: String,
    ) -> Result<LlmResponse, GraphError> {
        let mut request = ctx.llm_request();
        request.messages.push(Message::user(input.clone()));
        let step_id = ctx.position().step_id();
        let model = request.model.clone();
        ctx.fire(LlmCallStarting {
            step_id,
            model: model.clone(),
            request: request.clone(),
        })
        .await?;

        let executor = ctx.executor().clone();
        let mut frames = executor.execute_streaming(request);
        let mut accumulator = StreamAccumulator::default();
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            accumulator.push(&frame);
            ctx.fire(LlmStreamFrame {
                step_id,
                model: model.clone(),
                frame,
            })
            .await?;
        }
        let response = accumulator.finish();

        ctx.fire(LlmCallCompleted {
            step_id,
            model,
            response: response.clone(),
        })
        .await?;
        let history = ctx.history_mut();
        history.push(Message::user(input));
        history.push(response.clone().into_message());
        Ok(response)
    }
}

/// Resolves and validates a call against the tools in scope. Fires
/// `ToolValidationFailed` on rejection.
async fn prepare_call(
    ctx: &mut AgentContext,
    call: &ToolCall,
) -> Result<Arc<dyn Tool>, GraphError> {
    let step_id = ctx.position().step_id();
    let checked = match ctx.tools().get(&call.name) {
        Some(tool) => match tool.descriptor().validate_args(&call.args) {
            Ok(()) => Ok(tool),
            Err(err) => Err(err.to_string()),
        },
        None => Err("tool is not available in this scope".to_string()),
    };
    match checked {
        Ok(tool) => Ok(tool),
        Err(reason) => {
            ctx.fire(ToolValidationFailed {
                step_id,
                call: call.clone(),
                error: reason.clone(),
            })
            .await?;
            Err(GraphError::ToolValidation {
                tool: call.name.clone(),
                reason,
            })
        }
    }
}

/// Fires the result event for an executed call and converts the outcome.
async fn report_call(
    ctx: &mut AgentContext,
    call: &ToolCall,
    outcome: Result<Value, ToolError>,
) -> Result<ToolResult, GraphError> {
    let step_id = ctx.position().step_id();
    let error = match outcome.and_then(|raw| encode_result(&raw).map(|text| (raw, text))) {
        Ok((raw, content)) => {
            ctx.fire(ToolCallSucceeded {
                step_id,
                call: call.clone(),
                result: raw.clone(),
            })
            .await?;
            return Ok(ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content,
                raw,
            });
        }
        Err(error) => error,
    };

    let reason = error.to_string();
    if error.is_validation() {
        ctx.fire(ToolValidationFailed {
            step_id,
            call: call.clone(),
            error: reason.clone(),
        })
        .await?;
        Err(GraphError::ToolValidation {
            tool: call.name.clone(),
            reason,
        })
    } else {
        ctx.fire(ToolCallFailed {
            step_id,
            call: call.clone(),
            error: reason.clone(),
        })
        .await?;
        Err(GraphError::ToolExecution {
            tool: call.name.clone(),
            reason,
        })
    }
}

/// Runs a single tool call and appends its result to the conversation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteTool;

#[async_trait::async_trait]
impl GraphNode for ExecuteTool {
    type Input = ToolCall;
    type Output = ToolResult;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        call: ToolCall,
    ) -> Result<ToolResult, GraphError> {
        ctx.fire(ToolCallStarting {
            step_id: ctx.position().step_id(),
            call: call.clone(),
        })
        .await?;
        let tool = prepare_call(ctx, &call).await?;
        let outcome = tool.execute(call.args.clone()).await;
        let result = report_call(ctx, &call, outcome).await?;
        ctx.history_mut().push(result.clone().into_message());
        Ok(result)
    }
}

/// Runs every call of one model reply in order. Results are appended to the
/// conversation together once the last call has finished; a failing call
/// fails the step before the calls after it start.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteTools;

#[async_trait::async_trait]
impl GraphNode for ExecuteTools {
    type Input = Vec<ToolCall>;
    type Output = Vec<ToolResult>;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        calls: Vec<ToolCall>,
    ) -> Result<Vec<ToolResult>, GraphError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            ctx.fire(ToolCallStarting {
                step_id: ctx.position().step_id(),
                call: call.clone(),
            })
            .await?;
            let tool = prepare_call(ctx, call).await?;
            let outcome = tool.execute(call.args.clone()).await;
            results.push(report_call(ctx, call, outcome).await?);
        }
        ctx.history_mut()
            .extend(results.iter().cloned().map(ToolResult::into_message));
        Ok(results)
    }
}

/// Runs every call of one model reply concurrently.
///
/// Start events fire in call order before anything runs; result events fire
/// in call order once all calls have finished. If any call fails the whole
/// step fails and nothing is appended to the conversation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteToolsParallel;

#[async_trait::async_trait]
impl GraphNode for ExecuteToolsParallel {
    type Input = Vec<ToolCall>;
    type Output = Vec<ToolResult>;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        calls: Vec<ToolCall>,
    ) -> Result<Vec<ToolResult>, GraphError> {
        let mut tools = Vec::with_capacity(calls.len());
        for call in &calls {
            ctx.fire(ToolCallStarting {
                step_id: ctx.position().step_id(),
                call: call.clone(),
            })
            .await?;
            tools.push(prepare_call(ctx, call).await?);
        }

        let outcomes = join_all(
            tools
                .iter()
                .zip(&calls)
                .map(|(tool, call)| tool.execute(call.args.clone())),
        )
        .await;

        let mut results = Vec::with_capacity(calls.len());
        let mut first_error = None;
        for (call, outcome) in calls.iter().zip(outcomes) {
            match report_call(ctx, call, outcome).await {
                Ok(result) => results.push(result),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(_) => {}
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        ctx.history_mut()
            .extend(results.iter().cloned().map(ToolResult::into_message));
        Ok(results)
    }
}

/// Asks the model to continue once a tool result is in the conversation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendToolResult;

#[async_trait::async_trait]
impl GraphNode for SendToolResult {
    type Input = ToolResult;
    type Output = LlmResponse;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        _result: ToolResult,
    ) -> Result<LlmResponse, GraphError> {
        let request = ctx.llm_request();
        let response = request_model(ctx, request).await?;
        ctx.history_mut().push(response.clone().into_message());
        Ok(response)
    }
}

/// [`SendToolResult`] for a batch of results.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendToolResults;

#[async_trait::async_trait]
impl GraphNode for SendToolResults {
    type Input = Vec<ToolResult>;
    type Output = LlmResponse;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        _results: Vec<ToolResult>,
    ) -> Result<LlmResponse, GraphError> {
        let request = ctx.llm_request();
        let response = request_model(ctx, request).await?;
        ctx.history_mut().push(response.clone().into_message());
        Ok(response)
    }
}

const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the conversation so far. Keep every fact, \
decision and tool result needed to continue the task.";

/// Replaces the conversation with its system messages and a model-written
/// summary, then passes its input through unchanged.
pub struct CompressHistory<T> {
    prompt: String,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Default for CompressHistory<T> {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<T> CompressHistory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

#[async_trait::async_trait]
impl<T: NodeValue> GraphNode for CompressHistory<T> {
    type Input = T;
    type Output = T;

    async fn invoke(&self, ctx: &mut AgentContext, input: T) -> Result<T, GraphError> {
        let mut request = ctx.llm_request();
        request.tools.clear();
        request.messages.push(Message::user(self.prompt.clone()));
        let summary = request_model(ctx, request).await?;

        let mut compressed: Vec<Message> = ctx.history().system_messages().cloned().collect();
        compressed.push(Message::assistant(summary.content));
        tracing::debug!(
            before = ctx.history().len(),
            after = compressed.len(),
            "history compressed"
        );
        ctx.history_mut().replace(compressed);
        Ok(input)
    }
}

impl Route<LlmResponse, ToolCall> {
    /// Taken when the reply requests a tool; yields the first call. Any
    /// further calls of the same reply are dropped, so graphs that may see
    /// several calls declare [`Route::on_multiple_tool_calls`] first.
    pub fn on_tool_call() -> Self {
        Route::new().when(LlmResponse::has_tool_calls, |response| {
            response.tool_calls.into_iter().next().unwrap_or_else(|| {
                ToolCall::new(String::new(), String::new(), Value::Null)
            })
        })
    }

    /// Taken when the reply requests the tool `name`; yields that call.
    pub fn on_tool_named(name: impl Into<String>) -> Self {
        let name = name.into();
        let wanted = name.clone();
        Route::new().when(
            move |response: &LlmResponse| response.tool_calls.iter().any(|c| c.name == wanted),
            move |response| {
                response
                    .tool_calls
                    .into_iter()
                    .find(|call| call.name == name)
                    .unwrap_or_else(|| ToolCall::new(String::new(), String::new(), Value::Null))
            },
        )
    }
}

impl Route<LlmResponse, Vec<ToolCall>> {
    /// Taken when the reply requests any tools; yields all calls.
    pub fn on_tool_calls() -> Self {
        Route::new().when(LlmResponse::has_tool_calls, |response| response.tool_calls)
    }

    /// Taken when the reply requests more than one tool.
    pub fn on_multiple_tool_calls() -> Self {
        Route::new().when(
            |response: &LlmResponse| response.tool_calls.len() > 1,
            |response| response.tool_calls,
        )
    }
}

impl Route<LlmResponse, String> {
    /// Taken when the reply is plain text.
    pub fn on_assistant_message() -> Self {
        Route::new().when(
            |response: &LlmResponse| !response.has_tool_calls(),
            |response| response.content,
        )
    }
}
