use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{TrellisError, Value};

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant message requesting one or more tool calls.
    pub fn tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

/// A model reply. Multiple tool calls produced by one reply are carried
/// together in `tool_calls`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn into_message(self) -> Message {
        Message::tool_calls(self.content, self.tool_calls)
    }
}

/// One fragment of a streamed model reply.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    ContentDelta { text: String },
    ToolCall { call: ToolCall },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

/// Collects streamed frames back into a complete reply.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl StreamAccumulator {
    pub fn push(&mut self, frame: &StreamFrame) {
        match frame {
            StreamFrame::ContentDelta { text } => self.content.push_str(text),
            StreamFrame::ToolCall { call } => self.tool_calls.push(call.clone()),
            StreamFrame::End { .. } => {}
        }
    }

    pub fn finish(self) -> LlmResponse {
        LlmResponse {
            content: self.content,
            tool_calls: self.tool_calls,
        }
    }
}

/// The external collaborator that turns a conversation and a tool list into a
/// reply.
#[async_trait::async_trait]
pub trait ModelExecutor: Send + Sync + 'static {
    async fn execute(&self, request: LlmRequest) -> Result<LlmResponse, TrellisError>;

    /// Finite, non-restartable stream of reply fragments. The default
    /// implementation replays a single `execute` call as frames.
    fn execute_streaming(
        &self,
        request: LlmRequest,
    ) -> BoxStream<'_, Result<StreamFrame, TrellisError>> {
        stream::once(async move { self.execute(request).await })
            .flat_map(|result| {
                let frames: Vec<Result<StreamFrame, TrellisError>> = match result {
                    Ok(response) => {
                        let mut frames = Vec::with_capacity(response.tool_calls.len() + 2);
                        if !response.content.is_empty() {
                            frames.push(Ok(StreamFrame::ContentDelta {
                                text: response.content,
                            }));
                        }
                        frames.extend(
                            response
                                .tool_calls
                                .into_iter()
                                .map(|call| Ok(StreamFrame::ToolCall { call })),
                        );
                        frames.push(Ok(StreamFrame::End {
                            finish_reason: None,
                        }));
                        frames
                    }
                    Err(err) => vec![Err(err)],
                };
                stream::iter(frames)
            })
            .boxed()
    }
}
