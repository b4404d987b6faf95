use crate::error::{LlmError, Result};
use crate::sse::decode_sse;
use crate::types::{ChatMessage, StreamChunk, ToolDefinition, Usage};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub(crate) struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = AnthropicRequest::new(&self.model, messages, tools);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "anthropic stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));

        let stream = futures_util::stream::unfold(
            (sse, Usage::default(), false),
            |(mut sse, mut usage, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    let frame = match sse.as_mut().next().await? {
                        Ok(v) => v,
                        Err(e) => return Some((Err(e), (sse, usage, false))),
                    };

                    match frame.event.as_str() {
                        "message_start" => {
                            if let Ok(v) =
                                serde_json::from_str::<AnthropicMessageStart>(&frame.data)
                            {
                                usage.prompt_tokens = v.message.usage.input_tokens as u32;
                                usage.completion_tokens = v.message.usage.output_tokens as u32;
                            }
                        }
                        "content_block_start" => {
                            if let Ok(v) =
                                serde_json::from_str::<AnthropicContentBlockStart>(&frame.data)
                            {
                                if let AnthropicContentBlock::ToolUse { id, name, .. } =
                                    v.content_block
                                {
                                    return Some((
                                        Ok(StreamChunk::ToolCallStart { id, name }),
                                        (sse, usage, false),
                                    ));
                                }
                            }
                        }
                        "content_block_delta" => {
                            let v: AnthropicContentBlockDelta =
                                match serde_json::from_str(&frame.data) {
                                    Ok(v) => v,
                                    Err(e) => {
                                        return Some((
                                            Err(LlmError::StreamParse(format!(
                                                "anthropic delta json error={e} data={}",
                                                frame.data
                                            ))),
                                            (sse, usage, false),
                                        ));
                                    }
                                };
                            let chunk = match v.delta {
                                AnthropicDelta::TextDelta { text } if !text.is_empty() => {
                                    StreamChunk::Delta { content: text }
                                }
                                AnthropicDelta::InputJsonDelta { partial_json }
                                    if !partial_json.is_empty() =>
                                {
                                    StreamChunk::ToolCallDelta {
                                        arguments: partial_json,
                                    }
                                }
                                _ => continue,
                            };
                            return Some((Ok(chunk), (sse, usage, false)));
                        }
                        "message_delta" => {
                            if let Ok(v) =
                                serde_json::from_str::<AnthropicMessageDelta>(&frame.data)
                            {
                                if let Some(u) = v.usage {
                                    usage.completion_tokens = u.output_tokens as u32;
                                }
                            }
                        }
                        "message_stop" => {
                            let done = StreamChunk::Done {
                                usage: usage.clone(),
                            };
                            return Some((Ok(done), (sse, usage, true)));
                        }
                        "error" => {
                            return Some((
                                Err(LlmError::Http(format!(
                                    "anthropic stream error event data={}",
                                    frame.data
                                ))),
                                (sse, usage, true),
                            ));
                        }
                        _ => {}
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    stream: bool,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let mut system = String::new();
        let mut out: Vec<AnthropicMessage> = Vec::new();

        for m in messages {
            match m {
                ChatMessage::System { content } => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(content.trim());
                }
                ChatMessage::User { content } => push_block(
                    &mut out,
                    "user",
                    AnthropicContentBlock::Text {
                        text: content.clone(),
                    },
                ),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    if !content.trim().is_empty() {
                        push_block(
                            &mut out,
                            "assistant",
                            AnthropicContentBlock::Text {
                                text: content.clone(),
                            },
                        );
                    }
                    for tc in tool_calls {
                        let input = serde_json::from_str::<serde_json::Value>(&tc.arguments)
                            .ok()
                            .filter(|v| v.is_object())
                            .unwrap_or_else(|| serde_json::json!({}));
                        push_block(
                            &mut out,
                            "assistant",
                            AnthropicContentBlock::ToolUse {
                                id: tc.id.clone(),
                                name: tc.name.clone(),
                                input,
                            },
                        );
                    }
                }
                ChatMessage::ToolResult {
                    content,
                    tool_call_id,
                } => push_block(
                    &mut out,
                    "user",
                    AnthropicContentBlock::ToolResult {
                        tool_use_id: tool_call_id.clone(),
                        content: content.clone(),
                    },
                ),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: out,
            tools: tools.iter().map(to_anthropic_tool).collect(),
            stream: true,
        }
    }
}

/// Appends to the previous message when the role repeats; the Messages API
/// expects alternating roles.
fn push_block(out: &mut Vec<AnthropicMessage>, role: &'static str, block: AnthropicContentBlock) {
    if let Some(last) = out.last_mut().filter(|m| m.role == role) {
        last.content.push(block);
        return;
    }
    out.push(AnthropicMessage {
        role,
        content: vec![block],
    });
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    message: AnthropicMessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStartMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockStart {
    content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}
