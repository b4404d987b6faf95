//! OpenAI-compatible chat completions (OpenAI, Google GenAI, Azure OpenAI, Ollama).

use crate::error::{LlmError, Result};
use crate::sse::decode_sse;
use crate::types::{ChatMessage, StreamChunk, ToolDefinition, Usage};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EndpointAuth {
    Bearer(String),
    /// Azure-style `api-key` header.
    ApiKeyHeader(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenAiEndpoint {
    pub url: String,
    pub auth: EndpointAuth,
}

#[derive(Clone)]
pub(crate) struct OpenAiClient {
    http: reqwest::Client,
    endpoint: OpenAiEndpoint,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, endpoint: OpenAiEndpoint, model: &str) -> Self {
        Self {
            http,
            endpoint,
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(url = %self.endpoint.url))]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = OpenAiChatRequest::new(&self.model, messages, tools);

        let mut builder = self.http.post(&self.endpoint.url).json(&req);
        builder = match &self.endpoint.auth {
            EndpointAuth::Bearer(key) => builder.bearer_auth(key),
            EndpointAuth::ApiKeyHeader(key) => builder.header("api-key", key),
            EndpointAuth::None => builder,
        };
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "chat completions stream status={status} body={body}"
            )));
        }

        let state = OpenAiStreamState::default();
        let sse = Box::pin(decode_sse(response.bytes_stream()));

        let stream =
            futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
                loop {
                    if let Some(chunk) = state.pending.pop() {
                        return Some((Ok(chunk), (sse, state)));
                    }
                    if state.finished {
                        return None;
                    }
                    let frame = match sse.as_mut().next().await {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Some((Err(e), (sse, state))),
                        None => {
                            // Some local servers close the body without `[DONE]`.
                            state.finished = true;
                            let usage = state.usage.clone().unwrap_or_default();
                            return Some((Ok(StreamChunk::Done { usage }), (sse, state)));
                        }
                    };
                    if frame.data.trim() == "[DONE]" {
                        state.finished = true;
                        let usage = state.usage.clone().unwrap_or_default();
                        return Some((Ok(StreamChunk::Done { usage }), (sse, state)));
                    }

                    let chunk: OpenAiStreamResponseChunk = match serde_json::from_str(&frame.data)
                    {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::StreamParse(format!(
                                    "chat completions chunk json error={e} data={}",
                                    frame.data
                                ))),
                                (sse, state),
                            ));
                        }
                    };
                    state.absorb(chunk);
                }
            });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let tools: Vec<OpenAiTool> = tools.iter().map(to_openai_tool).collect();
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let text = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());
    match m {
        ChatMessage::System { content } => OpenAiMessage {
            role: "system",
            content: text(content),
            tool_calls: vec![],
            tool_call_id: None,
        },
        ChatMessage::User { content } => OpenAiMessage {
            role: "user",
            content: Some(content.clone()),
            tool_calls: vec![],
            tool_call_id: None,
        },
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => OpenAiMessage {
            role: "assistant",
            content: if tool_calls.is_empty() {
                Some(content.clone())
            } else {
                text(content)
            },
            tool_calls: tool_calls
                .iter()
                .map(|tc| OpenAiToolCall {
                    id: tc.id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiToolFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
            tool_call_id: None,
        },
        ChatMessage::ToolResult {
            content,
            tool_call_id,
        } => OpenAiMessage {
            role: "tool",
            content: Some(content.clone()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.clone()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct OpenAiStreamToolCallState {
    id: Option<String>,
    name: Option<String>,
    started: bool,
    /// Argument text that arrived before the call could be announced.
    buffered_arguments: String,
}

#[derive(Debug, Default)]
struct OpenAiStreamState {
    tool_calls: HashMap<u32, OpenAiStreamToolCallState>,
    usage: Option<Usage>,
    /// Chunks ready to emit, stored in reverse order.
    pending: Vec<StreamChunk>,
    finished: bool,
}

impl OpenAiStreamState {
    fn absorb(&mut self, chunk: OpenAiStreamResponseChunk) {
        if let Some(u) = chunk.usage.as_ref() {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
            });
        }

        let mut out = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            let delta = &choice.delta;
            if let Some(content) = delta.content.as_ref().filter(|c| !c.is_empty()) {
                out.push(StreamChunk::Delta {
                    content: content.clone(),
                });
            }

            for tc in delta.tool_calls.iter().flatten() {
                let idx = tc.index.unwrap_or(0);
                let entry = self.tool_calls.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id = tc.id.clone().filter(|s| !s.is_empty());
                }
                if entry.name.is_none() {
                    entry.name = tc.function.as_ref().and_then(|f| f.name.clone());
                }
                let arguments = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default();

                if !entry.started {
                    entry.buffered_arguments.push_str(&arguments);
                    let Some(name) = entry.name.clone() else {
                        continue;
                    };
                    entry.started = true;
                    // Ollama omits ids; the interpreter assigns one later.
                    out.push(StreamChunk::ToolCallStart {
                        id: entry.id.clone().unwrap_or_default(),
                        name,
                    });
                    let buffered = std::mem::take(&mut entry.buffered_arguments);
                    if !buffered.is_empty() {
                        out.push(StreamChunk::ToolCallDelta {
                            arguments: buffered,
                        });
                    }
                } else if !arguments.is_empty() {
                    out.push(StreamChunk::ToolCallDelta { arguments });
                }
            }
        }

        out.reverse();
        self.pending.extend(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    fn chunk(json: serde_json::Value) -> OpenAiStreamResponseChunk {
        serde_json::from_value(json).expect("valid chunk")
    }

    #[test]
    fn assistant_messages_always_carry_content_or_calls() {
        let plain = serde_json::to_value(to_openai_message(&ChatMessage::assistant(""))).expect("json");
        assert_eq!(plain["content"], "");

        let with_calls = serde_json::to_value(to_openai_message(&ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "c1".to_string(),
                name: "execute_sql".to_string(),
                arguments: "{}".to_string(),
            }],
        )))
        .expect("json");
        assert!(with_calls.get("content").is_none());
        assert_eq!(with_calls["tool_calls"][0]["id"], "c1");
    }

    #[test]
    fn stream_state_announces_call_then_arguments_in_order() {
        let mut state = OpenAiStreamState::default();
        state.absorb(chunk(serde_json::json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0,
                "function": { "name": "execute_sql", "arguments": "{\"query\":" }
            }]}}]
        })));
        state.absorb(chunk(serde_json::json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0,
                "function": { "arguments": "\"SELECT 1\"}" }
            }]}}]
        })));

        let mut emitted = Vec::new();
        while let Some(c) = state.pending.pop() {
            emitted.push(c);
        }
        assert_eq!(emitted.len(), 3);
        assert!(matches!(
            &emitted[0],
            StreamChunk::ToolCallStart { id, name } if id.is_empty() && name == "execute_sql"
        ));
        assert!(matches!(
            &emitted[1],
            StreamChunk::ToolCallDelta { arguments } if arguments == "{\"query\":"
        ));
        assert!(matches!(
            &emitted[2],
            StreamChunk::ToolCallDelta { arguments } if arguments == "\"SELECT 1\"}"
        ));
    }

    #[test]
    fn tool_result_maps_to_tool_role_with_call_id() {
        let msgs = vec![
            ChatMessage::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "execute_sql".to_string(),
                    arguments: "{}".to_string(),
                }],
            ),
            ChatMessage::tool_result("call_1", "Columns: total"),
        ];
        let out: Vec<OpenAiMessage> = msgs.iter().map(to_openai_message).collect();
        assert_eq!(out[0].role, "assistant");
        assert!(out[0].content.is_none());
        assert_eq!(out[0].tool_calls.len(), 1);
        assert_eq!(out[1].role, "tool");
        assert_eq!(out[1].tool_call_id.as_deref(), Some("call_1"));
    }
}
