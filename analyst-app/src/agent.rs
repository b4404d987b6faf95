//! The analyst turn: think, interpret, execute, repeat, then narrate.

use crate::config::{AgentConfig, LoopTextPolicy};
use crate::events::OutputEvent;
use crate::interpreter::{ToolInvocation, ToolName, interpret};
use crate::memory::ConversationMemory;
use crate::prompts::{
    CHART_RECOVERY_INSTRUCTION, NARRATION_PROMPT, RECOVERY_TEXT_PREFIX, VISUALIZATION_HINT,
    response_header, system_prompt,
};
use analyst_llm::{ChatMessage, ChatModel, ModelResolver, StreamChunk, ToolCall, ToolDefinition, Usage};
use analyst_tools::{ChartCollector, Tool, ToolContext, to_llm_tool_def};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub type EventStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

const CANCELLED_RESULT: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub history_limit: usize,
    pub loop_text: LoopTextPolicy,
    pub visualization_keywords: Vec<String>,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            history_limit: cfg.history_limit,
            loop_text: cfg.loop_text,
            visualization_keywords: cfg
                .visualization_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub question: String,
    pub model: String,
    /// The session log from the previous turn; empty for a new session.
    pub history: Vec<ChatMessage>,
}

pub struct AnalystAgent {
    resolver: Arc<dyn ModelResolver>,
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    tool_defs: Vec<ToolDefinition>,
    system_prompt: String,
    settings: AgentSettings,
}

#[derive(Debug, Default)]
struct ModelReply {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoneReason {
    Answered,
    Ceiling,
    Cancelled,
}

enum Phase {
    Thinking,
    Interpreting(ModelReply),
    Executing(Vec<ToolInvocation>),
    Done(DoneReason),
}

struct TurnState {
    memory: ConversationMemory,
    wants_chart: bool,
    iteration: usize,
    recovery_attempted: bool,
    chart_invoked: bool,
    chart_generated: bool,
    last_sql: Option<String>,
    model_calls: usize,
}

impl TurnState {
    /// Recovery is only considered for the first cycle and only once.
    fn recovery_due(&self) -> bool {
        self.wants_chart && self.iteration == 1 && !self.recovery_attempted && !self.chart_invoked
    }
}

/// Forwards events to the caller; a dropped receiver cancels the turn.
struct Emitter {
    tx: UnboundedSender<OutputEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    fn emit(&self, event: OutputEvent) {
        if self.tx.send(event).is_err() && !self.cancel.is_cancelled() {
            tracing::debug!("turn receiver dropped; cancelling");
            self.cancel.cancel();
        }
    }
}

impl AnalystAgent {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        tools: Vec<Arc<dyn Tool>>,
        schema: &str,
        settings: AgentSettings,
    ) -> Self {
        let tool_defs = tools.iter().map(|t| to_llm_tool_def(t.as_ref())).collect();
        let tools = tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.spec().name;
                let key = [ToolName::ExecuteSql, ToolName::GenerateChart]
                    .into_iter()
                    .map(ToolName::as_str)
                    .find(|known| *known == name);
                if key.is_none() {
                    tracing::warn!(tool_name = %name, "ignoring tool the interpreter cannot address");
                }
                key.map(|k| (k, tool))
            })
            .collect();
        Self {
            resolver,
            tools,
            tool_defs,
            system_prompt: system_prompt(schema),
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Runs one turn on a background task. The stream ends after
    /// `MemoryUpdate` or `Error`; dropping it cancels the turn.
    pub fn run_turn(self: &Arc<Self>, request: TurnRequest, cancel: CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let emitter = Emitter {
                tx,
                cancel: cancel.clone(),
            };
            agent.drive(request, &emitter, &cancel).await;
        });
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model))]
    async fn drive(&self, request: TurnRequest, emitter: &Emitter, cancel: &CancellationToken) {
        let started = Instant::now();
        let model = self.resolver.resolve(&request.model);

        let mut memory = ConversationMemory::new(request.history);
        if !matches!(memory.messages().first(), Some(ChatMessage::System { .. })) {
            memory.insert_front(ChatMessage::system(self.system_prompt.clone()));
        }
        let wants_chart = self.wants_chart(&request.question);
        if wants_chart {
            memory.append(ChatMessage::system(VISUALIZATION_HINT));
        }
        memory.append(ChatMessage::user(request.question));

        let mut state = TurnState {
            memory,
            wants_chart,
            iteration: 0,
            recovery_attempted: false,
            chart_invoked: false,
            chart_generated: false,
            last_sql: None,
            model_calls: 0,
        };
        tracing::info!(
            prior_messages = state.memory.len(),
            wants_chart,
            tools_registered = self.tools.len(),
            "analyst turn started"
        );

        let mut phase = Phase::Thinking;
        let reason = loop {
            phase = match phase {
                Phase::Thinking => {
                    if cancel.is_cancelled() {
                        Phase::Done(DoneReason::Cancelled)
                    } else if state.iteration >= self.settings.max_iterations {
                        tracing::warn!(
                            max_iterations = self.settings.max_iterations,
                            "iteration ceiling reached"
                        );
                        Phase::Done(DoneReason::Ceiling)
                    } else {
                        state.iteration += 1;
                        state.model_calls += 1;
                        let forward = self.settings.loop_text == LoopTextPolicy::Stream;
                        match self
                            .think(model.as_ref(), state.memory.messages(), &self.tool_defs, forward, emitter, cancel)
                            .await
                        {
                            Ok(reply) if cancel.is_cancelled() => {
                                tracing::info!(iteration = state.iteration, "turn cancelled during model call");
                                if !reply.text.trim().is_empty() {
                                    state.memory.append(ChatMessage::assistant(reply.text));
                                }
                                Phase::Done(DoneReason::Cancelled)
                            }
                            Ok(reply) => Phase::Interpreting(reply),
                            Err(e) => {
                                tracing::error!(iteration = state.iteration, error = %e, "model call failed");
                                emitter.emit(OutputEvent::Error {
                                    message: e.to_string(),
                                });
                                return;
                            }
                        }
                    }
                }
                Phase::Interpreting(reply) => self.interpret_reply(reply, &mut state),
                Phase::Executing(invocations) => {
                    self.execute(invocations, &mut state, emitter, cancel).await
                }
                Phase::Done(reason) => break reason,
            };
        };

        let reason = if cancel.is_cancelled() {
            DoneReason::Cancelled
        } else {
            reason
        };
        if reason != DoneReason::Cancelled {
            emitter.emit(OutputEvent::TextDelta {
                text: response_header(state.last_sql.as_deref(), state.chart_generated),
            });
            state.memory.append(ChatMessage::user(NARRATION_PROMPT));
            state.model_calls += 1;
            let narration = match self
                .think(model.as_ref(), state.memory.messages(), &[], true, emitter, cancel)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(error = %e, "narration call failed");
                    emitter.emit(OutputEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            };
            if narration.text.trim().is_empty() {
                tracing::warn!("model returned an empty narration");
            } else {
                state.memory.append(ChatMessage::assistant(narration.text));
            }
        }

        state.memory.truncate(self.settings.history_limit);
        tracing::info!(
            reason = ?reason,
            iterations = state.iteration,
            model_calls = state.model_calls,
            recovery_attempted = state.recovery_attempted,
            chart_generated = state.chart_generated,
            retained_messages = state.memory.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "analyst turn finished"
        );
        emitter.emit(OutputEvent::MemoryUpdate {
            messages: state.memory.snapshot(),
        });
    }

    fn wants_chart(&self, question: &str) -> bool {
        let question = question.to_lowercase();
        self.settings
            .visualization_keywords
            .iter()
            .any(|k| question.contains(k.as_str()))
    }

    fn interpret_reply(&self, reply: ModelReply, state: &mut TurnState) -> Phase {
        let invocations = interpret(&reply.text, &reply.tool_calls, state.memory.messages());
        tracing::debug!(
            iteration = state.iteration,
            structured_calls = reply.tool_calls.len(),
            invocations = invocations.len(),
            text_chars = reply.text.len(),
            "model reply interpreted"
        );

        if invocations.is_empty() {
            if state.recovery_due() {
                tracing::info!("no chart requested by model; injecting recovery instruction");
                state.recovery_attempted = true;
                let text = format!("{RECOVERY_TEXT_PREFIX} {}", reply.text.trim());
                state.memory.append(ChatMessage::assistant(text.trim_end()));
                state.memory.append(ChatMessage::system(CHART_RECOVERY_INSTRUCTION));
                return Phase::Thinking;
            }
            if !reply.text.trim().is_empty() {
                state.memory.append(ChatMessage::assistant(reply.text));
            }
            return Phase::Done(DoneReason::Answered);
        }

        let calls = invocations.iter().map(ToolInvocation::to_tool_call).collect();
        state
            .memory
            .append(ChatMessage::assistant_with_calls(reply.text, calls));
        Phase::Executing(invocations)
    }

    async fn execute(
        &self,
        invocations: Vec<ToolInvocation>,
        state: &mut TurnState,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Phase {
        let charts = ChartCollector::default();
        let mut pending = invocations.into_iter();
        while let Some(invocation) = pending.next() {
            if cancel.is_cancelled() {
                state
                    .memory
                    .append(ChatMessage::tool_result(invocation.id, CANCELLED_RESULT));
                for rest in pending.by_ref() {
                    state
                        .memory
                        .append(ChatMessage::tool_result(rest.id, CANCELLED_RESULT));
                }
                return Phase::Done(DoneReason::Cancelled);
            }

            emitter.emit(OutputEvent::ToolStarted {
                name: invocation.name.as_str().to_string(),
                input_summary: invocation.input_summary(),
            });
            match invocation.name {
                ToolName::ExecuteSql => {
                    if let Some(query) = invocation.query() {
                        state.last_sql = Some(query.trim().to_string());
                    }
                }
                ToolName::GenerateChart => state.chart_invoked = true,
            }

            let output = self.run_tool(&invocation, state.memory.messages(), &charts).await;
            state
                .memory
                .append(ChatMessage::tool_result(invocation.id, output));

            for handle in charts.take() {
                state.chart_generated = true;
                emitter.emit(OutputEvent::ChartReady { handle });
            }
        }

        if state.recovery_due() {
            tracing::info!("first cycle produced no chart; injecting recovery instruction");
            state.recovery_attempted = true;
            state
                .memory
                .append(ChatMessage::system(CHART_RECOVERY_INSTRUCTION));
        }
        Phase::Thinking
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool_name = invocation.name.as_str(), tool_call_id = %invocation.id))]
    async fn run_tool(
        &self,
        invocation: &ToolInvocation,
        history: &[ChatMessage],
        charts: &ChartCollector,
    ) -> String {
        let Some(tool) = self.tools.get(invocation.name.as_str()) else {
            tracing::warn!("tool not registered");
            return format!(
                "Tool execution error: tool {} is not available",
                invocation.name.as_str()
            );
        };
        let started = Instant::now();
        let ctx = ToolContext { history, charts };
        let arguments = serde_json::Value::Object(invocation.arguments.clone());
        match tool.execute(arguments, &ctx).await {
            Ok(output) => {
                tracing::info!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    output_chars = output.len(),
                    "tool executed"
                );
                output
            }
            Err(e) => {
                tracing::warn!(error = %e, "tool execution failed");
                format!("Tool execution error: {e}")
            }
        }
    }

    /// One streamed model call, accumulated into a reply.
    async fn think(
        &self,
        model: &dyn ChatModel,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        forward: bool,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> analyst_llm::Result<ModelReply> {
        tracing::debug!(
            model = model.identifier(),
            message_count = messages.len(),
            tool_count = tools.len(),
            forward,
            "starting model streaming call"
        );
        let started = Instant::now();
        let mut stream = model.stream(messages, tools).await?;
        let mut reply = ModelReply::default();
        let mut delta_chunks = 0usize;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            match chunk? {
                StreamChunk::Delta { content } => {
                    delta_chunks = delta_chunks.saturating_add(1);
                    reply.text.push_str(&content);
                    if forward {
                        emitter.emit(OutputEvent::TextDelta { text: content });
                    }
                }
                StreamChunk::ToolCallStart { id, name } => {
                    tracing::debug!(tool_call_id = %id, tool_name = %name, "model tool call started");
                    reply.tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                StreamChunk::ToolCallDelta { arguments } => {
                    if let Some(last) = reply.tool_calls.last_mut() {
                        last.arguments.push_str(&arguments);
                    }
                }
                StreamChunk::Done { usage } => reply.usage = usage,
            }
        }

        tracing::info!(
            model = model.identifier(),
            latency_ms = started.elapsed().as_millis() as u64,
            delta_chunks,
            text_chars = reply.text.len(),
            tool_calls = reply.tool_calls.len(),
            prompt_tokens = reply.usage.prompt_tokens,
            completion_tokens = reply.usage.completion_tokens,
            "model streaming call finished"
        );
        Ok(reply)
    }
}
