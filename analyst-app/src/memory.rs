//! Session conversation log and its truncation rule.

use analyst_llm::ChatMessage;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationMemory {
    messages: Vec<ChatMessage>,
}

impl ConversationMemory {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn insert_front(&mut self, message: ChatMessage) {
        self.messages.insert(0, message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn truncate(&mut self, limit: usize) {
        self.messages = truncate_log(std::mem::take(&mut self.messages), limit);
    }

    /// Owned copy of the log as it stands.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }
}

/// Keeps the first message plus the most recent `limit - 1`.
///
/// Tool results whose invocation fell out of the window are dropped too, so
/// the result may be shorter than `limit`.
pub fn truncate_log(messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    if limit == 0 {
        return Vec::new();
    }
    if messages.len() <= limit {
        return messages;
    }

    let tail_start = messages.len() - (limit - 1);
    let mut iter = messages.into_iter();
    let mut out = Vec::with_capacity(limit);
    if let Some(first) = iter.next() {
        out.push(first);
    }
    let tail = iter.skip(tail_start - 1);

    let mut announced: HashSet<String> = out[0]
        .tool_calls()
        .iter()
        .map(|c| c.id.clone())
        .collect();
    for message in tail {
        announced.extend(message.tool_calls().iter().map(|c| c.id.clone()));
        if let Some(id) = message.tool_call_id() {
            if !announced.contains(id) {
                continue;
            }
        }
        out.push(message);
    }
    out
}
