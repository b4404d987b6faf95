use analyst_llm::ChatMessage;
use analyst_tools::ChartHandle;
use serde::Serialize;

/// What a turn reports to its caller, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    TextDelta { text: String },
    ToolStarted { name: String, input_summary: String },
    ChartReady { handle: ChartHandle },
    /// The truncated log to carry into the next turn. Always the last event of
    /// a turn that did not fail.
    MemoryUpdate { messages: Vec<ChatMessage> },
    /// Turn-fatal; no `MemoryUpdate` follows.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let v = serde_json::to_value(OutputEvent::ToolStarted {
            name: "execute_sql".to_string(),
            input_summary: "SELECT 1".to_string(),
        })
        .expect("serialize");
        assert_eq!(v["type"], "tool_started");
        assert_eq!(v["input_summary"], "SELECT 1");
    }
}
