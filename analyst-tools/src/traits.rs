use crate::chart::ChartSink;
use crate::error::{Result, ToolError};
use analyst_llm::ChatMessage;
use async_trait::async_trait;

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// What a tool may see of the turn that invoked it.
pub struct ToolContext<'a> {
    /// The conversation log up to (not including) this tool's result.
    pub history: &'a [ChatMessage],
    pub charts: &'a dyn ChartSink,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Returns the text stored as the tool-result message.
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext<'_>)
    -> Result<String>;
}

pub fn to_llm_tool_def(tool: &dyn Tool) -> analyst_llm::ToolDefinition {
    let spec = tool.spec();
    analyst_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

/// Like [`require_string`] but tolerates absence, `null` and blank strings.
pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}
