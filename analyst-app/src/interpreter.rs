//! Turns a model reply into tool invocations.
//!
//! Structured tool calls are preferred. Models that write their calls as
//! text are still served by two fallbacks: a fenced ```sql block, then a JSON
//! object naming a tool. The first strategy that yields anything wins.

use analyst_llm::{ChatMessage, ToolCall};
use analyst_tools::{EXECUTE_SQL, GENERATE_CHART};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;
use uuid::Uuid;

static FENCED_SQL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)```sql\s*(.*?)\s*```").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ExecuteSql,
    GenerateChart,
}

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecuteSql => EXECUTE_SQL,
            Self::GenerateChart => GENERATE_CHART,
        }
    }
}

/// Maps the many spellings models use onto a known tool.
pub fn normalize_tool_name(raw: &str) -> Option<ToolName> {
    let mut snake = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.trim().chars() {
        if ch.is_uppercase() && prev_lower {
            snake.push('_');
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        match ch {
            ' ' | '-' | '.' => snake.push('_'),
            c => snake.extend(c.to_lowercase()),
        }
    }

    match snake.as_str() {
        "" => None,
        EXECUTE_SQL => Some(ToolName::ExecuteSql),
        GENERATE_CHART => Some(ToolName::GenerateChart),
        s if s.contains("execute") && s.contains("sql") => Some(ToolName::ExecuteSql),
        s if ["chart", "plot", "graph"].iter().any(|k| s.contains(k)) => {
            Some(ToolName::GenerateChart)
        }
        s if s.contains("sql") => Some(ToolName::ExecuteSql),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: ToolName,
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            id: self.id.clone(),
            name: self.name.as_str().to_string(),
            arguments: Value::Object(self.arguments.clone()).to_string(),
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.arguments.get("query").and_then(Value::as_str)
    }

    /// One line describing the input, for progress display.
    pub fn input_summary(&self) -> String {
        match self.name {
            ToolName::ExecuteSql => self.query().unwrap_or("<missing query>").trim().to_string(),
            ToolName::GenerateChart => {
                let chart_type = self
                    .arguments
                    .get("chart_type")
                    .and_then(Value::as_str)
                    .unwrap_or("bar");
                format!("chart_type={chart_type}")
            }
        }
    }
}

/// A call before id assignment and repair.
#[derive(Debug, Clone, PartialEq)]
struct RawInvocation {
    id: Option<String>,
    name: ToolName,
    arguments: Map<String, Value>,
}

type Strategy = fn(&str, &[ToolCall]) -> Option<Vec<RawInvocation>>;

const STRATEGIES: [(&str, Strategy); 3] = [
    ("structured", from_structured_calls),
    ("fenced_sql", from_fenced_sql),
    ("embedded_json", from_embedded_json),
];

/// Never fails; an empty result means the model asked for nothing.
pub fn interpret(text: &str, calls: &[ToolCall], history: &[ChatMessage]) -> Vec<ToolInvocation> {
    let Some((strategy, raw)) = STRATEGIES
        .iter()
        .find_map(|(label, strategy)| strategy(text, calls).map(|raw| (*label, raw)))
    else {
        return Vec::new();
    };
    tracing::debug!(strategy, invocations = raw.len(), "tool calls interpreted");

    let mut used_ids: HashSet<String> = history
        .iter()
        .flat_map(|m| m.tool_calls().iter().map(|c| c.id.clone()))
        .collect();

    raw.into_iter()
        .map(|call| {
            let id = match call.id {
                Some(id) if !id.trim().is_empty() && !used_ids.contains(&id) => id,
                _ => format!("call_{}", Uuid::new_v4().simple()),
            };
            used_ids.insert(id.clone());
            let arguments = repair_arguments(call.name, call.arguments, history);
            ToolInvocation {
                id,
                name: call.name,
                arguments,
            }
        })
        .collect()
}

fn from_structured_calls(_text: &str, calls: &[ToolCall]) -> Option<Vec<RawInvocation>> {
    let out: Vec<RawInvocation> = calls
        .iter()
        .filter_map(|call| {
            let Some(name) = normalize_tool_name(&call.name) else {
                tracing::warn!(tool_name = %call.name, "dropping call to unknown tool");
                return None;
            };
            if name.as_str() != call.name {
                tracing::info!(from = %call.name, to = name.as_str(), "normalized tool name");
            }
            Some(RawInvocation {
                id: Some(call.id.clone()),
                name,
                arguments: arguments_from_text(&call.arguments),
            })
        })
        .collect();
    (!out.is_empty()).then_some(out)
}

fn from_fenced_sql(text: &str, _calls: &[ToolCall]) -> Option<Vec<RawInvocation>> {
    let re = FENCED_SQL.as_ref()?;
    let query = re
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .find(|q| {
            let upper = q.to_ascii_uppercase();
            upper.contains("SELECT") && upper.contains("FROM")
        })?;
    let mut arguments = Map::new();
    arguments.insert("query".to_string(), Value::String(query.to_string()));
    Some(vec![RawInvocation {
        id: None,
        name: ToolName::ExecuteSql,
        arguments,
    }])
}

fn from_embedded_json(text: &str, _calls: &[ToolCall]) -> Option<Vec<RawInvocation>> {
    let out: Vec<RawInvocation> = extract_json_values(text)
        .into_iter()
        .filter_map(|value| {
            let obj = value.as_object()?;
            let function = obj.get("function");
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .or_else(|| function.and_then(Value::as_str))
                .or_else(|| function.and_then(|f| f.get("name")).and_then(Value::as_str))?;
            let name = normalize_tool_name(name)?;

            let wrapped = ["args", "parameters", "arguments"]
                .iter()
                .find_map(|k| obj.get(*k))
                .or_else(|| function.and_then(|f| f.get("arguments")));
            let arguments = match wrapped {
                Some(inner) => arguments_from_value(inner.clone()),
                None => {
                    let mut rest = obj.clone();
                    rest.remove("name");
                    rest.remove("function");
                    rest
                }
            };
            let id = obj.get("id").and_then(Value::as_str).map(str::to_string);
            Some(RawInvocation {
                id,
                name,
                arguments,
            })
        })
        .collect();
    (!out.is_empty()).then_some(out)
}

/// Every top-level JSON value embedded in `input`, in order.
fn extract_json_values(input: &str) -> Vec<Value> {
    let mut values = Vec::new();
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return values;
    }

    let char_positions: Vec<(usize, char)> = trimmed.char_indices().collect();
    let mut idx = 0;
    while idx < char_positions.len() {
        let (byte_idx, ch) = char_positions[idx];
        if ch == '{' {
            let mut stream =
                serde_json::Deserializer::from_str(&trimmed[byte_idx..]).into_iter::<Value>();
            if let Some(Ok(value)) = stream.next() {
                let next_byte = byte_idx + stream.byte_offset();
                values.push(value);
                while idx < char_positions.len() && char_positions[idx].0 < next_byte {
                    idx += 1;
                }
                continue;
            }
        }
        idx += 1;
    }
    values
}

fn arguments_from_text(raw: &str) -> Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => arguments_from_value(value),
        Err(_) => sql_string_arguments(raw),
    }
}

/// Accepts objects, `parameters`/`args` wrappers, `[{name, value}]` lists and
/// JSON-encoded strings.
fn arguments_from_value(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(mut obj) => {
            for key in ["parameters", "args", "arguments"] {
                let is_wrapper = matches!(obj.get(key), Some(Value::Object(_)))
                    || matches!(obj.get(key), Some(Value::String(s)) if s.trim_start().starts_with('{'));
                if is_wrapper {
                    if let Some(inner) = obj.remove(key) {
                        return arguments_from_value(inner);
                    }
                }
            }
            obj.remove("function");
            obj
        }
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let name = obj.get("name")?.as_str()?.to_string();
                let value = obj
                    .get("value")
                    .or_else(|| obj.get("object"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some((name, value))
            })
            .collect(),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(inner @ (Value::Object(_) | Value::Array(_))) => arguments_from_value(inner),
            _ => sql_string_arguments(&s),
        },
        _ => Map::new(),
    }
}

fn sql_string_arguments(raw: &str) -> Map<String, Value> {
    let mut out = Map::new();
    if raw.to_ascii_uppercase().contains("SELECT") {
        out.insert("query".to_string(), Value::String(raw.trim().to_string()));
    }
    out
}

fn repair_arguments(
    name: ToolName,
    mut arguments: Map<String, Value>,
    history: &[ChatMessage],
) -> Map<String, Value> {
    match name {
        ToolName::ExecuteSql => {
            let has_query = arguments
                .get("query")
                .and_then(Value::as_str)
                .is_some_and(|q| !q.trim().is_empty());
            if !has_query {
                let recovered = arguments
                    .values()
                    .filter_map(Value::as_str)
                    .find(|v| v.to_ascii_uppercase().contains("SELECT"))
                    .map(str::to_string);
                if let Some(query) = recovered {
                    tracing::info!("recovered missing sql query from another argument");
                    arguments.insert("query".to_string(), Value::String(query));
                }
            }
        }
        ToolName::GenerateChart => {
            let has_data = ["query_results", "x_data", "y_data"]
                .iter()
                .any(|k| arguments.get(*k).is_some_and(|v| !v.is_null()));
            if !has_data {
                let recovered = history.iter().rev().find_map(|m| match m {
                    ChatMessage::ToolResult { content, .. } if content.contains("Columns:") => {
                        Some(content.clone())
                    }
                    _ => None,
                });
                if let Some(results) = recovered {
                    tracing::info!("recovered missing chart data from latest query result");
                    arguments.insert("query_results".to_string(), Value::String(results));
                }
            }
            if !arguments.get("chart_type").is_some_and(Value::is_string) {
                arguments.insert("chart_type".to_string(), Value::String("bar".to_string()));
            }
        }
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structured(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "tc_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn name_variants_normalize_to_known_tools() {
        for raw in ["Execute_SQL", "execute-sql", "ExecuteSqlTool", "execute sql", "execute_sql_tool"] {
            assert_eq!(normalize_tool_name(raw), Some(ToolName::ExecuteSql), "{raw}");
        }
        for raw in ["generate_plotly_chart", "draw_chart_tool", "PlotChart", "plotly", "generate_chart"] {
            assert_eq!(normalize_tool_name(raw), Some(ToolName::GenerateChart), "{raw}");
        }
        assert_eq!(normalize_tool_name("web_search"), None);
        assert_eq!(normalize_tool_name(""), None);
    }

    #[test]
    fn structured_calls_keep_ids_and_flatten_wrappers() {
        let calls = vec![structured(
            "ExecuteSqlTool",
            r#"{"parameters": {"query": "SELECT COUNT(*) FROM customers"}}"#,
        )];
        let out = interpret("", &calls, &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "tc_1");
        assert_eq!(out[0].name, ToolName::ExecuteSql);
        assert_eq!(out[0].query(), Some("SELECT COUNT(*) FROM customers"));
    }

    #[test]
    fn raw_sql_arguments_become_a_query() {
        let calls = vec![structured("execute_sql", "SELECT * FROM orders LIMIT 5")];
        let out = interpret("", &calls, &[]);
        assert_eq!(out[0].query(), Some("SELECT * FROM orders LIMIT 5"));

        let calls = vec![structured("execute_sql", r#"{"sql": "select 1 from orders"}"#)];
        let out = interpret("", &calls, &[]);
        assert_eq!(out[0].query(), Some("select 1 from orders"));
    }

    #[test]
    fn name_value_lists_are_accepted() {
        let calls = vec![structured(
            "generate_chart",
            r#"[{"name": "chart_type", "value": "pie"}, {"name": "title", "object": "Share"}]"#,
        )];
        let out = interpret("", &calls, &[]);
        assert_eq!(out[0].arguments["chart_type"], "pie");
        assert_eq!(out[0].arguments["title"], "Share");
    }

    #[test]
    fn fenced_sql_block_is_the_first_fallback() {
        let text = "Let me check.\n```sql\nSELECT COUNT(*) AS total FROM customers\n```\n{\"name\": \"generate_chart\"}";
        let out = interpret(text, &[], &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, ToolName::ExecuteSql);
        assert_eq!(out[0].query(), Some("SELECT COUNT(*) AS total FROM customers"));
        assert!(out[0].id.starts_with("call_"));
    }

    #[test]
    fn fenced_block_without_from_is_ignored() {
        let out = interpret("```sql\nSELECT 1\n```", &[], &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn embedded_json_calls_are_recognized() {
        let text = r#"I will run {"name": "execute_sql", "args": {"query": "SELECT count(*) FROM orders"}} now"#;
        let out = interpret(text, &[], &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].query(), Some("SELECT count(*) FROM orders"));

        let text = r#"{"function": "plot", "parameters": {"chart_type": "line"}}"#;
        let out = interpret(text, &[], &[]);
        assert_eq!(out[0].name, ToolName::GenerateChart);
        assert_eq!(out[0].arguments["chart_type"], "line");
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(interpret("There are 99441 customers.", &[], &[]).is_empty());
        assert!(interpret("{\"answer\": 42}", &[], &[]).is_empty());
    }

    #[test]
    fn chart_data_is_recovered_from_latest_tabular_result() {
        let history = vec![
            ChatMessage::tool_result("a", "Columns: m, r\n\nRows (1 total):\n('2017-01', 1)\n"),
            ChatMessage::tool_result("b", "SQL Error: no such column"),
        ];
        let calls = vec![structured("generate_plotly_chart", "{}")];
        let out = interpret("", &calls, &history);
        assert_eq!(out[0].arguments["chart_type"], "bar");
        assert!(
            out[0].arguments["query_results"]
                .as_str()
                .is_some_and(|s| s.starts_with("Columns: m, r"))
        );
    }

    #[test]
    fn missing_query_is_recovered_from_any_select_string() {
        let calls = vec![structured(
            "execute_sql",
            r#"{"statement": "SELECT state FROM customers", "limit": 3}"#,
        )];
        let out = interpret("", &calls, &[]);
        assert_eq!(out[0].query(), Some("SELECT state FROM customers"));
    }

    #[test]
    fn duplicate_or_missing_ids_are_replaced() {
        let history = vec![ChatMessage::assistant_with_calls(
            "",
            vec![structured("execute_sql", "{}")],
        )];
        let calls = vec![
            structured("execute_sql", r#"{"query": "SELECT 1 FROM t"}"#),
            ToolCall {
                id: String::new(),
                name: "generate_chart".to_string(),
                arguments: "{}".to_string(),
            },
        ];
        let out = interpret("", &calls, &history);
        assert_ne!(out[0].id, "tc_1");
        assert!(out[1].id.starts_with("call_"));
        assert_ne!(out[0].id, out[1].id);
    }

    #[test]
    fn tool_call_round_trip_serializes_arguments() {
        let inv = ToolInvocation {
            id: "x".to_string(),
            name: ToolName::GenerateChart,
            arguments: json!({"chart_type": "bar"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        let call = inv.to_tool_call();
        assert_eq!(call.name, "generate_chart");
        assert_eq!(call.arguments, r#"{"chart_type":"bar"}"#);
        assert_eq!(inv.input_summary(), "chart_type=bar");
    }
}
