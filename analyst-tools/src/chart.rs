use crate::error::Result;
use crate::sql::{CellValue, QueryExecutor, SqlTool};
use crate::tabular::{has_header, parse_tabular};
use crate::traits::{Tool, ToolContext, ToolSpec, optional_string};
use analyst_llm::ChatMessage;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock, Mutex};
use uuid::Uuid;

pub const GENERATE_CHART: &str = "generate_chart";

const PRIMARY: &str = "#2E86AB";
const SECONDARY: &str = "#A23B72";
const SUCCESS: &str = "#06A77D";
const WARNING: &str = "#F18F01";
const DANGER: &str = "#C73E1D";
const INFO: &str = "#6A4C93";
const AREA_FILL: &str = "rgba(46, 134, 171, 0.3)";
const GRID_COLOR: &str = "rgba(200, 200, 200, 0.3)";
const AXIS_LINE_COLOR: &str = "#CCCCCC";
const FONT_FAMILY: &str = "Arial, sans-serif";

static QUERY_FRAGMENT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r#"(?is)query\s*=\s*"(.*?)""#, r#"(?is)query\s*=\s*'(.*?)'"#]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Bar,
    Line,
    Scatter,
    Pie,
    Histogram,
    Box,
    Area,
    Heatmap,
}

impl ChartType {
    /// Case-insensitive; anything unrecognized is a bar chart.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" => Self::Line,
            "scatter" => Self::Scatter,
            "pie" => Self::Pie,
            "histogram" => Self::Histogram,
            "box" => Self::Box,
            "area" => Self::Area,
            "heatmap" => Self::Heatmap,
            _ => Self::Bar,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Scatter => "scatter",
            Self::Pie => "pie",
            Self::Histogram => "histogram",
            Self::Box => "box",
            Self::Area => "area",
            Self::Heatmap => "heatmap",
        }
    }
}

/// A rendered chart, passed to the UI untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartHandle {
    pub id: Uuid,
    pub chart_type: ChartType,
    pub title: String,
    /// Plotly figure JSON (`data` + `layout`).
    pub figure: Value,
}

pub trait ChartSink: Send + Sync {
    fn present(&self, handle: ChartHandle);
}

/// Buffers presented charts until the caller drains them.
#[derive(Debug, Default)]
pub struct ChartCollector {
    charts: Mutex<Vec<ChartHandle>>,
}

impl ChartCollector {
    pub fn take(&self) -> Vec<ChartHandle> {
        let mut charts = self.charts.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *charts)
    }
}

impl ChartSink for ChartCollector {
    fn present(&self, handle: ChartHandle) {
        self.charts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

#[derive(Debug, Default, PartialEq)]
struct ChartData {
    x_column: Option<String>,
    y_column: Option<String>,
    x: Vec<Value>,
    y: Vec<Value>,
    z: Vec<Vec<Value>>,
}

struct Labels {
    title: Option<String>,
    x_label: Option<String>,
    y_label: Option<String>,
}

/// The `generate_chart` tool.
pub struct ChartTool {
    sql: SqlTool,
}

impl ChartTool {
    pub fn new(executor: Arc<dyn QueryExecutor>, row_cap: usize) -> Self {
        Self {
            sql: SqlTool::new(executor, row_cap),
        }
    }

    async fn collect_data(
        &self,
        args: &Value,
        history: &[ChatMessage],
    ) -> std::result::Result<ChartData, String> {
        let x_column = lenient_string(args, "x_column");
        let y_column = lenient_string(args, "y_column");

        let x_data = value_array(args, "x_data")?;
        let y_data = value_array(args, "y_data")?;
        if x_data.is_some() || y_data.is_some() {
            let y = y_data.unwrap_or_default();
            let x = x_data.unwrap_or_else(|| (1..=y.len()).map(|i| json!(i)).collect());
            if x.is_empty() && y.is_empty() {
                return Err("no data rows found".to_string());
            }
            let z = vec![y.iter().filter(|v| v.is_number()).cloned().collect()];
            return Ok(ChartData {
                x_column,
                y_column,
                x,
                y,
                z,
            });
        }

        let text = match lenient_string(args, "query_results") {
            Some(supplied) if looks_like_sql(&supplied) => {
                tracing::warn!("chart received SQL instead of results; executing it first");
                let query = extract_query_fragment(&supplied).unwrap_or(supplied);
                self.sql.run(&query).await
            }
            Some(supplied) => supplied,
            None => latest_tabular_result(history)
                .ok_or_else(|| "no query results available to chart".to_string())?
                .to_string(),
        };

        let table = parse_tabular(&text).map_err(|e| e.to_string())?;

        let x_column = x_column.or_else(|| table.columns.first().cloned());
        let y_column = y_column.or_else(|| table.columns.get(1).cloned());
        let index_of = |name: &Option<String>, fallback: usize| {
            name.as_ref()
                .and_then(|n| table.columns.iter().position(|c| c == n))
                .unwrap_or(fallback)
        };
        let x_idx = index_of(&x_column, 0);
        let y_idx = index_of(&y_column, 1);

        let x = table
            .rows
            .iter()
            .filter_map(|r| r.get(x_idx).map(CellValue::to_json))
            .collect();
        let y = table
            .rows
            .iter()
            .filter_map(|r| r.get(y_idx).map(CellValue::to_json))
            .collect();
        let z = table
            .rows
            .iter()
            .map(|r| {
                r.iter()
                    .filter_map(|c| c.as_f64().map(|_| c.to_json()))
                    .collect()
            })
            .collect();

        Ok(ChartData {
            x_column,
            y_column,
            x,
            y,
            z,
        })
    }
}

#[async_trait]
impl Tool for ChartTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: GENERATE_CHART.to_string(),
            description: "Render a chart from query results. Pass the exact text returned by execute_sql as query_results, or explicit x_data/y_data arrays.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "chart_type": {
                        "type": "string",
                        "enum": ["bar", "line", "scatter", "pie", "histogram", "box", "area", "heatmap"]
                    },
                    "query_results": {
                        "type": "string",
                        "description": "Output of execute_sql, starting with 'Columns:'."
                    },
                    "x_data": { "type": "array", "items": {} },
                    "y_data": { "type": "array", "items": {} },
                    "x_column": { "type": "string" },
                    "y_column": { "type": "string" },
                    "title": { "type": "string" },
                    "x_label": { "type": "string" },
                    "y_label": { "type": "string" }
                },
                "required": ["chart_type"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool_name = GENERATE_CHART))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext<'_>) -> Result<String> {
        let chart_type = lenient_string(&arguments, "chart_type")
            .map(|s| ChartType::parse(&s))
            .unwrap_or_default();

        let data = match self.collect_data(&arguments, ctx.history).await {
            Ok(data) => data,
            Err(message) => {
                tracing::warn!(%message, chart_type = chart_type.as_str(), "chart not generated");
                return Ok(json!({"status": "error", "message": message}).to_string());
            }
        };

        let labels = Labels {
            title: optional_string(&arguments, "title").ok().flatten(),
            x_label: optional_string(&arguments, "x_label").ok().flatten(),
            y_label: optional_string(&arguments, "y_label").ok().flatten(),
        };
        let (title, figure) = build_figure(chart_type, &data, &labels);

        let handle = ChartHandle {
            id: Uuid::new_v4(),
            chart_type,
            title,
            figure,
        };
        let id = handle.id;
        tracing::info!(%id, chart_type = chart_type.as_str(), points = data.x.len(), "chart generated");
        ctx.charts.present(handle);

        Ok(json!({
            "status": "success",
            "chart_type": chart_type.as_str(),
            "handle": id.to_string(),
        })
        .to_string())
    }
}

fn looks_like_sql(text: &str) -> bool {
    let upper = text.trim().to_ascii_uppercase();
    upper.contains("SELECT") && upper.contains("FROM") && !upper.starts_with("COLUMNS:")
}

fn extract_query_fragment(text: &str) -> Option<String> {
    QUERY_FRAGMENT
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
}

fn latest_tabular_result(history: &[ChatMessage]) -> Option<&str> {
    history.iter().rev().find_map(|m| match m {
        ChatMessage::ToolResult { content, .. } if has_header(content) => Some(content.as_str()),
        _ => None,
    })
}

/// Strings only; other JSON types count as absent.
fn lenient_string(args: &Value, key: &str) -> Option<String> {
    optional_string(args, key).ok().flatten()
}

fn value_array(args: &Value, key: &str) -> std::result::Result<Option<Vec<Value>>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s)
            .map(Some)
            .map_err(|e| format!("{key} must be a JSON array: {e}")),
        Some(other) => Err(format!("{key} must be an array, got {other}")),
    }
}

fn build_figure(chart_type: ChartType, data: &ChartData, labels: &Labels) -> (String, Value) {
    let histogram_x = if data.x.is_empty() { &data.y } else { &data.x };
    let trace = match chart_type {
        ChartType::Bar => json!({
            "type": "bar",
            "x": data.x,
            "y": data.y,
            "marker": {"color": PRIMARY},
            "text": data.y,
            "textposition": "auto",
        }),
        ChartType::Line => json!({
            "type": "scatter",
            "mode": "lines+markers",
            "x": data.x,
            "y": data.y,
            "line": {"color": PRIMARY, "width": 2},
            "marker": {"size": 8},
        }),
        ChartType::Scatter => json!({
            "type": "scatter",
            "mode": "markers",
            "x": data.x,
            "y": data.y,
            "marker": {"size": 10, "color": INFO, "opacity": 0.7},
        }),
        ChartType::Pie => json!({
            "type": "pie",
            "labels": data.x,
            "values": data.y,
            "marker": {"colors": [PRIMARY, SECONDARY, SUCCESS, WARNING, DANGER, INFO]},
            "textinfo": "label+percent",
            "hoverinfo": "label+value+percent",
        }),
        ChartType::Histogram => json!({
            "type": "histogram",
            "x": histogram_x,
            "marker": {"color": PRIMARY},
            "nbinsx": 20,
        }),
        ChartType::Box => json!({
            "type": "box",
            "y": data.y,
            "name": data.y_column.as_deref().unwrap_or("Data"),
            "marker": {"color": PRIMARY},
        }),
        ChartType::Area => json!({
            "type": "scatter",
            "mode": "lines",
            "x": data.x,
            "y": data.y,
            "fill": "tozeroy",
            "line": {"color": PRIMARY},
            "fillcolor": AREA_FILL,
        }),
        ChartType::Heatmap => json!({
            "type": "heatmap",
            "z": data.z,
            "colorscale": "Blues",
        }),
    };

    let title = labels.title.clone().unwrap_or_else(|| {
        format!(
            "{} by {}",
            data.y_column.as_deref().unwrap_or("Value"),
            data.x_column.as_deref().unwrap_or("Category")
        )
    });
    let axis = |text: &str| {
        json!({
            "title": {"text": text},
            "showgrid": true,
            "gridwidth": 1,
            "gridcolor": GRID_COLOR,
            "showline": true,
            "linewidth": 1,
            "linecolor": AXIS_LINE_COLOR,
        })
    };
    let x_title = labels
        .x_label
        .as_deref()
        .or(data.x_column.as_deref())
        .unwrap_or("X Axis");
    let y_title = labels
        .y_label
        .as_deref()
        .or(data.y_column.as_deref())
        .unwrap_or("Y Axis");

    let layout = json!({
        "title": {
            "text": title,
            "font": {"size": 18, "family": FONT_FAMILY, "color": "#333333"},
        },
        "xaxis": axis(x_title),
        "yaxis": axis(y_title),
        "font": {"family": FONT_FAMILY, "size": 12, "color": "#555555"},
        "plot_bgcolor": "rgba(240, 240, 240, 0.5)",
        "paper_bgcolor": "white",
        "hovermode": "closest",
        "showlegend": matches!(chart_type, ChartType::Line | ChartType::Scatter),
        "margin": {"l": 60, "r": 40, "t": 80, "b": 60},
    });

    (title, json!({"data": [trace], "layout": layout}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SqliteExecutor;
    use crate::sql::tests::seeded_db;
    use crate::tabular::NO_ROWS_TEXT;

    struct Harness {
        _dir: tempfile::TempDir,
        tool: ChartTool,
        sink: ChartCollector,
    }

    fn harness() -> Harness {
        let dir = seeded_db();
        let exec = Arc::new(SqliteExecutor::new(dir.path().join("shop.sqlite"), 1));
        Harness {
            _dir: dir,
            tool: ChartTool::new(exec, 100),
            sink: ChartCollector::default(),
        }
    }

    async fn run(h: &Harness, args: Value, history: &[ChatMessage]) -> Value {
        let ctx = ToolContext {
            history,
            charts: &h.sink,
        };
        let out = h.tool.execute(args, &ctx).await.expect("chart tool never raises");
        serde_json::from_str(&out).expect("chart output is json")
    }

    #[test]
    fn chart_type_parsing_is_case_insensitive_with_bar_fallback() {
        assert_eq!(ChartType::parse("PIE"), ChartType::Pie);
        assert_eq!(ChartType::parse(" Heatmap "), ChartType::Heatmap);
        assert_eq!(ChartType::parse("bubble"), ChartType::Bar);
    }

    #[tokio::test]
    async fn explicit_arrays_render_and_reach_the_sink() {
        let h = harness();
        let out = run(
            &h,
            json!({
                "chart_type": "Bar",
                "x_data": "[\"2017-01\", \"2017-02\"]",
                "y_data": [120.5, 108.0],
                "x_column": "month",
                "y_column": "revenue",
            }),
            &[],
        )
        .await;
        assert_eq!(out["status"], "success");
        assert_eq!(out["chart_type"], "bar");

        let charts = h.sink.take();
        assert_eq!(charts.len(), 1);
        assert_eq!(out["handle"], charts[0].id.to_string());
        assert_eq!(charts[0].title, "revenue by month");
        let trace = &charts[0].figure["data"][0];
        assert_eq!(trace["type"], "bar");
        assert_eq!(trace["marker"]["color"], PRIMARY);
        assert_eq!(trace["x"], json!(["2017-01", "2017-02"]));
        assert_eq!(charts[0].figure["layout"]["showlegend"], false);
    }

    #[tokio::test]
    async fn identical_arguments_produce_identical_figures() {
        let h = harness();
        let args = json!({
            "chart_type": "line",
            "query_results": "Columns: month, revenue\n\nRows (2 total):\n('2017-01', 120.5)\n('2017-02', 108.0)\n",
        });
        run(&h, args.clone(), &[]).await;
        run(&h, args, &[]).await;
        let charts = h.sink.take();
        assert_eq!(charts.len(), 2);
        assert_eq!(charts[0].figure, charts[1].figure);
        assert_ne!(charts[0].id, charts[1].id);
    }

    #[tokio::test]
    async fn sql_passed_as_results_is_executed_first() {
        let h = harness();
        let out = run(
            &h,
            json!({
                "chart_type": "bar",
                "query_results": "execute_sql(query=\"SELECT month, SUM(revenue) AS revenue FROM orders GROUP BY month ORDER BY month\")",
            }),
            &[],
        )
        .await;
        assert_eq!(out["status"], "success");
        let charts = h.sink.take();
        assert_eq!(charts[0].figure["data"][0]["x"], json!(["2017-01", "2017-02"]));
        assert_eq!(charts[0].figure["data"][0]["y"], json!([120.5, 108.0]));
    }

    #[tokio::test]
    async fn missing_data_falls_back_to_latest_tabular_result() {
        let h = harness();
        let history = vec![
            ChatMessage::tool_result(
                "call_1",
                "Columns: state, total\n\nRows (1 total):\n('XX', 1)\n",
            ),
            ChatMessage::tool_result(
                "call_2",
                "Columns: state, total\n\nRows (2 total):\n('SP', 2)\n('RJ', 1)\n",
            ),
            ChatMessage::tool_result("call_3", "SQL Error: no such table: sellers"),
        ];
        let out = run(&h, json!({"chart_type": "pie"}), &history).await;
        assert_eq!(out["status"], "success");
        let charts = h.sink.take();
        let trace = &charts[0].figure["data"][0];
        assert_eq!(trace["labels"], json!(["SP", "RJ"]));
        assert_eq!(trace["values"], json!([2, 1]));
    }

    #[tokio::test]
    async fn empty_or_malformed_data_returns_error_status() {
        let h = harness();
        let out = run(
            &h,
            json!({"chart_type": "bar", "query_results": NO_ROWS_TEXT}),
            &[],
        )
        .await;
        assert_eq!(out["status"], "error");

        let out = run(&h, json!({"chart_type": "bar", "x_data": "not json"}), &[]).await;
        assert_eq!(out["status"], "error");

        let out = run(&h, json!({"chart_type": "bar"}), &[]).await;
        assert_eq!(out["status"], "error");
        assert_eq!(out["message"], "no query results available to chart");

        let out = run(
            &h,
            json!({"chart_type": "bar", "query_results": "SELECT nope FROM missing_table"}),
            &[],
        )
        .await;
        assert_eq!(out["status"], "error");
        assert!(
            out["message"]
                .as_str()
                .is_some_and(|m| m.contains("SQL Error:")),
            "{out}"
        );

        assert!(h.sink.take().is_empty());
    }
}
