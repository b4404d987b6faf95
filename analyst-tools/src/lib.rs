//! Tools the analyst agent can call: a read-only SQL executor and a chart
//! generator, plus the tabular text format both of them speak.

mod chart;
mod error;
mod sql;
mod tabular;
mod traits;

pub use chart::{ChartCollector, ChartHandle, ChartSink, ChartTool, ChartType, GENERATE_CHART};
pub use error::{Result, ToolError};
pub use sql::{
    CellValue, EXECUTE_SQL, QueryExecutor, QueryTable, SqlTool, SqliteExecutor, TableSummary,
};
pub use tabular::{NO_ROWS_TEXT, parse_tabular, render_table};
pub use traits::{Tool, ToolContext, ToolSpec, to_llm_tool_def};
