//! Line-oriented text form of a query result, as stored in tool-result
//! messages:
//!
//! ```text
//! Columns: month, revenue
//!
//! Rows (2 total):
//! ('2017-01', 120.5)
//! ('2017-02', 98.0)
//! ```

use crate::error::{Result, ToolError};
use crate::sql::{CellValue, QueryTable};

pub const NO_ROWS_TEXT: &str = "Query executed successfully. No rows returned.";

const COLUMNS_HEADER: &str = "Columns:";

pub fn render_table(table: &QueryTable, row_cap: usize) -> String {
    if table.rows.is_empty() {
        return NO_ROWS_TEXT.to_string();
    }

    let mut out = format!(
        "{COLUMNS_HEADER} {}\n\nRows ({} total):\n",
        table.columns.join(", "),
        table.rows.len()
    );
    for row in table.rows.iter().take(row_cap) {
        let cells: Vec<String> = row.iter().map(render_cell).collect();
        out.push('(');
        out.push_str(&cells.join(", "));
        out.push_str(")\n");
    }
    if table.rows.len() > row_cap {
        out.push_str(&format!("... +{} more rows\n", table.rows.len() - row_cap));
    }
    out
}

/// True when `text` starts with the `Columns:` header.
pub(crate) fn has_header(text: &str) -> bool {
    text.trim_start().starts_with(COLUMNS_HEADER)
}

fn render_cell(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => "NULL".to_string(),
        CellValue::Integer(n) => n.to_string(),
        CellValue::Real(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.1}"),
        CellValue::Real(f) => f.to_string(),
        CellValue::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        CellValue::Blob(len) => format!("<blob {len} bytes>"),
    }
}

/// Parses rendered tabular text back into typed rows, positionally.
///
/// Rows may be shorter or longer than the header; callers index defensively.
pub fn parse_tabular(text: &str) -> Result<QueryTable> {
    let lines: Vec<&str> = text.trim().lines().collect();
    let header = lines.first().map(|l| l.trim()).unwrap_or_default();
    let Some(columns) = header.strip_prefix(COLUMNS_HEADER) else {
        return Err(ToolError::InvalidArguments(format!(
            "invalid query results format, first line: {header}"
        )));
    };
    let columns: Vec<String> = columns
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    let data_start = lines
        .iter()
        .position(|l| l.trim_start().starts_with("Rows"))
        .map(|i| i + 1)
        .unwrap_or(2)
        .min(lines.len());

    let rows: Vec<Vec<CellValue>> = lines[data_start..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with("..."))
        .map(parse_row)
        .filter(|r| !r.is_empty())
        .collect();

    if rows.is_empty() {
        return Err(ToolError::InvalidArguments(
            "no data rows found".to_string(),
        ));
    }
    Ok(QueryTable { columns, rows })
}

fn parse_row(line: &str) -> Vec<CellValue> {
    let inner = line
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .unwrap_or(line);

    let mut cells = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.peek().copied() {
            None => break,
            Some(quote @ ('\'' | '"')) => {
                chars.next();
                let mut s = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        c if c == quote => break,
                        c => s.push(c),
                    }
                }
                cells.push(CellValue::Text(s));
                while chars.next_if(|c| *c != ',').is_some() {}
            }
            Some(_) => {
                let mut raw = String::new();
                while let Some(c) = chars.next_if(|c| *c != ',') {
                    raw.push(c);
                }
                let raw = raw.trim();
                if !raw.is_empty() {
                    cells.push(parse_bare(raw));
                }
            }
        }
        chars.next_if_eq(&',');
    }
    cells
}

fn parse_bare(raw: &str) -> CellValue {
    if matches!(raw, "NULL" | "None" | "null") {
        return CellValue::Null;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return CellValue::Integer(n);
    }
    if raw.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(f) = raw.parse::<f64>() {
            return CellValue::Real(f);
        }
    }
    CellValue::Text(raw.to_string())
}
