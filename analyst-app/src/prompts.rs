use analyst_tools::{EXECUTE_SQL, GENERATE_CHART};

pub const VISUALIZATION_HINT: &str = "The user has asked for a visualization. Please prioritize using the 'generate_chart' tool after you have the data results.";

pub const CHART_RECOVERY_INSTRUCTION: &str = "The user explicitly requested a chart/trend. Please call 'generate_chart' now using the data you just retrieved.";

pub const RECOVERY_TEXT_PREFIX: &str = "Preparing results.";

pub const NARRATION_PROMPT: &str = "Provide 3 key insights as bullet points and a 2-sentence summary of the results. Be brief.";

pub fn system_prompt(schema: &str) -> String {
    format!(
        r#"You are a senior SQL analyst. Answer questions about the database below by running queries and, when asked, charting the results.

DATABASE SCHEMA:
{schema}

SQLITE RULES:
- Use strftime('%Y', column) for years and strftime('%Y-%m', column) for year-month, never YEAR() or MONTH().
- Use || for string concatenation, never CONCAT().
- Use LIMIT n, never TOP n.

ANALYSIS RULES:
1. DATA RETRIEVAL: Always use `{EXECUTE_SQL}` for any data question. Do not explain why, just run the query.
2. VISUALIZATION: If the user asks for a chart, trend, plot or comparison, you MUST call `{GENERATE_CHART}` with the exact text returned by `{EXECUTE_SQL}` as `query_results`.
3. NO RAW DATA: Never output large JSON blocks in your final response.
4. Never invent numbers; base every statement on returned rows.

CORRECT TOOL CALL EXAMPLE:
{{"name": "{EXECUTE_SQL}", "args": {{"query": "SELECT count(*) FROM orders"}}}}
"#
    )
}

/// Block emitted ahead of the streamed narration.
pub fn response_header(sql_query: Option<&str>, chart_generated: bool) -> String {
    let mut out = String::from("\n\n---\n\n");
    if let Some(query) = sql_query {
        out.push_str(&format!("1. **SQL Query**:\n```sql\n{query}\n```\n"));
    }
    if chart_generated {
        out.push_str("2. **Visualization**: Generated a chart below.\n");
    }
    out.push_str("3. **Insights & Summary**:\n");
    out
}
