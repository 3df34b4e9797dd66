//! Prompt construction for LLM requests.
//!
//! Builds the single instruction string sent to the model: role framing,
//! schema description, recent questions, the new question and the rules
//! the generated statement must follow.

use crate::llm::types::QuestionHistory;
use std::fmt::Write;

/// Prior questions included in a SQL generation prompt.
pub const SQL_HISTORY_LIMIT: usize = 10;

/// Prior questions included in an analysis prompt.
pub const ANALYSIS_HISTORY_LIMIT: usize = 5;

/// Built-in description of the card transactions store.
pub const DEFAULT_SCHEMA_CONTEXT: &str = r#"CREATE TABLE transactions (
    id SERIAL PRIMARY KEY,
    card_no VARCHAR(255) NOT NULL,
    date DATE NOT NULL,
    process_date DATE NOT NULL,
    trx_amount_usd DECIMAL(15, 2),
    trx_amount_eur DECIMAL(15, 2),
    trx_amount_local DECIMAL(15, 2),
    trx_cnt_usd INTEGER DEFAULT 0,
    trx_cnt_eur INTEGER DEFAULT 0,
    trx_cnt_local INTEGER DEFAULT 0,
    interchange_fee DECIMAL(15, 2),
    merch_name VARCHAR(255),
    agg_merch_name VARCHAR(255),
    issuer_code VARCHAR(50),
    issuer_country VARCHAR(100),
    bin6_code VARCHAR(6),
    acquirer_code VARCHAR(50),
    acquirer_country VARCHAR(100),
    trx_type VARCHAR(50),
    trx_direction VARCHAR(10) CHECK (trx_direction IN ('plus', 'minus')),
    mcc VARCHAR(10),
    mcc_group VARCHAR(100),
    input_mode VARCHAR(50),
    wallet_type VARCHAR(50),
    product_type VARCHAR(50),
    authorization_status VARCHAR(50),
    authorization_response_code VARCHAR(10),
    location_id VARCHAR(100),
    location_city VARCHAR(100),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

Common query patterns:
- Date filtering: WHERE date >= '2024-01-01' AND date <= '2024-03-31' (Q1 2024)
- Merchant filtering: WHERE merch_name = 'Merchant Name' OR agg_merch_name = 'Merchant Name'
- Location filtering: WHERE location_city = 'Almaty'
- Aggregations: SUM(trx_amount_usd), SUM(trx_amount_eur), SUM(trx_amount_local), COUNT(*), AVG(trx_amount_usd)
- Top N: ORDER BY column DESC LIMIT N
- Grouping: GROUP BY location_city, merch_name, mcc_group
- Type filtering: WHERE trx_type = 'POS'
- Direction filtering: WHERE trx_direction = 'plus' (outgoing) OR trx_direction = 'minus' (incoming)
- Status filtering: WHERE authorization_status = 'approved' OR authorization_status = 'declined'
- The 'date' column is the transaction date; 'process_date' is the processing date
- Amount columns are trx_amount_usd, trx_amount_eur and trx_amount_local"#;

const SQL_ROLE: &str = "You are a SQL expert assistant. Your task is to convert natural \
language questions into a single read-only PostgreSQL statement.";

const SQL_RULES: &str = r#"RULES:
1. Generate exactly ONE valid PostgreSQL SELECT statement
2. Use only table and column names from the schema
3. Use SINGLE QUOTES (') for string literals, NEVER double quotes (") - double quotes are only for identifiers
4. Example: WHERE location_city = 'Almaty' (correct), NOT WHERE location_city = "Almaty" (wrong)
5. For date ranges use proper date functions (DATE_TRUNC, INTERVAL, explicit date bounds)
6. Use GROUP BY for aggregations and LIMIT for top-N questions
7. Handle NULL values appropriately
8. If the question is ambiguous, choose a reasonable interpretation
9. Return ONLY the SQL statement: no explanations, no prose, no markdown code fences"#;

const ANALYSIS_ROLE: &str = "You are a helpful data analyst assistant. Explain query \
results in a conversational way: answer the question directly, point out patterns, \
trends and notable values, and keep the tone natural.";

/// Ingredients of an analysis prompt.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisRequest<'a> {
    /// The user's question.
    pub question: &'a str,
    /// The statement that was executed.
    pub sql: &'a str,
    /// Serialized result rows (JSON array).
    pub results: &'a str,
    /// Result shape tag (`text` or `table`).
    pub result_format: &'a str,
}

/// Builds the SQL generation prompt.
///
/// At most [`SQL_HISTORY_LIMIT`] of the most recent prior questions are
/// included, one per line, oldest first.
pub fn build_sql_prompt(question: &str, schema: &str, history: &QuestionHistory) -> String {
    let mut prompt = String::with_capacity(schema.len() + 2048);

    prompt.push_str(SQL_ROLE);
    prompt.push_str("\n\nDATABASE SCHEMA:\n");
    prompt.push_str(schema.trim_end());
    prompt.push_str("\n\n");

    write_history(&mut prompt, history.recent(SQL_HISTORY_LIMIT));

    prompt.push_str("USER QUESTION: ");
    prompt.push_str(question.trim());
    prompt.push_str("\n\n");

    prompt.push_str(SQL_RULES);
    prompt.push_str("\n\nSQL statement:");

    prompt
}

/// Builds the analysis prompt for an already computed result set.
///
/// At most [`ANALYSIS_HISTORY_LIMIT`] prior questions are included.
pub fn build_analysis_prompt(
    request: &AnalysisRequest<'_>,
    schema: &str,
    history: &QuestionHistory,
) -> String {
    let mut prompt = String::with_capacity(request.results.len() + schema.len() + 1024);

    prompt.push_str(ANALYSIS_ROLE);
    prompt.push_str("\n\nDATABASE SCHEMA:\n");
    prompt.push_str(schema.trim_end());
    prompt.push_str("\n\n");

    write_history(&mut prompt, history.recent(ANALYSIS_HISTORY_LIMIT));

    // Writing into a String cannot fail.
    let _ = write!(
        prompt,
        "USER QUESTION: {}\n\nSQL EXECUTED: {}\n\nRESULTS (format: {}):\n{}\n\n",
        request.question.trim(),
        request.sql.trim(),
        request.result_format,
        request.results,
    );

    prompt.push_str(
        "Provide a conversational analysis of these results. If the user asked a specific \
question, answer it directly.\n\nAnalysis:",
    );

    prompt
}

fn write_history(prompt: &mut String, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    prompt.push_str("PREVIOUS QUESTIONS IN THIS CONVERSATION:\n");
    for entry in entries {
        prompt.push_str("- ");
        prompt.push_str(entry.trim());
        prompt.push('\n');
    }
    prompt.push('\n');
}
