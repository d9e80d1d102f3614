use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use genbi_context::{format_context, SchemaIndexer};
use genbi_infer::{LlmEngine, LlmError, TokenStream};
use genbi_policy::SqlValidator;
use genbi_types::{
    GenerationResult, GenerationStatus, LlmRequest, QueryPlan, RepairAttempt, Row, SchemaDocument,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::repair::{FixRequest, SqlRepairer};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

const PLAN_PROMPT: &str = "You are an expert database analyst. Analyze the user's question and the available database schema, then create a detailed step-by-step plan for generating the SQL query.

Database Schema Context:
{context}

User Question: {question}

**IMPORTANT**: Provide ONLY high-level analysis and planning. Do NOT write any SQL code in your response.

Please analyze:
1. **Intent Analysis**: What is the user trying to find out? What type of question is this (aggregation, filtering, joining, etc.)?
2. **Required Tables**: Which tables from the schema are needed and why?
3. **Required Columns**: Which specific columns do we need to select or filter?
4. **Relationships & JOINs**: Use the \"DATABASE RELATIONSHIPS\" section. Which foreign keys connect the tables? Describe the join conditions in plain language.
5. **Filtering**: What conditions are needed, described conceptually?
6. **Aggregation**: Is grouping or COUNT/SUM/AVG needed? Over what?
7. **Sorting/Limiting**: Should results be ordered or limited?
8. **Step-by-Step Plan**: Describe how to build the query, step by step, in plain language.
9. **Output Columns**: Which columns answer the question best? Prefer human-readable fields over IDs.

This is a planning phase. Describe what needs to be done but do NOT write SQL syntax.

Analysis and Plan:";

const SQL_PROMPT: &str = "You are an expert SQL query generator. Given a natural language question and database schema context, generate a valid SQL query.

Database Schema Context:
{context}

User Question: {question}

Query Plan:
{plan}

Instructions:
1. Follow the query plan provided above
2. Generate a syntactically correct SQL query that answers the user's question
3. Use only the tables and columns provided in the schema context
4. Be precise with column names and table names (case-sensitive)
5. Use the foreign key relationships in the \"DATABASE RELATIONSHIPS\" section to JOIN tables
6. Add WHERE, GROUP BY and ORDER BY clauses as needed
7. Generate ONLY read-only queries (SELECT, SHOW, DESCRIBE, EXPLAIN). Never INSERT, UPDATE, DELETE, DROP or any other modification.
8. Return ONLY the SQL query without any explanation or markdown formatting

SQL Query:";

const EXPLAIN_PROMPT: &str = "Given this SQL query and the user's question, provide a brief explanation of what the query does.

User Question: {question}
SQL Query: {sql}

Provide a concise explanation in 2-3 sentences of what this query does and what results it will return.

Explanation:";

const ANSWER_PROMPT: &str = "Given a user's question, the SQL query that was executed, and the results, provide a clear and concise natural language answer.

User Question: {question}

SQL Query:
{sql}

Query Results:
{results}

Total Rows: {row_count}

Please provide a natural language answer that:
1. Directly answers the user's question based on the results
2. Highlights key findings or patterns in the data
3. Is concise but informative (2-4 sentences)
4. Uses natural language, not technical jargon

Natural Language Answer:";

const FIX_PROMPT: &str = "You are an expert SQL debugger. A SQL query has failed with an error. Analyze the error and fix the query.

Database Schema Context:
{context}

Original User Question: {question}

Query Plan:
{plan}

Previous Query (FAILED):
{failed_sql}

Error Message:
{error}

Previous Fix Attempts: {attempt}/{max_attempts}{history}

Instructions:
1. Carefully analyze the error message
2. Identify the specific issue (syntax error, wrong column name, missing JOIN, etc.)
3. Check table and column names against the schema context (case-sensitive)
4. Fix ONLY the specific issue; do not change the query logic unnecessarily
5. Watch for missing JOINs, ambiguous column names, missing commas or parentheses, and wrong GROUP BY clauses
6. Return ONLY the fixed SQL query without any explanation or markdown formatting

Fixed SQL Query:";

/// Substitute `{key}` placeholders in one pass; substituted text is never re-expanded.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let hit = after.find('}').and_then(|end| {
            let key = &after[..end];
            vars.iter().find(|(k, _)| *k == key).map(|(_, v)| (*v, end))
        });
        match hit {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Strip markdown fences and whitespace, and end the statement with exactly one `;`.
pub fn clean_sql(raw: &str) -> String {
    let unfenced = raw
        .replace("```sql", "")
        .replace("```SQL", "")
        .replace("```", "");
    let body = unfenced.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if body.is_empty() {
        String::new()
    } else {
        format!("{body};")
    }
}

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub retrieval_k: usize,
    pub max_tokens: usize,
    pub temperature: f32,
    pub sample_rows: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for GeneratorConfig {
    fn from(s: &Settings) -> Self {
        Self {
            retrieval_k: s.retrieval_k,
            max_tokens: s.llm_max_tokens,
            temperature: s.llm_temperature,
            sample_rows: s.summary_sample_rows,
        }
    }
}

/// Retrieved context for one question.
pub struct RetrievedContext {
    pub documents: Vec<SchemaDocument>,
    pub formatted: String,
}

/// Multi-stage text-to-SQL chain: plan, synthesize, validate, explain.
pub struct SqlGenerator {
    indexer: Arc<SchemaIndexer>,
    llm: Arc<dyn LlmEngine>,
    validator: SqlValidator,
    config: GeneratorConfig,
}

impl SqlGenerator {
    pub fn new(indexer: Arc<SchemaIndexer>, llm: Arc<dyn LlmEngine>, config: GeneratorConfig) -> Self {
        Self {
            indexer,
            llm,
            validator: SqlValidator::new(),
            config,
        }
    }

    pub fn indexer(&self) -> &Arc<SchemaIndexer> {
        &self.indexer
    }

    fn request(&self, prompt: String) -> LlmRequest {
        LlmRequest {
            prompt,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn call(&self, prompt: String, cancel: &CancelToken) -> Result<String, GenerateError> {
        let req = self.request(prompt);
        match cancel.run(self.llm.complete(req)).await {
            Some(out) => Ok(out?),
            None => Err(GenerateError::Cancelled),
        }
    }

    pub async fn retrieve(&self, database_id: &str, question: &str) -> RetrievedContext {
        let documents = self
            .indexer
            .retrieve(database_id, question, self.config.retrieval_k)
            .await;
        let formatted = format_context(&documents);
        RetrievedContext {
            documents,
            formatted,
        }
    }

    fn plan_prompt(context: &str, question: &str) -> String {
        render(PLAN_PROMPT, &[("context", context), ("question", question)])
    }

    pub async fn plan(&self, context: &str, question: &str, cancel: &CancelToken) -> Result<QueryPlan, GenerateError> {
        let text = self.call(Self::plan_prompt(context, question), cancel).await?;
        Ok(QueryPlan(text.trim().to_string()))
    }

    /// Plan as a stream of fragments. Concatenated and trimmed, it equals [`plan`](Self::plan).
    pub async fn plan_stream(&self, context: &str, question: &str) -> Result<TokenStream, GenerateError> {
        let req = self.request(Self::plan_prompt(context, question));
        Ok(self.llm.generate(req).await?)
    }

    pub async fn synthesize(
        &self,
        context: &str,
        question: &str,
        plan: &QueryPlan,
        cancel: &CancelToken,
    ) -> Result<String, GenerateError> {
        let prompt = render(
            SQL_PROMPT,
            &[("context", context), ("question", question), ("plan", plan.as_str())],
        );
        Ok(clean_sql(&self.call(prompt, cancel).await?))
    }

    pub async fn explain(&self, question: &str, sql: &str, cancel: &CancelToken) -> Result<String, GenerateError> {
        let prompt = render(EXPLAIN_PROMPT, &[("question", question), ("sql", sql)]);
        Ok(self.call(prompt, cancel).await?.trim().to_string())
    }

    /// Rejection message for SQL the policy refuses, `None` when allowed.
    pub fn rejection(&self, sql: &str) -> Option<String> {
        let decision = self.validator.validate(sql);
        (!decision.is_allowed()).then(|| {
            format!(
                "Generated query is not allowed: {}. Only SELECT and discovery queries are permitted.",
                decision.reason()
            )
        })
    }

    /// Retrieve, plan, synthesize, validate and explain.
    pub async fn generate(&self, database_id: &str, question: &str, cancel: &CancelToken) -> GenerationResult {
        let query_id = Uuid::new_v4();
        info!(%query_id, database_id, "generating SQL");

        let ctx = self.retrieve(database_id, question).await;
        if ctx.documents.is_empty() {
            return GenerationResult::failed(query_id, format!("No schema found for database: {database_id}"));
        }

        let mut result = GenerationResult::failed(query_id, "");
        result.num_context_docs = ctx.documents.len();
        result.context = Some(ctx.formatted.clone());

        match self.generate_stages(&ctx.formatted, question, &mut result, cancel).await {
            Ok(()) => {
                result.status = GenerationStatus::Completed;
                result.error = None;
            }
            Err(message) => {
                error!(%query_id, error = %message, "SQL generation failed");
                result.error = Some(message);
            }
        }
        result
    }

    async fn generate_stages(
        &self,
        context: &str,
        question: &str,
        result: &mut GenerationResult,
        cancel: &CancelToken,
    ) -> Result<(), String> {
        let plan = self
            .plan(context, question, cancel)
            .await
            .map_err(|e| e.to_string())?;
        result.plan = Some(plan.0.clone());

        let sql = self
            .synthesize(context, question, &plan, cancel)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(rejection) = self.rejection(&sql) {
            warn!(sql = %sql, "generated SQL rejected");
            return Err(rejection);
        }
        result.sql = Some(sql.clone());

        let explanation = self
            .explain(question, &sql, cancel)
            .await
            .map_err(|e| e.to_string())?;
        result.explanation = Some(explanation);
        Ok(())
    }

    /// Natural-language answer over a sample of the rows. Falls back to a template.
    pub async fn analyze_results(
        &self,
        question: &str,
        sql: &str,
        rows: &[Row],
        row_count: usize,
        cancel: &CancelToken,
    ) -> String {
        let sample = self.config.sample_rows;
        let mut results = rows
            .iter()
            .take(sample)
            .map(|r| serde_json::to_string(r).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        if rows.len() > sample {
            let _ = write!(results, "\n... (showing {sample} of {} rows)", rows.len());
        }

        let row_count_text = row_count.to_string();
        let prompt = render(
            ANSWER_PROMPT,
            &[
                ("question", question),
                ("sql", sql),
                ("results", &results),
                ("row_count", &row_count_text),
            ],
        );
        match self.call(prompt, cancel).await {
            Ok(answer) => answer.trim().to_string(),
            Err(e) => {
                error!(error = %e, "error analyzing results");
                format!("Query returned {row_count} rows. Unable to generate detailed analysis.")
            }
        }
    }
}

fn format_history(history: &[RepairAttempt]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut text = String::from("\n\nPrevious failed attempts:");
    for (i, attempt) in history.iter().enumerate() {
        let _ = write!(
            text,
            "\n\nAttempt {}:\nSQL: {}\nError: {}",
            i + 1,
            attempt.sql,
            attempt.error
        );
    }
    text
}

#[async_trait]
impl SqlRepairer for SqlGenerator {
    async fn fix(&self, req: FixRequest<'_>, cancel: &CancelToken) -> Result<String, GenerateError> {
        info!(attempt = req.attempt, max = req.max_attempts, "attempting to fix SQL");
        let attempt = req.attempt.to_string();
        let max_attempts = req.max_attempts.to_string();
        let history = format_history(req.history);
        let prompt = render(
            FIX_PROMPT,
            &[
                ("context", req.context),
                ("question", req.question),
                ("plan", req.plan),
                ("failed_sql", req.failed_sql),
                ("error", req.error),
                ("attempt", &attempt),
                ("max_attempts", &max_attempts),
                ("history", &history),
            ],
        );

        let fixed = match self.call(prompt, cancel).await {
            Ok(raw) => clean_sql(&raw),
            Err(GenerateError::Cancelled) => return Err(GenerateError::Cancelled),
            Err(e) => {
                error!(error = %e, "error in fix");
                return Ok(req.failed_sql.to_string());
            }
        };
        if let Some(rejection) = self.rejection(&fixed) {
            warn!(reason = %rejection, "fixed SQL failed validation");
            return Ok(req.failed_sql.to_string());
        }
        Ok(fixed)
    }

    async fn explain(&self, question: &str, sql: &str, cancel: &CancelToken) -> Result<String, GenerateError> {
        SqlGenerator::explain(self, question, sql, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genbi_embed::HashEmbedder;
    use genbi_infer::ScriptedLlmEngine;
    use genbi_store::InMemoryIndexStore;
    use serde_json::json;

    fn generator(llm: Arc<ScriptedLlmEngine>) -> SqlGenerator {
        let indexer = Arc::new(SchemaIndexer::new(
            Arc::new(HashEmbedder::new(32)),
            Arc::new(InMemoryIndexStore::new()),
        ));
        SqlGenerator::new(indexer, llm, GeneratorConfig::default())
    }

    fn failed_attempts() -> Vec<RepairAttempt> {
        vec![
            RepairAttempt {
                sql: "SELECT a;".into(),
                error: "Unknown column 'a'".into(),
            },
            RepairAttempt {
                sql: "SELECT nme;".into(),
                error: "Unknown column 'nme'".into(),
            },
        ]
    }

    fn fix_request(history: &[RepairAttempt]) -> FixRequest<'_> {
        FixRequest {
            question: "What are the customer names?",
            failed_sql: "SELECT nme;",
            error: "Unknown column 'nme'",
            context: "Table: customers",
            plan: "List every customer name.",
            attempt: 3,
            max_attempts: 5,
            history,
        }
    }

    fn numbered_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("n".into(), json!(i));
                row
            })
            .collect()
    }

    #[tokio::test]
    async fn fix_prompt_carries_every_prior_attempt() {
        let llm = Arc::new(ScriptedLlmEngine::new(["```sql\nSELECT name FROM customers\n```"]));
        let history = failed_attempts();
        let fixed = generator(llm.clone())
            .fix(fix_request(&history), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(fixed, "SELECT name FROM customers;");

        let prompts = llm.prompts().await;
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        assert!(prompt.contains("Previous Query (FAILED):\nSELECT nme;"));
        assert!(prompt.contains("Previous Fix Attempts: 3/5\n\nPrevious failed attempts:"));
        let first = prompt.find("Attempt 1:\nSQL: SELECT a;\nError: Unknown column 'a'").unwrap();
        let second = prompt.find("Attempt 2:\nSQL: SELECT nme;\nError: Unknown column 'nme'").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn unsafe_repair_keeps_the_failed_query() {
        let llm = Arc::new(ScriptedLlmEngine::new(["DROP TABLE customers"]));
        let fixed = generator(llm)
            .fix(fix_request(&[]), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(fixed, "SELECT nme;");
    }

    #[tokio::test]
    async fn provider_failure_during_fix_keeps_the_failed_query() {
        let llm = Arc::new(ScriptedLlmEngine::with_results([Err(LlmError::Status(
            "503 Service Unavailable".into(),
        ))]));
        let fixed = generator(llm.clone())
            .fix(fix_request(&[]), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(fixed, "SELECT nme;");
        assert_eq!(llm.calls().await, 1);
    }

    #[tokio::test]
    async fn cancelled_fix_is_an_error() {
        let llm = Arc::new(ScriptedLlmEngine::new(["SELECT name FROM customers"]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = generator(llm)
            .fix(fix_request(&[]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Cancelled));
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_template() {
        let llm = Arc::new(ScriptedLlmEngine::with_results([Err(LlmError::Transport(
            "connection refused".into(),
        ))]));
        let answer = generator(llm)
            .analyze_results("how many?", "SELECT n FROM t;", &numbered_rows(25), 25, &CancelToken::new())
            .await;
        assert_eq!(answer, "Query returned 25 rows. Unable to generate detailed analysis.");
    }

    #[tokio::test]
    async fn summary_prompt_samples_the_first_rows() {
        let llm = Arc::new(ScriptedLlmEngine::new(["  There are 25 rows.  "]));
        let answer = generator(llm.clone())
            .analyze_results("how many?", "SELECT n FROM t;", &numbered_rows(25), 25, &CancelToken::new())
            .await;
        assert_eq!(answer, "There are 25 rows.");

        let prompt = &llm.prompts().await[0];
        assert!(prompt.contains(r#"{"n":9}"#));
        assert!(!prompt.contains(r#"{"n":10}"#));
        assert!(prompt.contains("\n... (showing 10 of 25 rows)"));
        assert!(prompt.contains("Total Rows: 25"));
    }

    #[tokio::test]
    async fn short_result_sets_have_no_sample_marker() {
        let llm = Arc::new(ScriptedLlmEngine::new(["Three rows."]));
        generator(llm.clone())
            .analyze_results("how many?", "SELECT n FROM t;", &numbered_rows(3), 3, &CancelToken::new())
            .await;
        assert!(!llm.prompts().await[0].contains("showing"));
    }

    #[test]
    fn clean_sql_strips_fences_and_normalizes_semicolon() {
        assert_eq!(clean_sql("```sql\nSELECT 1\n```"), "SELECT 1;");
        assert_eq!(clean_sql("  SELECT 1;;  \n"), "SELECT 1;");
        assert_eq!(clean_sql("SELECT 1 ; "), "SELECT 1;");
        assert_eq!(clean_sql("```\n```"), "");
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let out = render("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
        assert_eq!(out, "x and y and x");
        let out = render("{a}/{b}/{c}", &[("a", "{b}"), ("b", "y")]);
        assert_eq!(out, "{b}/y/{c}");
    }

    #[test]
    fn history_lists_attempts_in_order() {
        let text = format_history(&[
            RepairAttempt {
                sql: "SELECT a;".into(),
                error: "bad a".into(),
            },
            RepairAttempt {
                sql: "SELECT b;".into(),
                error: "bad b".into(),
            },
        ]);
        assert!(text.starts_with("\n\nPrevious failed attempts:"));
        assert!(text.find("Attempt 1:\nSQL: SELECT a;").unwrap() < text.find("Attempt 2:\nSQL: SELECT b;").unwrap());
        assert_eq!(format_history(&[]), "");
    }
}
