use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use genbi_context::SchemaIndexer;
use genbi_embed::{Embedder, HashEmbedder, HttpEmbedder};
use genbi_infer::{DeadlineEngine, HttpChatEngine, LlmEngine};
use genbi_policy::SqlValidator;
use genbi_store::ArrowIndexStore;
use genbi_types::{ExecutionOutcome, GenerationResult, GenerationStatus, QueryPlan};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::events::{AskEvent, Progress};
use crate::generator::{GenerateError, GeneratorConfig, SqlGenerator};
use crate::repair::{ExecutorProvider, QueryExecutor, RepairLoop, RepairOutcome, RepairRequest, RepairStatus};
use crate::table::{format_table, DEFAULT_MAX_WIDTH};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Database '{0}' not found")]
    NotFound(String),
    #[error("SQL generation failed: {0}")]
    Generation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct AskRequest {
    pub database_id: String,
    pub question: String,
    #[serde(default)]
    pub max_rows: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AskResponse {
    pub query_id: Uuid,
    pub question: String,
    pub sql: String,
    pub sql_explanation: Option<String>,
    pub plan: Option<String>,
    pub execution: Option<ExecutionOutcome>,
    pub answer: String,
    pub formatted_table: String,
    pub status: RepairStatus,
    pub auto_fixed: bool,
    pub attempts: u32,
    pub max_rows: usize,
    pub num_context_docs: usize,
}

pub type AskStream = Pin<Box<dyn Stream<Item = AskEvent> + Send>>;

/// The orchestrator: wires retrieval, generation, validation and repair together.
///
/// Built once per process and shared by handlers.
pub struct GenbiKernel {
    pub indexer: Arc<SchemaIndexer>,
    pub generator: Arc<SqlGenerator>,
    pub executors: Arc<dyn ExecutorProvider>,
    pub validator: SqlValidator,
    repair: RepairLoop,
    default_max_rows: usize,
}

impl GenbiKernel {
    pub fn new(
        indexer: Arc<SchemaIndexer>,
        llm: Arc<dyn LlmEngine>,
        executors: Arc<dyn ExecutorProvider>,
        settings: &Settings,
    ) -> Self {
        let generator = SqlGenerator::new(Arc::clone(&indexer), llm, GeneratorConfig::from(settings));
        Self {
            indexer,
            generator: Arc::new(generator),
            executors,
            validator: SqlValidator::new(),
            repair: RepairLoop::new(settings.max_fix_attempts),
            default_max_rows: settings.default_max_rows,
        }
    }

    /// Production wiring: HTTP providers, Arrow files under `vector_store_path`.
    pub fn from_settings(settings: &Settings, executors: Arc<dyn ExecutorProvider>) -> Self {
        let embedder: Arc<dyn Embedder> = match &settings.embedding_base_url {
            Some(url) => Arc::new(
                HttpEmbedder::new(
                    url.clone(),
                    settings.embedding_model.clone(),
                    settings.embedding_api_key.clone(),
                )
                .with_batch_size(settings.embedding_batch_size),
            ),
            None => Arc::new(HashEmbedder::new(settings.embed_dim)),
        };
        let store = Arc::new(
            ArrowIndexStore::new(&settings.vector_store_path).with_content_dump(settings.dump_indexed_content),
        );
        let indexer = Arc::new(SchemaIndexer::new(embedder, store));
        let chat = HttpChatEngine::new(
            settings.llm_base_url.clone(),
            settings.llm_model.clone(),
            settings.llm_api_key.clone(),
        );
        let llm = DeadlineEngine::new(Arc::new(chat), Duration::from_secs(settings.llm_timeout_secs));
        Self::new(indexer, Arc::new(llm), executors, settings)
    }

    fn executor(&self, database_id: &str) -> Result<Arc<dyn QueryExecutor>, KernelError> {
        self.executors
            .executor_for(database_id)
            .ok_or_else(|| KernelError::NotFound(database_id.to_string()))
    }

    pub async fn generate(&self, database_id: &str, question: &str, cancel: &CancelToken) -> GenerationResult {
        self.generator.generate(database_id, question, cancel).await
    }

    /// Execute a completed generation, repairing it on failure.
    pub async fn retrieve_and_repair(
        &self,
        database_id: &str,
        question: &str,
        generation: &GenerationResult,
        max_rows: usize,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> Result<RepairOutcome, KernelError> {
        let executor = self.executor(database_id)?;
        let sql = match (&generation.sql, generation.is_completed()) {
            (Some(sql), true) => sql.as_str(),
            _ => {
                return Err(KernelError::Generation(
                    generation.error.clone().unwrap_or_else(|| "no SQL generated".into()),
                ))
            }
        };
        let req = RepairRequest {
            question,
            plan: generation.plan.as_deref().unwrap_or_default(),
            context: generation.context.as_deref().unwrap_or_default(),
            sql,
            max_rows,
        };
        Ok(self
            .repair
            .run(req, executor, self.generator.as_ref(), cancel, progress)
            .await)
    }

    /// Full workflow: generate, execute with repair, summarize, tabulate.
    pub async fn ask(&self, req: &AskRequest, cancel: &CancelToken) -> Result<AskResponse, KernelError> {
        info!(database_id = %req.database_id, "processing ask request");
        self.executor(&req.database_id)?;
        let max_rows = req.max_rows.unwrap_or(self.default_max_rows);

        let generation = self.generate(&req.database_id, &req.question, cancel).await;
        if !generation.is_completed() {
            return Err(KernelError::Generation(generation.error.unwrap_or_default()));
        }

        let outcome = self
            .retrieve_and_repair(
                &req.database_id,
                &req.question,
                &generation,
                max_rows,
                cancel,
                &Progress::silent(),
            )
            .await?;
        let explanation = outcome
            .explanation
            .clone()
            .or_else(|| generation.explanation.clone());
        Ok(self
            .finish(
                req,
                max_rows,
                generation.query_id,
                generation.plan.clone(),
                generation.num_context_docs,
                outcome,
                explanation,
                cancel,
            )
            .await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        req: &AskRequest,
        max_rows: usize,
        query_id: Uuid,
        plan: Option<String>,
        num_context_docs: usize,
        outcome: RepairOutcome,
        explanation: Option<String>,
        cancel: &CancelToken,
    ) -> AskResponse {
        let (answer, formatted_table) = match (&outcome.execution, outcome.succeeded()) {
            (Some(execution), true) => {
                info!(rows = execution.row_count, "query executed");
                let answer = self
                    .generator
                    .analyze_results(&req.question, &outcome.final_sql, &execution.rows, execution.row_count, cancel)
                    .await;
                (answer, format_table(execution, DEFAULT_MAX_WIDTH))
            }
            _ => {
                error!(attempts = outcome.attempts, status = ?outcome.status, "query execution failed");
                (outcome.failure_message(), "No results".to_string())
            }
        };
        AskResponse {
            query_id,
            question: req.question.clone(),
            sql: outcome.final_sql,
            sql_explanation: explanation,
            plan,
            execution: outcome.execution,
            answer,
            formatted_table,
            status: outcome.status,
            auto_fixed: outcome.auto_fixed,
            attempts: outcome.attempts,
            max_rows,
            num_context_docs,
        }
    }

    /// Streaming variant of [`ask`](Self::ask). The stream ends after `complete` or `error`;
    /// dropping it cancels the request.
    pub fn ask_stream(self: &Arc<Self>, req: AskRequest, cancel: CancelToken) -> AskStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let progress = Progress::channel(tx.clone());
            tokio::select! {
                _ = tx.closed() => cancel.cancel(),
                terminal = kernel.run_stream(&req, &cancel, &progress) => {
                    let _ = tx.send(terminal).await;
                }
            }
        });
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    async fn run_stream(&self, req: &AskRequest, cancel: &CancelToken, progress: &Progress) -> AskEvent {
        match self.stream_stages(req, cancel, progress).await {
            Ok(response) => AskEvent::Complete {
                response: Box::new(response),
            },
            Err(message) => {
                error!(database_id = %req.database_id, error = %message, "streaming ask failed");
                AskEvent::Error { message }
            }
        }
    }

    async fn stream_stages(
        &self,
        req: &AskRequest,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> Result<AskResponse, String> {
        self.executor(&req.database_id).map_err(|e| e.to_string())?;
        let max_rows = req.max_rows.unwrap_or(self.default_max_rows);
        let query_id = Uuid::new_v4();

        progress
            .emit(AskEvent::status("retrieval", "Retrieving relevant schema..."))
            .await;
        let ctx = self.generator.retrieve(&req.database_id, &req.question).await;
        if ctx.documents.is_empty() {
            return Err(format!("No schema found for database: {}", req.database_id));
        }

        progress.emit(AskEvent::PlanStart).await;
        let mut fragments = self
            .generator
            .plan_stream(&ctx.formatted, &req.question)
            .await
            .map_err(|e| e.to_string())?;
        let mut plan_text = String::new();
        loop {
            let next = cancel
                .run(fragments.next())
                .await
                .ok_or_else(|| GenerateError::Cancelled.to_string())?;
            let Some(token) = next else { break };
            let token = token.map_err(|e| e.to_string())?;
            plan_text.push_str(&token.text);
            progress.emit(AskEvent::PlanChunk { chunk: token.text }).await;
        }
        let plan = QueryPlan(plan_text.trim().to_string());
        progress
            .emit(AskEvent::PlanComplete {
                plan: plan.0.clone(),
            })
            .await;

        progress
            .emit(AskEvent::status("sql_generation", "Generating SQL query..."))
            .await;
        let sql = self
            .generator
            .synthesize(&ctx.formatted, &req.question, &plan, cancel)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(rejection) = self.generator.rejection(&sql) {
            return Err(rejection);
        }
        progress.emit(AskEvent::SqlGenerated { sql: sql.clone() }).await;

        let generation = GenerationResult {
            sql: Some(sql),
            plan: Some(plan.0),
            context: Some(ctx.formatted),
            num_context_docs: ctx.documents.len(),
            status: GenerationStatus::Completed,
            error: None,
            ..GenerationResult::failed(query_id, "")
        };
        let outcome = self
            .retrieve_and_repair(&req.database_id, &req.question, &generation, max_rows, cancel, progress)
            .await
            .map_err(|e| e.to_string())?;
        if !outcome.succeeded() {
            return Err(outcome.failure_message());
        }

        let explanation = match outcome.explanation.clone() {
            Some(text) => Some(text),
            None => self
                .generator
                .explain(&req.question, &outcome.final_sql, cancel)
                .await
                .ok(),
        };
        if let Some(text) = &explanation {
            progress
                .emit(AskEvent::Explanation {
                    explanation: text.clone(),
                })
                .await;
        }

        progress
            .emit(AskEvent::status("answer", "Analyzing results..."))
            .await;
        let response = self
            .finish(
                req,
                max_rows,
                query_id,
                generation.plan,
                generation.num_context_docs,
                outcome,
                explanation,
                cancel,
            )
            .await;
        progress
            .emit(AskEvent::Answer {
                answer: response.answer.clone(),
            })
            .await;
        Ok(response)
    }
}
