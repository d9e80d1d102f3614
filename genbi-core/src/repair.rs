//! Execute, diagnose and repair until a query runs or the attempt budget is spent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use genbi_policy::{SqlValidator, ValidatedSql};
use genbi_types::{ExecutionOutcome, RepairAttempt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::events::{AskEvent, Progress};
use crate::generator::GenerateError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Runs validated SQL against one target database. Called on a blocking worker.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, sql: &ValidatedSql, max_rows: usize) -> ExecutionOutcome;
}

/// Resolves the executor (connection + credentials) for a database id.
pub trait ExecutorProvider: Send + Sync {
    fn executor_for(&self, database_id: &str) -> Option<Arc<dyn QueryExecutor>>;
}

/// Fixed set of executors registered at startup.
#[derive(Default)]
pub struct StaticExecutors {
    executors: HashMap<String, Arc<dyn QueryExecutor>>,
}

impl StaticExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, database_id: impl Into<String>, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executors.insert(database_id.into(), executor);
        self
    }
}

impl ExecutorProvider for StaticExecutors {
    fn executor_for(&self, database_id: &str) -> Option<Arc<dyn QueryExecutor>> {
        self.executors.get(database_id).cloned()
    }
}

/// Everything a repair call gets to see.
#[derive(Clone, Copy, Debug)]
pub struct FixRequest<'a> {
    pub question: &'a str,
    pub failed_sql: &'a str,
    pub error: &'a str,
    pub context: &'a str,
    pub plan: &'a str,
    /// Attempt the repaired query will run as (2-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub history: &'a [RepairAttempt],
}

#[async_trait]
pub trait SqlRepairer: Send + Sync {
    /// Propose a replacement for the failed query. `Err` only on cancellation.
    async fn fix(&self, req: FixRequest<'_>, cancel: &CancelToken) -> Result<String, GenerateError>;

    /// Describe `sql` for the user.
    async fn explain(&self, question: &str, sql: &str, cancel: &CancelToken) -> Result<String, GenerateError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Succeeded,
    Exhausted,
    NoProgress,
    RepairFailed,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct RepairRequest<'a> {
    pub question: &'a str,
    pub plan: &'a str,
    pub context: &'a str,
    pub sql: &'a str,
    pub max_rows: usize,
}

#[derive(Clone, Debug)]
pub struct RepairOutcome {
    pub status: RepairStatus,
    pub final_sql: String,
    /// Last execution, absent when nothing ran.
    pub execution: Option<ExecutionOutcome>,
    pub attempts: u32,
    pub fixes: u32,
    pub auto_fixed: bool,
    /// Explanation of the corrected query, only when it was auto-fixed.
    pub explanation: Option<String>,
    pub history: Vec<RepairAttempt>,
}

impl RepairOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RepairStatus::Succeeded
    }

    pub fn last_error(&self) -> Option<&str> {
        self.execution.as_ref().and_then(|e| e.error.as_deref())
    }

    /// User-facing summary of a failed loop.
    pub fn failure_message(&self) -> String {
        if self.status == RepairStatus::Cancelled {
            return "request cancelled".into();
        }
        let mut msg = format!(
            "Query execution failed after {} attempts.\n\nFinal error: {}",
            self.attempts,
            self.last_error().unwrap_or("Unknown error")
        );
        if self.fixes > 0 {
            msg.push_str(&format!("\n\nAttempted {} fixes, all failed.", self.fixes));
        }
        msg
    }
}

/// Bounded execute → fix cycle.
#[derive(Clone, Copy, Debug)]
pub struct RepairLoop {
    max_attempts: u32,
    validator: SqlValidator,
}

impl Default for RepairLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

struct LoopState {
    current_sql: String,
    attempt: u32,
    fixes: u32,
    history: Vec<RepairAttempt>,
    last: Option<ExecutionOutcome>,
}

impl LoopState {
    fn finish(self, status: RepairStatus) -> RepairOutcome {
        RepairOutcome {
            status,
            final_sql: self.current_sql,
            execution: self.last,
            attempts: self.attempt,
            fixes: self.fixes,
            auto_fixed: false,
            explanation: None,
            history: self.history,
        }
    }
}

impl RepairLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            validator: SqlValidator::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run(
        &self,
        req: RepairRequest<'_>,
        executor: Arc<dyn QueryExecutor>,
        repairer: &dyn SqlRepairer,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> RepairOutcome {
        let max = self.max_attempts;
        let mut st = LoopState {
            current_sql: req.sql.to_string(),
            attempt: 0,
            fixes: 0,
            history: Vec::new(),
            last: None,
        };

        loop {
            if cancel.is_cancelled() {
                info!(attempt = st.attempt, "repair loop cancelled");
                return st.finish(RepairStatus::Cancelled);
            }
            st.attempt += 1;
            let attempt = st.attempt;
            info!(attempt, max, "executing SQL");
            progress
                .emit(AskEvent::Executing {
                    attempt,
                    max_attempts: max,
                })
                .await;

            let outcome = match self.validator.check(&st.current_sql) {
                Ok(sql) => execute_blocking(Arc::clone(&executor), sql, req.max_rows).await,
                Err(e) => ExecutionOutcome::failure(format!("Query validation failed: {e}"), 0.0),
            };

            if outcome.success {
                let auto_fixed = attempt > 1;
                if auto_fixed {
                    progress
                        .emit(AskEvent::SqlFixed {
                            sql: st.current_sql.clone(),
                            attempts: attempt,
                        })
                        .await;
                }
                progress
                    .emit(AskEvent::SqlSuccess {
                        row_count: outcome.row_count,
                        execution_time_ms: outcome.latency_ms,
                        auto_fixed,
                        attempts: attempt,
                    })
                    .await;
                st.last = Some(outcome);
                let explanation = if auto_fixed {
                    info!(attempt, "SQL fixed, regenerating explanation");
                    match repairer.explain(req.question, &st.current_sql, cancel).await {
                        Ok(text) => Some(text),
                        Err(e) => {
                            warn!(error = %e, "could not explain corrected SQL");
                            None
                        }
                    }
                } else {
                    None
                };
                let mut done = st.finish(RepairStatus::Succeeded);
                done.auto_fixed = auto_fixed;
                done.explanation = explanation;
                return done;
            }

            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".into());
            warn!(attempt, error = %error, "attempt failed");
            st.last = Some(outcome);

            if attempt >= max {
                error!(max, "max fix attempts reached");
                emit_sql_error(progress, &st, &error).await;
                return st.finish(RepairStatus::Exhausted);
            }

            st.history.push(RepairAttempt {
                sql: st.current_sql.clone(),
                error: error.clone(),
            });
            progress
                .emit(AskEvent::Repairing {
                    attempt: attempt + 1,
                    max_attempts: max,
                    error: error.clone(),
                })
                .await;
            st.fixes += 1;

            let fix = FixRequest {
                question: req.question,
                failed_sql: &st.current_sql,
                error: &error,
                context: req.context,
                plan: req.plan,
                attempt: attempt + 1,
                max_attempts: max,
                history: &st.history,
            };
            let fixed = match repairer.fix(fix, cancel).await {
                Ok(sql) => sql,
                Err(GenerateError::Cancelled) => return st.finish(RepairStatus::Cancelled),
                Err(e) => {
                    error!(error = %e, "error generating fix");
                    emit_sql_error(progress, &st, &format!("Error generating fix: {e}")).await;
                    return st.finish(RepairStatus::RepairFailed);
                }
            };

            if fixed.trim() == st.current_sql.trim() {
                warn!(attempt, "repair returned the failing query unchanged");
                emit_sql_error(progress, &st, &error).await;
                return st.finish(RepairStatus::NoProgress);
            }
            st.current_sql = fixed;
        }
    }
}

async fn emit_sql_error(progress: &Progress, st: &LoopState, error: &str) {
    progress
        .emit(AskEvent::SqlError {
            sql: st.current_sql.clone(),
            error: error.to_string(),
            attempts: st.attempt,
        })
        .await;
}

async fn execute_blocking(executor: Arc<dyn QueryExecutor>, sql: ValidatedSql, max_rows: usize) -> ExecutionOutcome {
    let started = Instant::now();
    match tokio::task::spawn_blocking(move || executor.execute(&sql, max_rows)).await {
        Ok(mut outcome) => {
            outcome.cap_rows(max_rows);
            outcome
        }
        Err(e) => ExecutionOutcome::failure(
            format!("executor task failed: {e}"),
            started.elapsed().as_secs_f64() * 1000.0,
        ),
    }
}
