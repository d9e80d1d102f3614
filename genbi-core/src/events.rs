use serde::Serialize;
use tokio::sync::mpsc;

use crate::kernel::AskResponse;

/// Progress of one streamed ask, in stage order.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AskEvent {
    Status { step: String, message: String },
    PlanStart,
    PlanChunk { chunk: String },
    PlanComplete { plan: String },
    SqlGenerated { sql: String },
    Executing { attempt: u32, max_attempts: u32 },
    Repairing { attempt: u32, max_attempts: u32, error: String },
    SqlFixed { sql: String, attempts: u32 },
    /// Execution finished; `attempts` counts the run that succeeded.
    SqlSuccess {
        row_count: usize,
        execution_time_ms: f64,
        auto_fixed: bool,
        attempts: u32,
    },
    SqlError { sql: String, error: String, attempts: u32 },
    Explanation { explanation: String },
    Answer { answer: String },
    Complete { response: Box<AskResponse> },
    Error { message: String },
}

impl AskEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AskEvent::Status { .. } => "status",
            AskEvent::PlanStart => "plan_start",
            AskEvent::PlanChunk { .. } => "plan_chunk",
            AskEvent::PlanComplete { .. } => "plan_complete",
            AskEvent::SqlGenerated { .. } => "sql_generated",
            AskEvent::Executing { .. } => "executing",
            AskEvent::Repairing { .. } => "repairing",
            AskEvent::SqlFixed { .. } => "sql_fixed",
            AskEvent::SqlSuccess { .. } => "sql_success",
            AskEvent::SqlError { .. } => "sql_error",
            AskEvent::Explanation { .. } => "explanation",
            AskEvent::Answer { .. } => "answer",
            AskEvent::Complete { .. } => "complete",
            AskEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AskEvent::Complete { .. } | AskEvent::Error { .. })
    }

    pub(crate) fn status(step: &str, message: &str) -> Self {
        AskEvent::Status {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Where pipeline stages report progress. Silent unless backed by a channel.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    tx: Option<mpsc::Sender<AskEvent>>,
}

impl Progress {
    pub fn silent() -> Self {
        Self { tx: None }
    }

    pub fn channel(tx: mpsc::Sender<AskEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Deliver `event`; a departed listener is not an error.
    pub async fn emit(&self, event: AskEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
