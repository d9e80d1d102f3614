use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column description as reported by schema discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub description: Option<String>,
    /// Raw table comment from the source database.
    #[serde(default)]
    pub table_comment: Option<String>,
    #[serde(default)]
    pub primary_key: Option<Vec<String>>,
}

/// Foreign key edge between two tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default)]
    pub constraint_name: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl DatabaseSchema {
    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.columns.len()).sum()
    }
}

/// Kind of a retrievable document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Table,
    Column,
    Relationships,
    Instruction,
    SqlPair,
    #[serde(other)]
    Other,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Table => "table",
            DocumentKind::Column => "column",
            DocumentKind::Relationships => "relationships",
            DocumentKind::Instruction => "instruction",
            DocumentKind::SqlPair => "sql_pair",
            DocumentKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "table" => DocumentKind::Table,
            "column" => DocumentKind::Column,
            "relationships" => DocumentKind::Relationships,
            "instruction" => DocumentKind::Instruction,
            "sql_pair" => DocumentKind::SqlPair,
            _ => DocumentKind::Other,
        }
    }
}

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// One retrievable unit of the semantic index.
///
/// Documents have no stable key; their identity is their position in the index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub kind: DocumentKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SchemaDocument {
    pub fn new(kind: DocumentKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn table_name(&self) -> Option<&str> {
        self.meta_str("table_name")
    }
}

/// Knowledge-base fact appended to an existing index.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnowledgeFact {
    Instruction {
        id: String,
        title: String,
        content: String,
    },
    SqlPair {
        id: String,
        question: String,
        sql: String,
        #[serde(default)]
        description: Option<String>,
    },
}

/// Natural-language reasoning trace produced before SQL synthesis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan(pub String);

impl QueryPlan {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A failed SQL/error pair fed back into the next repair call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub sql: String,
    pub error: String,
}

pub type Row = serde_json::Map<String, serde_json::Value>;

/// Result of one execution attempt against the target database.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub row_count: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: f64,
}

impl ExecutionOutcome {
    pub fn success(columns: Vec<String>, rows: Vec<Row>, latency_ms: f64) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            rows,
            columns,
            error: None,
            latency_ms,
        }
    }

    pub fn failure(error: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            error: Some(error.into()),
            latency_ms,
        }
    }

    /// Drop rows beyond `max_rows`, keeping `row_count` in sync.
    pub fn cap_rows(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
        self.row_count = self.rows.len();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Completed,
    Failed,
}

/// Outcome of the retrieve → plan → synthesize → validate → explain chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationResult {
    pub query_id: Uuid,
    pub status: GenerationStatus,
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub num_context_docs: usize,
    /// Formatted schema context, kept for the repair loop.
    #[serde(skip)]
    pub context: Option<String>,
}

impl GenerationResult {
    pub fn failed(query_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            query_id,
            status: GenerationStatus::Failed,
            sql: None,
            explanation: None,
            plan: None,
            error: Some(error.into()),
            num_context_docs: 0,
            context: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == GenerationStatus::Completed
    }
}

/// Single LLM request handed to the inference engine.
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
}
