use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use genbi_core::{AskRequest, AskResponse, CancelToken, GenbiKernel, KernelError};
use genbi_policy::QueryKind;
use genbi_types::{DatabaseSchema, GenerationResult, KnowledgeFact, SchemaDocument};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<GenbiKernel>,
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/index", post(index_schema))
        .route("/v1/index/:database_id", delete(delete_index))
        .route("/v1/knowledge/instructions", post(add_instruction))
        .route("/v1/knowledge/sql-pairs", post(add_sql_pair))
        .route("/v1/retrieve", post(retrieve))
        .route("/v1/generate", post(generate))
        .route("/v1/validate", post(validate))
        .route("/v1/ask", post(ask))
        .route("/v1/ask/stream", post(ask_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct IndexRequest {
    database_id: String,
    schema: DatabaseSchema,
    /// Drop any existing index first.
    #[serde(default)]
    rebuild: bool,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    database_id: String,
    tables: usize,
    documents: usize,
    total_documents: usize,
}

async fn index_schema(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, ApiError> {
    let indexer = &state.kernel.indexer;
    let report = if req.rebuild {
        indexer.reindex(&req.database_id, &req.schema).await
    } else {
        indexer.index(&req.database_id, &req.schema).await
    }
    .map_err(internal)?;
    Ok(Json(IndexResponse {
        database_id: report.database_id,
        tables: report.tables,
        documents: report.documents,
        total_documents: report.total_documents,
    }))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    database_id: String,
    deleted: bool,
}

async fn delete_index(
    State(state): State<AppState>,
    Path(database_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    if !state.kernel.indexer.delete(&database_id).await {
        return Err(internal(format!("failed to delete index for '{database_id}'")));
    }
    Ok(Json(DeleteResponse {
        database_id,
        deleted: true,
    }))
}

#[derive(Debug, Deserialize)]
struct InstructionRequest {
    database_id: String,
    #[serde(default)]
    id: Option<String>,
    title: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SqlPairRequest {
    database_id: String,
    #[serde(default)]
    id: Option<String>,
    question: String,
    sql: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct KnowledgeResponse {
    id: String,
    database_id: String,
    indexed: bool,
    created_at: String,
}

async fn add_fact(state: &AppState, database_id: String, id: String, fact: KnowledgeFact) -> Result<Json<KnowledgeResponse>, ApiError> {
    if !state.kernel.indexer.is_indexed(&database_id).await {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Database '{database_id}' has no index"),
        ));
    }
    let indexed = state.kernel.indexer.index_fact(&database_id, &fact).await;
    Ok(Json(KnowledgeResponse {
        id,
        database_id,
        indexed,
        created_at: chrono::Utc::now().to_rfc3339(),
    }))
}

async fn add_instruction(
    State(state): State<AppState>,
    Json(req): Json<InstructionRequest>,
) -> Result<Json<KnowledgeResponse>, ApiError> {
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let fact = KnowledgeFact::Instruction {
        id: id.clone(),
        title: req.title,
        content: req.content,
    };
    add_fact(&state, req.database_id, id, fact).await
}

async fn add_sql_pair(
    State(state): State<AppState>,
    Json(req): Json<SqlPairRequest>,
) -> Result<Json<KnowledgeResponse>, ApiError> {
    let decision = state.kernel.validator.validate(&req.sql);
    if !decision.is_allowed() {
        return Err((StatusCode::BAD_REQUEST, decision.reason().to_string()));
    }
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let fact = KnowledgeFact::SqlPair {
        id: id.clone(),
        question: req.question,
        sql: req.sql,
        description: req.description,
    };
    add_fact(&state, req.database_id, id, fact).await
}

#[derive(Debug, Deserialize)]
struct RetrieveRequest {
    database_id: String,
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RetrieveResponse {
    documents: Vec<SchemaDocument>,
}

async fn retrieve(State(state): State<AppState>, Json(req): Json<RetrieveRequest>) -> Json<RetrieveResponse> {
    let k = req.k.unwrap_or(10);
    let documents = state
        .kernel
        .indexer
        .retrieve(&req.database_id, &req.question, k)
        .await;
    Json(RetrieveResponse { documents })
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    database_id: String,
    question: String,
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerationResult> {
    let result = state
        .kernel
        .generate(&req.database_id, &req.question, &CancelToken::new())
        .await;
    Json(result)
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    sql: String,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    allowed: bool,
    reason: Option<String>,
    kind: QueryKind,
}

async fn validate(State(state): State<AppState>, Json(req): Json<ValidateRequest>) -> Json<ValidateResponse> {
    let validator = &state.kernel.validator;
    let decision = validator.validate(&req.sql);
    Json(ValidateResponse {
        allowed: decision.is_allowed(),
        reason: (!decision.is_allowed()).then(|| decision.reason().to_string()),
        kind: validator.query_kind(&req.sql),
    })
}

async fn ask(State(state): State<AppState>, Json(req): Json<AskRequest>) -> Result<Json<AskResponse>, ApiError> {
    match state.kernel.ask(&req, &CancelToken::new()).await {
        Ok(resp) => Ok(Json(resp)),
        Err(e @ KernelError::NotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            error!(error = %e, "ask failed");
            Err(internal(e))
        }
    }
}

async fn ask_stream(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.kernel.ask_stream(req, CancelToken::new()).map(|ev| {
        let event = Event::default().event(ev.name());
        Ok(event
            .json_data(&ev)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use genbi_context::SchemaIndexer;
    use genbi_core::{Settings, StaticExecutors};
    use genbi_embed::HashEmbedder;
    use genbi_infer::ScriptedLlmEngine;
    use genbi_store::InMemoryIndexStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let indexer = Arc::new(SchemaIndexer::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::new(InMemoryIndexStore::new()),
        ));
        let llm = ScriptedLlmEngine::from_fn(|prompt| {
            Ok(if prompt.starts_with("You are an expert SQL query generator") {
                "SELECT name FROM customers".to_string()
            } else {
                "Plain text.".to_string()
            })
        });
        let kernel = GenbiKernel::new(
            indexer,
            Arc::new(llm),
            Arc::new(StaticExecutors::new()),
            &Settings::default(),
        );
        router(AppState {
            kernel: Arc::new(kernel),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    fn schema() -> Value {
        json!({
            "tables": [
                {"name": "customers", "columns": [{"name": "id", "type": "int"}, {"name": "name", "type": "varchar(100)"}]}
            ]
        })
    }

    #[tokio::test]
    async fn healthz_ok() {
        let (status, body) = call(&app(), "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".into()));
    }

    #[tokio::test]
    async fn index_retrieve_generate_delete() {
        let app = app();
        let (status, body) = call(&app, "POST", "/v1/index", Some(json!({"database_id": "shop", "schema": schema()}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"], 3);

        let (_, body) = call(&app, "POST", "/v1/retrieve", Some(json!({"database_id": "shop", "question": "names", "k": 2}))).await;
        assert_eq!(body["documents"].as_array().unwrap().len(), 2);

        let (_, body) = call(&app, "POST", "/v1/generate", Some(json!({"database_id": "shop", "question": "names"}))).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["sql"], "SELECT name FROM customers;");

        let (status, body) = call(&app, "DELETE", "/v1/index/shop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (_, body) = call(&app, "POST", "/v1/retrieve", Some(json!({"database_id": "shop", "question": "names"}))).await;
        assert!(body["documents"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn knowledge_requires_an_index() {
        let app = app();
        let instruction = json!({"database_id": "shop", "title": "VIP", "content": "VIP means more than 10 orders"});
        let (status, _) = call(&app, "POST", "/v1/knowledge/instructions", Some(instruction.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/v1/index", Some(json!({"database_id": "shop", "schema": schema()}))).await;
        let (status, body) = call(&app, "POST", "/v1/knowledge/instructions", Some(instruction)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["indexed"], true);

        let pair = json!({"database_id": "shop", "question": "wipe", "sql": "DELETE FROM customers"});
        let (status, _) = call(&app, "POST", "/v1/knowledge/sql-pairs", Some(pair)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validate_reports_reason_and_kind() {
        let app = app();
        let (_, body) = call(&app, "POST", "/v1/validate", Some(json!({"sql": "SHOW TABLES"}))).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["kind"], "Show");

        let (_, body) = call(&app, "POST", "/v1/validate", Some(json!({"sql": "DROP TABLE t"}))).await;
        assert_eq!(body["allowed"], false);
        assert!(body["reason"].as_str().unwrap().contains("'DROP'"));
    }

    #[tokio::test]
    async fn ask_without_executor_is_404() {
        let (status, _) = call(&app(), "POST", "/v1/ask", Some(json!({"database_id": "shop", "question": "names"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ask_stream_is_event_stream() {
        let (status, body) = call(&app(), "POST", "/v1/ask/stream", Some(json!({"database_id": "shop", "question": "names"}))).await;
        assert_eq!(status, StatusCode::OK);
        let text = body.as_str().unwrap();
        assert!(text.contains("event: error"));
        assert!(text.contains("Database 'shop' not found"));
    }
}
