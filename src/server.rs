//! JSON HTTP API over a [`KnowledgeBase`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/documents` | List current documents |
//! | `POST`   | `/documents` | Add a text or URL source |
//! | `POST`   | `/documents/batch` | Add many sources; per-item results |
//! | `GET`    | `/documents/{id}` | Current document, or `?version=N` |
//! | `PUT`    | `/documents/{id}` | Replace content (new version) |
//! | `DELETE` | `/documents/{id}` | Delete document and history |
//! | `POST`   | `/documents/{id}/rollback` | Restore a version as a new one |
//! | `GET`    | `/documents/{id}/history` | Version list |
//! | `GET`    | `/documents/{id}/diff?v1=&v2=` | Compare two versions |
//! | `POST`   | `/query` | Hybrid search |
//! | `GET`    | `/stats` | Index statistics |
//! | `POST`   | `/maintenance/backfill` | Retry failed embeddings |
//! | `POST`   | `/maintenance/rebuild` | Rebuild indexes, compact vectors |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation", "message": "k must be <= 100, got 500" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `validation` | 400 |
//! | `not_found` | 404 |
//! | `cancelled` | 409 |
//! | `unsupported_format` | 415 |
//! | `extraction_failed` | 422 |
//! | `persistence` | 500 |
//! | `embedding_unavailable` | 503 |
//!
//! Malformed JSON bodies and query strings get the same envelope with code
//! `validation`.
//!
//! File sources are rejected over HTTP; they would let a client read any
//! file the server process can.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use knowledge_harness_core::models::{
    Document, DocumentSummary, Metadata, ScoredChunk, VersionDiff, VersionInfo,
};
use knowledge_harness_core::KbError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::knowledge_base::{
    BackfillReport, BatchReport, IngestOutcome, KbStats, KnowledgeBase, QueryRequest,
    RebuildReport,
};
use crate::processor::Source;

/// Build the router; exposed separately from [`run_server`] for tests.
pub fn router(kb: Arc<KnowledgeBase>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list).post(handle_add))
        .route("/documents/batch", post(handle_batch))
        .route(
            "/documents/{id}",
            get(handle_get).put(handle_update).delete(handle_delete),
        )
        .route("/documents/{id}/rollback", post(handle_rollback))
        .route("/documents/{id}/history", get(handle_history))
        .route("/documents/{id}/diff", get(handle_diff))
        .route("/query", post(handle_query))
        .route("/stats", get(handle_stats))
        .route("/maintenance/backfill", post(handle_backfill))
        .route("/maintenance/rebuild", post(handle_rebuild))
        .layer(cors)
        .with_state(kb)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(kb: Arc<KnowledgeBase>) -> anyhow::Result<()> {
    let bind_addr = kb.config().server.bind.clone();
    let app = router(kb);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match &err {
            KbError::Validation(_) => StatusCode::BAD_REQUEST,
            KbError::NotFound { .. } => StatusCode::NOT_FOUND,
            KbError::Cancelled(_) => StatusCode::CONFLICT,
            KbError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            KbError::ExtractionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            KbError::EmbeddingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KbError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation".to_string(),
        message: message.into(),
    }
}

fn reject_file_source(source: &Source) -> Result<(), AppError> {
    match source {
        Source::File { .. } => Err(bad_request(
            "file sources are not accepted over HTTP; use a text or url source",
        )),
        _ => Ok(()),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /documents ============

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list(State(kb): State<Arc<KnowledgeBase>>) -> Json<ListResponse> {
    Json(ListResponse {
        documents: kb.list_documents(),
    })
}

/// `POST /documents` body: a tagged source plus optional metadata.
///
/// ```json
/// { "type": "text", "name": "notes", "content": "...", "metadata": { "team": "infra" } }
/// ```
#[derive(Deserialize)]
struct AddRequest {
    #[serde(flatten)]
    source: Source,
    #[serde(default)]
    metadata: Metadata,
}

async fn handle_add(
    State(kb): State<Arc<KnowledgeBase>>,
    body: Result<Json<AddRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let Json(req) = body?;
    reject_file_source(&req.source)?;
    let outcome = kb.add_source(&req.source, req.metadata).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Deserialize)]
struct BatchRequest {
    sources: Vec<Source>,
    #[serde(default)]
    metadata: Metadata,
}

async fn handle_batch(
    State(kb): State<Arc<KnowledgeBase>>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchReport>, AppError> {
    let Json(req) = body?;
    for source in &req.sources {
        reject_file_source(source)?;
    }
    Ok(Json(kb.ingest_batch(req.sources, req.metadata).await))
}

#[derive(Deserialize)]
struct VersionParam {
    version: Option<u32>,
}

async fn handle_get(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
    query: Result<Query<VersionParam>, QueryRejection>,
) -> Result<Json<Document>, AppError> {
    let Query(params) = query?;
    Ok(Json(kb.get_document(&id, params.version)?))
}

#[derive(Deserialize)]
struct UpdateRequest {
    content: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

async fn handle_update(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Json<Document>, AppError> {
    let Json(req) = body?;
    let doc = kb
        .update_document_with(&id, &req.content, req.metadata, None)
        .await?;
    Ok(Json(doc))
}

async fn handle_delete(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if kb.delete_document(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KbError::document_not_found(id).into())
    }
}

#[derive(Deserialize)]
struct RollbackRequest {
    version: u32,
}

async fn handle_rollback(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
    body: Result<Json<RollbackRequest>, JsonRejection>,
) -> Result<Json<Document>, AppError> {
    let Json(req) = body?;
    Ok(Json(kb.rollback_document(&id, req.version).await?))
}

#[derive(Serialize)]
struct HistoryResponse {
    document_id: String,
    versions: Vec<VersionInfo>,
}

async fn handle_history(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let versions = kb.history(&id)?;
    Ok(Json(HistoryResponse {
        document_id: id,
        versions,
    }))
}

#[derive(Deserialize)]
struct DiffParams {
    v1: u32,
    v2: u32,
}

async fn handle_diff(
    State(kb): State<Arc<KnowledgeBase>>,
    Path(id): Path<String>,
    query: Result<Query<DiffParams>, QueryRejection>,
) -> Result<Json<VersionDiff>, AppError> {
    let Query(params) = query?;
    Ok(Json(kb.compare_versions(&id, params.v1, params.v2)?))
}

// ============ POST /query ============

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<ScoredChunk>,
}

async fn handle_query(
    State(kb): State<Arc<KnowledgeBase>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) = body?;
    let results = kb.query(&req).await?;
    Ok(Json(QueryResponse { results }))
}

// ============ stats & maintenance ============

async fn handle_stats(State(kb): State<Arc<KnowledgeBase>>) -> Json<KbStats> {
    Json(kb.stats())
}

async fn handle_backfill(
    State(kb): State<Arc<KnowledgeBase>>,
) -> Result<Json<BackfillReport>, AppError> {
    Ok(Json(kb.backfill_embeddings().await?))
}

async fn handle_rebuild(
    State(kb): State<Arc<KnowledgeBase>>,
) -> Result<Json<RebuildReport>, AppError> {
    Ok(Json(kb.rebuild_indexes().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::DisabledProvider;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(tmp: &TempDir) -> Router {
        let kb = KnowledgeBase::open(Config::minimal(tmp.path()), Arc::new(DisabledProvider))
            .unwrap();
        router(Arc::new(kb))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let (status, body) = send(&app(&tmp), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_add_get_update_history_delete() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, added) = send(
            &app,
            "POST",
            "/documents",
            Some(json!({
                "type": "text",
                "name": "runbook",
                "content": "restart the ingest workers before the backfill",
                "metadata": { "team": "infra" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = added["document_id"].as_str().unwrap().to_string();
        assert_eq!(added["version"], 1);
        // Disabled provider: everything is keyword-only.
        assert_eq!(added["semantic_chunks"], 0);

        let (status, doc) = send(&app, "GET", &format!("/documents/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["metadata"]["team"], "infra");

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/documents/{id}"),
            Some(json!({ "content": "drain the ingest workers first" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["version"], 2);

        let (_, history) = send(&app, "GET", &format!("/documents/{id}/history"), None).await;
        assert_eq!(history["versions"].as_array().unwrap().len(), 2);

        let (status, diff) = send(&app, "GET", &format!("/documents/{id}/diff?v1=1&v2=2"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(diff["content"]["identical"], false);

        let (status, _) = send(&app, "DELETE", &format!("/documents/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, err) = send(&app, "GET", &format!("/documents/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_keyword_query() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        send(
            &app,
            "POST",
            "/documents",
            Some(json!({ "type": "text", "name": "a", "content": "postgres failover procedure" })),
        )
        .await;

        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(json!({ "text": "failover", "fuzziness": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["source_name"], "a");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(json!({ "text": "x", "fuzziness": 101 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation");

        // Semantic query with embeddings disabled.
        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(json!({ "text": "x", "fuzziness": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "embedding_unavailable");

        let (status, _) = send(
            &app,
            "POST",
            "/documents",
            Some(json!({ "type": "file", "path": "/etc/passwd" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", "/documents/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_reports_each_item() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        let (status, report) = send(
            &app,
            "POST",
            "/documents/batch",
            Some(json!({ "sources": [
                { "type": "text", "name": "ok", "content": "fine" },
                { "type": "text", "name": "blank", "content": "   " }
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["succeeded"], 1);
        assert_eq!(report["failed"], 1);
        assert_eq!(report["items"][1]["error"]["code"], "validation");
    }

    #[tokio::test]
    async fn test_malformed_requests_use_error_envelope() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let request = Request::builder()
            .method("POST")
            .uri("/documents")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "validation");

        let (status, body) =
            send(&app, "POST", "/query", Some(json!({ "text": "x", "k": -1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation");

        let (status, body) = send(&app, "GET", "/documents/abc/diff?v2=2", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation");
        assert!(body["error"]["message"].as_str().unwrap().contains("v1"));

        let (status, body) = send(&app, "GET", "/documents/abc?version=latest", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation");
    }
}
