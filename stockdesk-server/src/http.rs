//! Stockdesk HTTP API
//!
//! Axum server exposing the assistant conversation, attached documents,
//! the current company selection, quotes and the report library.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic is testable
//! without the router.
//!
//! Endpoints:
//! - GET    /health
//! - GET    /version
//! - GET    /chat                     conversation snapshot
//! - POST   /chat                     send a message, wait for the full reply
//! - POST   /chat/stop                cancel the streaming reply
//! - GET    /documents
//! - POST   /documents
//! - DELETE /documents/:filename
//! - GET    /selection
//! - GET    /quotes?symbols=A,B
//! - GET    /fundamentals/:symbol
//! - GET    /reports?q=
//! - POST   /reports
//! - POST   /reports/:id/attach

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use stockdesk_core::models::{DocumentRef, NewReport, PDF_MIME_TYPE};
use stockdesk_core::{ChannelSelectionBridge, MarketError, ReportError};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::subsystems::assistant::{Assistant, AssistantError};
use crate::subsystems::library::{Library, LibraryError};
use crate::subsystems::quotes::QuoteService;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub assistant: Arc<Assistant>,
    pub quotes: Arc<QuoteService>,
    pub library: Arc<Library>,
    pub selection: Arc<ChannelSelectionBridge>,
    /// Served by `GET /quotes` when no symbols are given.
    pub watchlist: Vec<String>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/chat", get(chat_snapshot_handler).post(chat_send_handler))
        .route("/chat/stop", post(chat_stop_handler))
        .route("/documents", get(documents_list_handler).post(documents_add_handler))
        .route("/documents/:filename", delete(documents_remove_handler))
        .route("/selection", get(selection_handler))
        .route("/quotes", get(quotes_handler))
        .route("/fundamentals/:symbol", get(fundamentals_handler))
        .route("/reports", get(reports_search_handler).post(reports_insert_handler))
        .route("/reports/:id/attach", post(reports_attach_handler))
        .with_state(state)
}

/// Serve until the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    addr: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Stockdesk HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

/// A document as sent by clients. `content` is base64.
#[derive(Debug, Deserialize)]
pub struct DocumentUpload {
    pub filename: String,
    pub content: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: Option<String>,
    pub document: Option<DocumentUpload>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QuotesQuery {
    /// Comma-separated.
    pub symbols: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReportsQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

fn error_body(code: StatusCode, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    let body = serde_json::to_value(ErrorResponse::new(msg))
        .unwrap_or_else(|_| serde_json::json!({ "status": "error" }));
    (code, body)
}

fn ok_body<T: Serialize>(code: StatusCode, value: &T) -> (StatusCode, serde_json::Value) {
    match serde_json::to_value(value) {
        Ok(v) => (code, v),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Validate an uploaded document and turn it into a `DocumentRef`.
pub fn decode_upload(upload: DocumentUpload) -> std::result::Result<DocumentRef, String> {
    let filename = upload.filename.trim();
    if filename.is_empty() {
        return Err("document filename is required".to_string());
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(format!("document filename must not contain a path: {}", filename));
    }
    let content = upload.content.trim();
    if content.is_empty() {
        return Err(format!("document {} is empty", filename));
    }
    if let Err(e) = STANDARD.decode(content) {
        return Err(format!("document {} is not valid base64: {}", filename, e));
    }
    Ok(DocumentRef {
        filename: filename.to_string(),
        content: content.to_string(),
        mime_type: upload.mime_type.unwrap_or_else(|| PDF_MIME_TYPE.to_string()),
    })
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "backend": state.assistant.backend_name(),
            "busy": state.assistant.is_busy(),
            "documents": state.assistant.documents().await.len(),
            "document_bytes": state.assistant.document_bytes().await,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "stockdesk/1",
    })
}

pub async fn chat_snapshot_inner(assistant: &Assistant) -> (StatusCode, serde_json::Value) {
    let snapshot = assistant.snapshot().await;
    (
        StatusCode::OK,
        serde_json::json!({
            "revision": snapshot.revision,
            "turns": snapshot.turns,
            "busy": assistant.is_busy(),
        }),
    )
}

/// The send runs in its own task so a disconnecting client cannot abandon
/// a reply halfway through.
pub async fn chat_send_inner(
    assistant: Arc<Assistant>,
    req: ChatRequest,
) -> (StatusCode, serde_json::Value) {
    let document = match req.document.map(decode_upload).transpose() {
        Ok(d) => d,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    let message = req.message.unwrap_or_default();

    let task = tokio::spawn(async move { assistant.send(&message, document).await });
    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Chat send task failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    match result {
        Ok(outcome) => ok_body(StatusCode::OK, &outcome),
        Err(AssistantError::Busy) => error_body(StatusCode::CONFLICT, AssistantError::Busy.to_string()),
        Err(AssistantError::EmptyMessage) => {
            error_body(StatusCode::BAD_REQUEST, AssistantError::EmptyMessage.to_string())
        }
        Err(AssistantError::ShuttingDown) => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            AssistantError::ShuttingDown.to_string(),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Chat send failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub fn chat_stop_inner(assistant: &Assistant) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, serde_json::json!({ "stopped": assistant.stop() }))
}

pub async fn documents_list_inner(assistant: &Assistant) -> (StatusCode, serde_json::Value) {
    let documents = assistant.documents().await;
    (
        StatusCode::OK,
        serde_json::json!({ "count": documents.len(), "documents": documents }),
    )
}

pub async fn documents_add_inner(
    assistant: &Assistant,
    upload: DocumentUpload,
) -> (StatusCode, serde_json::Value) {
    let doc = match decode_upload(upload) {
        Ok(d) => d,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    let filename = doc.filename.clone();
    let added = assistant.add_document(doc).await;
    let code = if added { StatusCode::CREATED } else { StatusCode::OK };
    (code, serde_json::json!({ "filename": filename, "added": added }))
}

pub async fn documents_remove_inner(
    assistant: &Assistant,
    filename: &str,
) -> (StatusCode, serde_json::Value) {
    if assistant.remove_document(filename).await {
        (StatusCode::OK, serde_json::json!({ "filename": filename, "removed": true }))
    } else {
        error_body(StatusCode::NOT_FOUND, format!("no document named {}", filename))
    }
}

pub fn selection_inner(selection: &ChannelSelectionBridge) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, serde_json::json!({ "selection": selection.current() }))
}

pub async fn quotes_inner(
    quotes: &QuoteService,
    watchlist: &[String],
    query: QuotesQuery,
) -> (StatusCode, serde_json::Value) {
    let requested: Vec<String> = query
        .symbols
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let symbols = if requested.is_empty() { watchlist.to_vec() } else { requested };
    if symbols.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "symbols query parameter is required");
    }

    let report = quotes.refresh(&symbols).await;
    ok_body(StatusCode::OK, &report)
}

pub async fn fundamentals_inner(quotes: &QuoteService, symbol: &str) -> (StatusCode, serde_json::Value) {
    match quotes.fundamentals(symbol).await {
        Ok(f) => ok_body(StatusCode::OK, &f),
        Err(MarketError::NotFound(s)) => error_body(StatusCode::NOT_FOUND, format!("unknown symbol {}", s)),
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

fn library_error(e: LibraryError) -> (StatusCode, serde_json::Value) {
    match e {
        LibraryError::Invalid(msg) => error_body(StatusCode::BAD_REQUEST, msg),
        LibraryError::Store(ReportError::NotFound(id)) => {
            error_body(StatusCode::NOT_FOUND, format!("report {} not found", id))
        }
        LibraryError::Store(e) => {
            tracing::error!(error = %e, "Report library request failed");
            error_body(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

pub async fn reports_search_inner(
    library: &Library,
    query: ReportsQuery,
) -> (StatusCode, serde_json::Value) {
    match library.search(query.q.as_deref()).await {
        Ok(reports) => (
            StatusCode::OK,
            serde_json::json!({ "count": reports.len(), "reports": reports }),
        ),
        Err(e) => library_error(e),
    }
}

pub async fn reports_insert_inner(library: &Library, report: NewReport) -> (StatusCode, serde_json::Value) {
    match library.insert(report).await {
        Ok(stored) => ok_body(StatusCode::CREATED, &stored),
        Err(e) => library_error(e),
    }
}

pub async fn reports_attach_inner(
    library: &Library,
    assistant: &Assistant,
    id: &str,
) -> (StatusCode, serde_json::Value) {
    let id = match Uuid::parse_str(id) {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, format!("invalid report id {}", id)),
    };
    match library.attach(id, assistant).await {
        Ok(outcome) => ok_body(StatusCode::OK, &outcome),
        Err(e) => library_error(e),
    }
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn chat_snapshot_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = chat_snapshot_inner(&state.assistant).await;
    (status, Json(body))
}

pub async fn chat_send_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_send_inner(state.assistant.clone(), req).await;
    (status, Json(body))
}

pub async fn chat_stop_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = chat_stop_inner(&state.assistant);
    (status, Json(body))
}

pub async fn documents_list_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = documents_list_inner(&state.assistant).await;
    (status, Json(body))
}

pub async fn documents_add_handler(
    State(state): State<Arc<HttpState>>,
    Json(upload): Json<DocumentUpload>,
) -> impl IntoResponse {
    let (status, body) = documents_add_inner(&state.assistant, upload).await;
    (status, Json(body))
}

pub async fn documents_remove_handler(
    State(state): State<Arc<HttpState>>,
    Path(filename): Path<String>,
) -> impl IntoResponse {
    let (status, body) = documents_remove_inner(&state.assistant, &filename).await;
    (status, Json(body))
}

pub async fn selection_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = selection_inner(&state.selection);
    (status, Json(body))
}

pub async fn quotes_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<QuotesQuery>,
) -> impl IntoResponse {
    let (status, body) = quotes_inner(&state.quotes, &state.watchlist, query).await;
    (status, Json(body))
}

pub async fn fundamentals_handler(
    State(state): State<Arc<HttpState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let (status, body) = fundamentals_inner(&state.quotes, &symbol).await;
    (status, Json(body))
}

pub async fn reports_search_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<ReportsQuery>,
) -> impl IntoResponse {
    let (status, body) = reports_search_inner(&state.library, query).await;
    (status, Json(body))
}

pub async fn reports_insert_handler(
    State(state): State<Arc<HttpState>>,
    Json(report): Json<NewReport>,
) -> impl IntoResponse {
    let (status, body) = reports_insert_inner(&state.library, report).await;
    (status, Json(body))
}

pub async fn reports_attach_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = reports_attach_inner(&state.library, &state.assistant, &id).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(filename: &str, content: &str) -> DocumentUpload {
        DocumentUpload {
            filename: filename.to_string(),
            content: content.to_string(),
            mime_type: None,
        }
    }

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["api"], "stockdesk/1");
    }

    #[test]
    fn test_decode_upload_defaults_to_pdf() {
        let doc = decode_upload(upload(" q2.pdf ", "JVBERi0xLjQ=")).unwrap();
        assert_eq!(doc.filename, "q2.pdf");
        assert_eq!(doc.mime_type, PDF_MIME_TYPE);
    }

    #[test]
    fn test_decode_upload_rejects_bad_input() {
        assert!(decode_upload(upload("", "JVBERi0xLjQ=")).is_err());
        assert!(decode_upload(upload("../etc/passwd", "JVBERi0xLjQ=")).is_err());
        assert!(decode_upload(upload("a.pdf", "   ")).is_err());
        let err = decode_upload(upload("a.pdf", "not base64!!")).unwrap_err();
        assert!(err.contains("base64"), "got: {}", err);
    }

    #[test]
    fn test_error_body_shape() {
        let (code, body) = error_body(StatusCode::CONFLICT, "busy");
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"], "busy");
        assert_eq!(body["status"], "error");
    }

    #[test]
    fn test_library_error_mapping() {
        let (code, _) = library_error(LibraryError::Invalid("x".to_string()));
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, _) = library_error(LibraryError::Store(ReportError::NotFound("id".to_string())));
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, _) = library_error(LibraryError::Store(ReportError::Api {
            code: 500,
            message: "boom".to_string(),
        }));
        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }
}
