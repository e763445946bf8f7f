//! Generative-text provider for the assistant.
//!
//! Provides a `GenerativeBackend` trait with a Gemini implementation that
//! streams `streamGenerateContent` responses over server-sent events, plus
//! [`build_request`], the single place where a conversation and its attached
//! documents are turned into a provider request.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DocumentRef, Role, Turn};

/// Incremental text chunks of one response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

// ============================================================================
// GenerativeBackend trait
// ============================================================================

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Start a streamed generation. Errors before the first chunk are
    /// returned directly; later failures arrive as `Err` items.
    async fn stream_generate(&self, request: GenerateRequest) -> Result<ChunkStream, ProviderError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Malformed chunk: {0}")]
    Malformed(String),

    #[error("Response blocked: {0}")]
    Blocked(String),

    #[error("Missing API key")]
    MissingApiKey,
}

// ============================================================================
// Request types (Gemini wire shape)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub system_instruction: Content,
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(Blob),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Build a provider request from the conversation.
///
/// `history` holds every non-system turn, oldest first, ending with the new
/// user turn. When documents are attached, a preamble turn listing their
/// filenames goes first and carries all of their content.
pub fn build_request(
    system_prompt: &str,
    history: &[Turn],
    documents: &[DocumentRef],
) -> GenerateRequest {
    let mut contents = Vec::with_capacity(history.len() + 1);

    if !documents.is_empty() {
        let names = documents
            .iter()
            .map(|d| d.filename.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut parts = vec![Part::Text(format!(
            "The following documents are attached for reference: {}. \
             Use them when answering questions about these reports.",
            names
        ))];
        parts.extend(documents.iter().map(|d| {
            Part::InlineData(Blob {
                mime_type: d.mime_type.clone(),
                data: d.content.clone(),
            })
        }));
        contents.push(Content::new("user", parts));
    }

    for turn in history {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
            Role::System => continue,
        };
        let text = match (&turn.attached_document, turn.text.trim().is_empty()) {
            (_, false) => turn.text.clone(),
            (Some(doc), true) => format!("Please review the attached document {}.", doc.filename),
            (None, true) => continue,
        };
        contents.push(Content::new(role, vec![Part::Text(text)]));
    }

    GenerateRequest {
        system_instruction: Content {
            role: None,
            parts: vec![Part::Text(system_prompt.to_string())],
        },
        contents,
    }
}

// ============================================================================
// Response types (private)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: u16,
    message: String,
}

/// Text carried by one SSE `data:` payload, `None` for keep-alive or empty chunks.
fn parse_chunk(data: &str) -> Result<Option<String>, ProviderError> {
    if data.trim().is_empty() {
        return Ok(None);
    }
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if let Some(err) = chunk.error {
        return Err(ProviderError::Api {
            code: err.code,
            message: err.message,
        });
    }
    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ProviderError::Blocked(reason));
    }

    let text: String = chunk
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();

    Ok(if text.is_empty() { None } else { Some(text) })
}

// ============================================================================
// GeminiClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            base_url,
        }
    }
}

/// Gemini client. Calls `streamGenerateContent` with `alt=sse`.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        // Connect timeout only: a long answer must not be cut off mid-stream.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    async fn stream_generate(&self, request: GenerateRequest) -> Result<ChunkStream, ProviderError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        tracing::debug!(
            model = %self.config.model,
            turns = request.contents.len(),
            "Opening Gemini stream"
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<ErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = error_detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Gemini API error");

            return Err(ProviderError::Api { code, message });
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => parse_chunk(&event.data).transpose(),
                    Err(e) => Some(Err(ProviderError::Stream(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// ============================================================================
// TESTS
// ============================================================================
