//! Report library: search, upload metadata, and attach a stored report to
//! the assistant conversation.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use stockdesk_core::models::{DocumentRef, NewReport, Report};
use stockdesk_core::{ReportError, ReportStore};
use thiserror::Error;
use uuid::Uuid;

use crate::subsystems::assistant::Assistant;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Report store error: {0}")]
    Store(#[from] ReportError),

    #[error("Invalid report: {0}")]
    Invalid(String),
}

/// What happened when a report was attached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachOutcome {
    pub filename: String,
    pub bytes: usize,
    /// False when a document with this filename was already attached.
    pub added: bool,
}

pub struct Library {
    store: Arc<dyn ReportStore>,
}

/// Filename a report is attached under: its title, made filesystem-safe.
pub fn attachment_filename(report: &Report) -> String {
    let base: String = report
        .title
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') { c } else { '_' })
        .collect();
    let base = if base.is_empty() { report.id.to_string() } else { base };
    if base.to_ascii_lowercase().ends_with(".pdf") {
        base
    } else {
        format!("{}.pdf", base)
    }
}

impl Library {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    pub async fn search(&self, query: Option<&str>) -> Result<Vec<Report>, LibraryError> {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => Ok(self.store.search(q).await?),
            None => Ok(self.store.list().await?),
        }
    }

    pub async fn insert(&self, report: NewReport) -> Result<Report, LibraryError> {
        if report.title.trim().is_empty() {
            return Err(LibraryError::Invalid("title is required".to_string()));
        }
        if !(report.file_url.starts_with("http://") || report.file_url.starts_with("https://")) {
            return Err(LibraryError::Invalid(format!(
                "file_url must be an http(s) URL, got {:?}",
                report.file_url
            )));
        }
        Ok(self.store.insert(report).await?)
    }

    /// Download a stored report and add it to the assistant's documents.
    pub async fn attach(&self, id: Uuid, assistant: &Assistant) -> Result<AttachOutcome, LibraryError> {
        let report = self.store.get(id).await?;
        let bytes = self.store.fetch_file(&report.file_url).await?;
        let filename = attachment_filename(&report);
        let encoded = STANDARD.encode(&bytes);

        let added = assistant
            .add_document(DocumentRef::pdf(filename.clone(), encoded))
            .await;

        tracing::info!(id = %id, filename = %filename, bytes = bytes.len(), added, "Report attached to assistant");

        Ok(AttachOutcome {
            filename,
            bytes: bytes.len(),
            added,
        })
    }
}
