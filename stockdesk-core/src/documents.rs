//! In-memory store of documents attached to the assistant conversation.
//!
//! Insertion-ordered, keyed by filename. There is no size or count limit:
//! documents stay until the user removes them.

use crate::models::DocumentRef;

#[derive(Debug, Default, Clone)]
pub struct DocumentStore {
    docs: Vec<DocumentRef>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `doc` unless a document with the same filename exists.
    /// Returns `true` if it was added.
    pub fn add(&mut self, doc: DocumentRef) -> bool {
        if self.contains(&doc.filename) {
            tracing::debug!(filename = %doc.filename, "Document already attached, ignoring");
            return false;
        }
        tracing::info!(filename = %doc.filename, bytes = doc.content.len(), "Document attached");
        self.docs.push(doc);
        true
    }

    /// Remove by filename. Returns `true` if something was removed.
    pub fn remove(&mut self, filename: &str) -> bool {
        let before = self.docs.len();
        self.docs.retain(|d| d.filename != filename);
        let removed = self.docs.len() != before;
        if removed {
            tracing::info!(filename = %filename, "Document removed");
        }
        removed
    }

    pub fn list(&self) -> &[DocumentRef] {
        &self.docs
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.docs.iter().map(|d| d.filename.as_str()).collect()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.docs.iter().any(|d| d.filename == filename)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Sum of encoded content lengths.
    pub fn total_bytes(&self) -> usize {
        self.docs.iter().map(|d| d.content.len()).sum()
    }
}
