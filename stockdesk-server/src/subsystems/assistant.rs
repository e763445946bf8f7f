//! Assistant subsystem: drives one streamed reply at a time
//!
//! A send appends the user turn, builds the provider request from the whole
//! conversation plus every attached document, appends a streaming placeholder
//! and fills it from the provider stream. Visible updates are throttled;
//! the final update always lands and clears the streaming flag. Ticker tokens
//! in the finished reply are resolved and handed to the selection bridge.
//!
//! Provider failures never escape `send`: the placeholder becomes the
//! fallback message and the conversation stays usable. A stopped reply keeps
//! its partial text, or `STOPPED_TEXT` when nothing arrived. A send dropped
//! before completion closes its reply the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use stockdesk_core::{
    build_request, config::AssistantConfig, models::DocumentRef, models::Turn, Clock,
    Conversation, ConversationError, ConversationSnapshot, DocumentStore, GenerateRequest,
    GenerativeBackend, ProviderError, Selection, SelectionBridge, TickerFilter, TickerResolver,
    TurnPatch,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::subsystems::throttle::UpdateThrottle;

/// Stored for a reply stopped before any text arrived.
pub const STOPPED_TEXT: &str = "(stopped)";

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("a reply is already streaming")]
    Busy,

    #[error("message is empty")]
    EmptyMessage,

    #[error("assistant is shutting down")]
    ShuttingDown,

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub fallback_message: String,
    pub throttle: Duration,
}

impl From<&AssistantConfig> for AssistantSettings {
    fn from(config: &AssistantConfig) -> Self {
        Self {
            fallback_message: config.fallback_message.clone(),
            throttle: Duration::from_millis(config.stream_throttle_ms),
        }
    }
}

/// Result of one send.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub reply: Turn,
    pub selections: Vec<Selection>,
    /// Number of times the streaming turn was published, final flush included.
    pub visible_updates: usize,
    pub failed: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub filename: String,
    pub mime_type: String,
    pub bytes: usize,
}

struct Session {
    conversation: Conversation,
    documents: DocumentStore,
    tickers: TickerFilter,
}

struct StreamOutput {
    text: String,
    cancelled: bool,
}

/// Releases the single-flight flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Closes the streaming turn if `send` is dropped before it finishes.
struct PendingReply<'a> {
    assistant: &'a Assistant,
    armed: bool,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.assistant.set_current(None);
        if !self.armed {
            return;
        }
        match self.assistant.session.try_lock() {
            Ok(mut session) => {
                tracing::warn!("Send dropped before the reply finished, closing it");
                self.assistant.close_abandoned(&mut session.conversation);
            }
            Err(_) => {
                tracing::warn!("Send dropped before the reply finished, closing it on the next send");
            }
        }
    }
}

pub struct Assistant {
    backend: Arc<dyn GenerativeBackend>,
    bridge: Arc<dyn SelectionBridge>,
    resolver: TickerResolver,
    clock: Arc<dyn Clock>,
    settings: AssistantSettings,
    session: Mutex<Session>,
    in_flight: AtomicBool,
    current: std::sync::Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    updates: watch::Sender<ConversationSnapshot>,
}

impl Assistant {
    pub fn new(
        conversation: Conversation,
        backend: Arc<dyn GenerativeBackend>,
        bridge: Arc<dyn SelectionBridge>,
        resolver: TickerResolver,
        clock: Arc<dyn Clock>,
        settings: AssistantSettings,
    ) -> Self {
        let (updates, _rx) = watch::channel(conversation.snapshot());
        Self {
            backend,
            bridge,
            resolver,
            clock,
            settings,
            session: Mutex::new(Session {
                conversation,
                documents: DocumentStore::new(),
                tickers: TickerFilter::new(),
            }),
            in_flight: AtomicBool::new(false),
            current: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            updates,
        }
    }

    /// Send a user message, optionally attaching a new document, and stream
    /// the reply into the conversation.
    pub async fn send(
        &self,
        text: &str,
        document: Option<DocumentRef>,
    ) -> Result<SendOutcome, AssistantError> {
        if text.trim().is_empty() && document.is_none() {
            return Err(AssistantError::EmptyMessage);
        }
        if self.shutdown.is_cancelled() {
            return Err(AssistantError::ShuttingDown);
        }
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or(AssistantError::Busy)?;

        let token = self.shutdown.child_token();
        self.set_current(Some(token.clone()));
        let mut pending = PendingReply {
            assistant: self,
            armed: false,
        };

        let request = {
            let mut session = self.session.lock().await;
            self.close_abandoned(&mut session.conversation);
            if let Some(doc) = &document {
                session.documents.add(doc.clone());
            }
            session.conversation.append(Turn::user(text, document))?;
            let request = build_request(
                session.conversation.system_prompt(),
                session.conversation.history(),
                session.documents.list(),
            );
            session.conversation.append(Turn::placeholder())?;
            pending.armed = true;
            self.publish(&session.conversation);
            request
        };

        let mut visible_updates = 0;
        let result = self.stream_reply(request, &token, &mut visible_updates).await;
        self.set_current(None);

        let mut session = self.session.lock().await;
        let outcome = match result {
            Ok(mut output) => {
                if output.cancelled && output.text.is_empty() {
                    output.text = STOPPED_TEXT.to_string();
                }
                session
                    .conversation
                    .mutate_last(TurnPatch::finish(output.text.clone()))?;

                let selections = if output.cancelled {
                    tracing::info!(chars = output.text.len(), "Assistant reply stopped by request");
                    Vec::new()
                } else {
                    self.route_tickers(&mut session.tickers, &output.text)
                };

                SendOutcome {
                    reply: Turn::assistant(output.text),
                    selections,
                    visible_updates: visible_updates + 1,
                    failed: false,
                    cancelled: output.cancelled,
                }
            }
            Err(e) => {
                tracing::error!(
                    backend = self.backend.name(),
                    error = %e,
                    "Assistant reply failed, showing fallback message"
                );
                session
                    .conversation
                    .mutate_last(TurnPatch::finish(self.settings.fallback_message.clone()))?;
                SendOutcome {
                    reply: Turn::assistant(self.settings.fallback_message.clone()),
                    selections: Vec::new(),
                    visible_updates: visible_updates + 1,
                    failed: true,
                    cancelled: false,
                }
            }
        };
        pending.armed = false;
        self.publish(&session.conversation);

        Ok(outcome)
    }

    /// Finish a reply whose send was dropped mid-stream, keeping what was
    /// already shown.
    fn close_abandoned(&self, conversation: &mut Conversation) {
        if !conversation.is_streaming() {
            return;
        }
        let text = match conversation.last() {
            Some(turn) if !turn.text.is_empty() => turn.text.clone(),
            _ => STOPPED_TEXT.to_string(),
        };
        match conversation.mutate_last(TurnPatch::finish(text)) {
            Ok(()) => self.publish(conversation),
            Err(e) => tracing::error!(error = %e, "Could not close abandoned reply"),
        }
    }

    async fn stream_reply(
        &self,
        request: GenerateRequest,
        token: &CancellationToken,
        visible_updates: &mut usize,
    ) -> Result<StreamOutput, ProviderError> {
        let mut stream = tokio::select! {
            _ = token.cancelled() => {
                return Ok(StreamOutput { text: String::new(), cancelled: true });
            }
            opened = self.backend.stream_generate(request) => opened?,
        };

        let mut throttle = UpdateThrottle::new(self.settings.throttle, self.clock.clone());
        let mut text = String::new();
        let mut chunks = 0usize;

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    return Ok(StreamOutput { text, cancelled: true });
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    text.push_str(&chunk);
                    if throttle.ready() {
                        let mut session = self.session.lock().await;
                        session.conversation.mutate_last(TurnPatch::text(text.clone())).map_err(
                            |e| ProviderError::Stream(format!("conversation rejected update: {}", e)),
                        )?;
                        self.publish(&session.conversation);
                        *visible_updates += 1;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        if text.is_empty() {
            return Err(ProviderError::Malformed("stream ended without text".to_string()));
        }

        tracing::debug!(chunks, updates = *visible_updates, "Assistant stream complete");
        Ok(StreamOutput {
            text,
            cancelled: false,
        })
    }

    fn route_tickers(&self, tickers: &mut TickerFilter, text: &str) -> Vec<Selection> {
        let mut selections = Vec::new();
        for m in tickers.filter(text) {
            match self.resolver.resolve(&m) {
                Some(company) => {
                    self.bridge.on_ticker_resolved(&company.symbol, &company.name);
                    selections.push(Selection {
                        ticker_symbol: company.symbol,
                        company_name: company.name,
                    });
                }
                None => {
                    tracing::debug!(token = %m.raw_token, "Ticker token did not resolve");
                }
            }
        }
        tracing::debug!(routed = selections.len(), seen = tickers.seen_count(), "Ticker tokens routed");
        selections
    }

    /// Cancel the reply that is streaming, if any. Returns whether one was.
    pub fn stop(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any in-flight reply and refuse to stream new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationSnapshot {
        self.session.lock().await.conversation.snapshot()
    }

    pub async fn add_document(&self, doc: DocumentRef) -> bool {
        self.session.lock().await.documents.add(doc)
    }

    pub async fn remove_document(&self, filename: &str) -> bool {
        self.session.lock().await.documents.remove(filename)
    }

    /// Base64 bytes resent with every request.
    pub async fn document_bytes(&self) -> usize {
        self.session.lock().await.documents.total_bytes()
    }

    pub async fn documents(&self) -> Vec<DocumentSummary> {
        self.session
            .lock()
            .await
            .documents
            .list()
            .iter()
            .map(|d| DocumentSummary {
                filename: d.filename.clone(),
                mime_type: d.mime_type.clone(),
                bytes: d.content.len(),
            })
            .collect()
    }

    fn set_current(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = token;
    }

    fn publish(&self, conversation: &Conversation) {
        self.updates.send_replace(conversation.snapshot());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use stockdesk_core::models::{KnownCompany, Role};
    use stockdesk_core::{ChunkStream, ManualClock};
    use tokio::sync::mpsc;

    const FALLBACK: &str = "Sorry, something went wrong.";

    /// Replays fixed chunks, advancing the clock `step` before each one.
    struct ScriptedBackend {
        chunks: Vec<Result<String, &'static str>>,
        clock: ManualClock,
        step: Duration,
        requests: StdMutex<Vec<GenerateRequest>>,
    }

    impl ScriptedBackend {
        fn new(chunks: &[&str], clock: ManualClock, step: Duration) -> Self {
            Self {
                chunks: chunks.iter().map(|c| Ok(c.to_string())).collect(),
                clock,
                step,
                requests: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerativeBackend for ScriptedBackend {
        async fn stream_generate(
            &self,
            request: GenerateRequest,
        ) -> Result<ChunkStream, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let clock = self.clock.clone();
            let step = self.step;
            let items: Vec<_> = self
                .chunks
                .iter()
                .map(|c| c.clone().map_err(|e| ProviderError::Stream(e.to_string())))
                .collect();
            Ok(Box::pin(stream::iter(items).map(move |item| {
                clock.advance(step);
                item
            })))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl GenerativeBackend for FailingBackend {
        async fn stream_generate(&self, _: GenerateRequest) -> Result<ChunkStream, ProviderError> {
            Err(ProviderError::Api {
                code: 503,
                message: "overloaded".to_string(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    type ChunkReceiver = mpsc::UnboundedReceiver<Result<String, ProviderError>>;

    /// Streams whatever the test pushes into the channel, one channel per request.
    struct ChannelBackend {
        receivers: StdMutex<VecDeque<ChunkReceiver>>,
    }

    impl ChannelBackend {
        fn new(receivers: Vec<ChunkReceiver>) -> Self {
            Self {
                receivers: StdMutex::new(receivers.into()),
            }
        }
    }

    #[async_trait]
    impl GenerativeBackend for ChannelBackend {
        async fn stream_generate(&self, _: GenerateRequest) -> Result<ChunkStream, ProviderError> {
            let rx = self.receivers.lock().unwrap().pop_front().expect("one channel per request");
            Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })))
        }

        fn name(&self) -> &str {
            "channel"
        }
    }

    /// Never opens its stream.
    struct StalledBackend;

    #[async_trait]
    impl GenerativeBackend for StalledBackend {
        async fn stream_generate(&self, _: GenerateRequest) -> Result<ChunkStream, ProviderError> {
            futures::future::pending().await
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[derive(Default)]
    struct RecordingBridge {
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl SelectionBridge for RecordingBridge {
        fn on_ticker_resolved(&self, ticker_symbol: &str, company_name: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((ticker_symbol.to_string(), company_name.to_string()));
        }
    }

    fn settings() -> AssistantSettings {
        AssistantSettings {
            fallback_message: FALLBACK.to_string(),
            throttle: Duration::from_millis(50),
        }
    }

    fn assistant_with(
        backend: Arc<dyn GenerativeBackend>,
        bridge: Arc<RecordingBridge>,
        clock: ManualClock,
    ) -> Assistant {
        Assistant::new(
            Conversation::new("You are a markets analyst.", "Hi! Ask me anything."),
            backend,
            bridge,
            TickerResolver::new(vec![], true),
            Arc::new(clock),
            settings(),
        )
    }

    fn streaming_count(snapshot: &ConversationSnapshot) -> usize {
        snapshot.turns.iter().filter(|t| t.is_streaming).count()
    }

    #[tokio::test]
    async fn test_completed_send_appends_one_assistant_turn() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(
            &["Apple is strong! ", "!AAPL, Apple Inc.!", " buy it"],
            clock.clone(),
            Duration::from_millis(5),
        ));
        let bridge = Arc::new(RecordingBridge::default());
        let assistant = assistant_with(backend, bridge.clone(), clock);

        let outcome = assistant.send("How is Apple doing?", None).await.unwrap();

        assert!(!outcome.failed);
        assert_eq!(outcome.reply.text, "Apple is strong! !AAPL, Apple Inc.! buy it");

        let snap = assistant.snapshot().await;
        // greeting, user, reply
        assert_eq!(snap.turns.len(), 3);
        assert_eq!(snap.turns[1].role, Role::User);
        assert_eq!(snap.turns[2].role, Role::Assistant);
        assert_eq!(snap.turns[2].text, outcome.reply.text);
        assert_eq!(streaming_count(&snap), 0);

        let calls = bridge.calls.lock().unwrap();
        assert_eq!(*calls, vec![("AAPL".to_string(), "Apple Inc.".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_send_shows_fallback_and_stays_usable() {
        let clock = ManualClock::new();
        let bridge = Arc::new(RecordingBridge::default());
        let assistant = assistant_with(Arc::new(FailingBackend), bridge.clone(), clock);

        let outcome = assistant.send("Hello?", None).await.unwrap();
        assert!(outcome.failed);
        assert_eq!(outcome.reply.text, FALLBACK);

        let snap = assistant.snapshot().await;
        let last = snap.turns.last().unwrap();
        assert_eq!(last.text, FALLBACK);
        assert!(!last.is_streaming);

        // Next turn goes through normally
        let again = assistant.send("Still there?", None).await.unwrap();
        assert!(again.failed);
        assert_eq!(assistant.snapshot().await.turns.len(), 5);
        assert!(bridge.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_error_replaces_partial_text() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend {
            chunks: vec![Ok("partial answer".to_string()), Err("connection reset")],
            clock: clock.clone(),
            step: Duration::from_millis(1),
            requests: StdMutex::new(Vec::new()),
        });
        let assistant = assistant_with(backend, Arc::new(RecordingBridge::default()), clock);

        let outcome = assistant.send("q", None).await.unwrap();
        assert!(outcome.failed);
        let snap = assistant.snapshot().await;
        assert_eq!(snap.turns.last().unwrap().text, FALLBACK);
        assert_eq!(streaming_count(&snap), 0);
    }

    #[tokio::test]
    async fn test_fast_stream_updates_are_coalesced() {
        let clock = ManualClock::new();
        let chunks: Vec<String> = (0..20).map(|i| format!("w{} ", i)).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let backend = Arc::new(ScriptedBackend::new(&refs, clock.clone(), Duration::from_millis(10)));
        let assistant = assistant_with(backend, Arc::new(RecordingBridge::default()), clock);

        let outcome = assistant.send("stream please", None).await.unwrap();

        // Published at t=10, 60, 110, 160 plus the final flush
        assert_eq!(outcome.visible_updates, 5);
        assert!(outcome.visible_updates < chunks.len());
        assert_eq!(outcome.reply.text, chunks.concat());
        assert_eq!(assistant.snapshot().await.turns.last().unwrap().text, chunks.concat());
    }

    #[tokio::test]
    async fn test_request_carries_all_documents() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(&["ok"], clock.clone(), Duration::ZERO));
        let assistant = assistant_with(backend.clone(), Arc::new(RecordingBridge::default()), clock);

        assert!(assistant.add_document(DocumentRef::pdf("annual.pdf", "QUFB")).await);
        assistant
            .send("Compare these", Some(DocumentRef::pdf("q3.pdf", "QkJC")))
            .await
            .unwrap();

        let docs: Vec<_> = assistant
            .documents()
            .await
            .into_iter()
            .map(|d| d.filename)
            .collect();
        assert_eq!(docs, vec!["annual.pdf", "q3.pdf"]);

        let requests = backend.requests.lock().unwrap();
        let req = &requests[0];
        // preamble + greeting + user turn
        assert_eq!(req.contents.len(), 3);
        assert_eq!(req.contents[0].parts.len(), 3);
        assert_eq!(req.contents[2].role.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_reuploading_same_filename_keeps_one_document() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(&["ok"], clock.clone(), Duration::ZERO));
        let assistant = assistant_with(backend, Arc::new(RecordingBridge::default()), clock);

        assistant.add_document(DocumentRef::pdf("a.pdf", "AAAA")).await;
        assistant.send("look", Some(DocumentRef::pdf("a.pdf", "AAAA"))).await.unwrap();

        assert_eq!(assistant.documents().await.len(), 1);
        assert!(!assistant.remove_document("b.pdf").await);
        assert!(assistant.remove_document("a.pdf").await);
        assert!(assistant.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_ticker_selected_once_per_session() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(
            &["!MSFT, Microsoft! again !MSFT, Microsoft!"],
            clock.clone(),
            Duration::ZERO,
        ));
        let bridge = Arc::new(RecordingBridge::default());
        let assistant = assistant_with(backend, bridge.clone(), clock);

        let first = assistant.send("one", None).await.unwrap();
        let second = assistant.send("two", None).await.unwrap();

        assert_eq!(first.selections.len(), 1);
        assert!(second.selections.is_empty());
        assert_eq!(bridge.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_ticker_is_silent() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(&["!TATA, Tata!"], clock.clone(), Duration::ZERO));
        let bridge = Arc::new(RecordingBridge::default());
        let assistant = Assistant::new(
            Conversation::new("sys", "hi"),
            backend,
            bridge.clone(),
            TickerResolver::new(
                vec![
                    KnownCompany { symbol: "TATAMOTORS.NS".into(), name: "Tata Motors".into() },
                    KnownCompany { symbol: "TATASTEEL.NS".into(), name: "Tata Steel".into() },
                ],
                true,
            ),
            Arc::new(clock),
            settings(),
        );

        let outcome = assistant.send("tata?", None).await.unwrap();
        assert!(!outcome.failed);
        assert!(outcome.selections.is_empty());
        assert!(bridge.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let clock = ManualClock::new();
        let assistant = assistant_with(Arc::new(FailingBackend), Arc::new(RecordingBridge::default()), clock);
        assert!(matches!(
            assistant.send("   ", None).await,
            Err(AssistantError::EmptyMessage)
        ));
        assert_eq!(assistant.snapshot().await.turns.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_send_is_rejected_not_interleaved() {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(ChannelBackend::new(vec![rx]));
        let clock = ManualClock::new();
        let assistant = Arc::new(assistant_with(backend, Arc::new(RecordingBridge::default()), clock));
        let mut updates = assistant.subscribe();

        let first = {
            let assistant = assistant.clone();
            tokio::spawn(async move { assistant.send("first", None).await })
        };

        updates
            .wait_for(|s| s.turns.last().map(|t| t.is_streaming).unwrap_or(false))
            .await
            .unwrap();
        assert!(assistant.is_busy());

        let before = assistant.snapshot().await;
        assert!(matches!(
            assistant.send("second", None).await,
            Err(AssistantError::Busy)
        ));
        let after = assistant.snapshot().await;
        assert_eq!(before.turns, after.turns);

        tx.send(Ok("done".to_string())).unwrap();
        drop(tx);
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.reply.text, "done");
        assert!(!assistant.is_busy());

        let snap = assistant.snapshot().await;
        assert_eq!(snap.turns.len(), 3);
        assert_eq!(streaming_count(&snap), 0);
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_text() {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(ChannelBackend::new(vec![rx]));
        let clock = ManualClock::new();
        let assistant = Arc::new(assistant_with(backend, Arc::new(RecordingBridge::default()), clock));
        let mut updates = assistant.subscribe();

        let task = {
            let assistant = assistant.clone();
            tokio::spawn(async move { assistant.send("long answer please", None).await })
        };

        tx.send(Ok("The first part".to_string())).unwrap();
        updates
            .wait_for(|s| s.turns.last().map(|t| t.text == "The first part").unwrap_or(false))
            .await
            .unwrap();

        assert!(assistant.stop());
        let outcome = task.await.unwrap().unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.failed);
        assert_eq!(outcome.reply.text, "The first part");
        let snap = assistant.snapshot().await;
        assert!(!snap.turns.last().unwrap().is_streaming);
        assert!(!assistant.stop());
    }

    #[tokio::test]
    async fn test_empty_stream_shows_fallback() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(&[], clock.clone(), Duration::ZERO));
        let assistant = assistant_with(backend, Arc::new(RecordingBridge::default()), clock);

        let outcome = assistant.send("anything?", None).await.unwrap();
        assert!(outcome.failed);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.reply.text, FALLBACK);
        let snap = assistant.snapshot().await;
        assert_eq!(snap.turns.last().unwrap().text, FALLBACK);
        assert_eq!(streaming_count(&snap), 0);
    }

    #[tokio::test]
    async fn test_stop_before_stream_opens_stores_stopped_text() {
        let clock = ManualClock::new();
        let assistant = Arc::new(assistant_with(
            Arc::new(StalledBackend),
            Arc::new(RecordingBridge::default()),
            clock,
        ));
        let mut updates = assistant.subscribe();

        let task = {
            let assistant = assistant.clone();
            tokio::spawn(async move { assistant.send("hello", None).await })
        };
        updates
            .wait_for(|s| s.turns.last().map(|t| t.is_streaming).unwrap_or(false))
            .await
            .unwrap();

        assert!(assistant.stop());
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.failed);
        assert_eq!(outcome.reply.text, STOPPED_TEXT);

        let snap = assistant.snapshot().await;
        let last = snap.turns.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text, STOPPED_TEXT);
        assert!(!last.is_streaming);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_streaming_reply() {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = ManualClock::new();
        let assistant = Arc::new(assistant_with(
            Arc::new(ChannelBackend::new(vec![rx])),
            Arc::new(RecordingBridge::default()),
            clock,
        ));
        let mut updates = assistant.subscribe();

        let task = {
            let assistant = assistant.clone();
            tokio::spawn(async move { assistant.send("explain", None).await })
        };
        tx.send(Ok("So far".to_string())).unwrap();
        updates
            .wait_for(|s| s.turns.last().map(|t| t.text == "So far").unwrap_or(false))
            .await
            .unwrap();

        assistant.shutdown();
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.reply.text, "So far");

        let snap = assistant.snapshot().await;
        assert_eq!(snap.turns.len(), 3);
        assert!(!snap.turns[2].is_streaming);
        assert_eq!(snap.turns[2].text, "So far");
        assert!(!assistant.is_busy());
    }

    #[tokio::test]
    async fn test_send_after_shutdown_leaves_conversation_untouched() {
        let clock = ManualClock::new();
        let backend = Arc::new(ScriptedBackend::new(&["never"], clock.clone(), Duration::ZERO));
        let assistant = assistant_with(backend.clone(), Arc::new(RecordingBridge::default()), clock);

        assistant.shutdown();
        let before = assistant.snapshot().await;
        assert!(matches!(
            assistant.send("too late", None).await,
            Err(AssistantError::ShuttingDown)
        ));

        let after = assistant.snapshot().await;
        assert_eq!(before.revision, after.revision);
        assert_eq!(before.turns, after.turns);
        assert!(backend.requests.lock().unwrap().is_empty());
        assert!(!assistant.is_busy());
    }

    #[tokio::test]
    async fn test_dropped_send_closes_reply_and_next_send_succeeds() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let clock = ManualClock::new();
        let assistant = assistant_with(
            Arc::new(ChannelBackend::new(vec![rx1, rx2])),
            Arc::new(RecordingBridge::default()),
            clock,
        );

        tx1.send(Ok("half an answer".to_string())).unwrap();
        let dropped = tokio::time::timeout(Duration::from_millis(50), assistant.send("first", None)).await;
        assert!(dropped.is_err(), "stream never ends so the send must time out");

        let snap = assistant.snapshot().await;
        assert_eq!(streaming_count(&snap), 0);
        assert_eq!(snap.turns.last().unwrap().text, "half an answer");
        assert!(!assistant.is_busy());
        assert!(!assistant.stop());

        tx2.send(Ok("second reply".to_string())).unwrap();
        drop(tx2);
        let outcome = assistant.send("second", None).await.unwrap();
        assert!(!outcome.failed);
        assert_eq!(outcome.reply.text, "second reply");

        let snap = assistant.snapshot().await;
        // greeting, first, partial, second, reply
        assert_eq!(snap.turns.len(), 5);
        assert_eq!(streaming_count(&snap), 0);
        drop(tx1);
    }

    #[tokio::test]
    async fn test_reply_left_streaming_is_closed_on_next_send() {
        let (_tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let clock = ManualClock::new();
        let assistant = assistant_with(
            Arc::new(ChannelBackend::new(vec![rx1, rx2])),
            Arc::new(RecordingBridge::default()),
            clock,
        );

        let mut first = Box::pin(assistant.send("first", None));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut first).await.is_err());

        // Holding the session lock keeps the drop from closing the reply
        let held = assistant.session.lock().await;
        drop(first);
        drop(held);
        assert_eq!(streaming_count(&assistant.snapshot().await), 1);

        tx2.send(Ok("fresh".to_string())).unwrap();
        drop(tx2);
        let outcome = assistant.send("second", None).await.unwrap();
        assert_eq!(outcome.reply.text, "fresh");

        let snap = assistant.snapshot().await;
        assert_eq!(snap.turns.len(), 5);
        assert_eq!(snap.turns[2].text, STOPPED_TEXT);
        assert_eq!(streaming_count(&snap), 0);
    }
}
