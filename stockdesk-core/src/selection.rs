//! Hands resolved tickers to whoever drives the dashboard's selected company.

use serde::Serialize;
use tokio::sync::watch;

/// Notified when the assistant names a company. Fire-and-forget; callers
/// deduplicate before calling.
pub trait SelectionBridge: Send + Sync {
    fn on_ticker_resolved(&self, ticker_symbol: &str, company_name: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub ticker_symbol: String,
    pub company_name: String,
}

/// Publishes the latest selection on a `watch` channel.
pub struct ChannelSelectionBridge {
    tx: watch::Sender<Option<Selection>>,
}

impl ChannelSelectionBridge {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Selection>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Selection> {
        self.tx.borrow().clone()
    }
}

impl Default for ChannelSelectionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionBridge for ChannelSelectionBridge {
    fn on_ticker_resolved(&self, ticker_symbol: &str, company_name: &str) {
        tracing::info!(symbol = %ticker_symbol, company = %company_name, "Company selected");
        // send_replace works with no receivers attached
        self.tx.send_replace(Some(Selection {
            ticker_symbol: ticker_symbol.to_string(),
            company_name: company_name.to_string(),
        }));
    }
}
