//! Wires the subsystems together from a loaded config.

use std::sync::Arc;
use std::time::Duration;

use stockdesk_core::{
    ChannelSelectionBridge, Clock, Conversation, GeminiClient, GeminiConfig, GenerativeBackend,
    HttpMarketClient, MarketClientConfig, MarketDataProvider, ReportStore, RestReportConfig,
    RestReportStore, StockdeskConfig, StockdeskError, SystemClock, TickerResolver,
};

use crate::http::HttpState;
use crate::subsystems::assistant::{Assistant, AssistantSettings};
use crate::subsystems::library::Library;
use crate::subsystems::quotes::QuoteService;

/// External services the server talks to.
pub struct Backends {
    pub generative: Arc<dyn GenerativeBackend>,
    pub market: Arc<dyn MarketDataProvider>,
    pub reports: Arc<dyn ReportStore>,
}

impl Backends {
    /// Real HTTP clients. API keys come from the environment.
    pub fn from_config(config: &StockdeskConfig) -> Result<Self, StockdeskError> {
        let generative = GeminiClient::new(GeminiConfig::new(
            None,
            config.assistant.model.clone(),
            config.assistant.base_url.clone(),
        ))?;
        let market = HttpMarketClient::new(MarketClientConfig::new(
            None,
            config.market.base_url.clone(),
        ))?;
        let reports = RestReportStore::new(RestReportConfig::new(
            None,
            config.reports.base_url.clone(),
            config.reports.table.clone(),
        ))?;

        tracing::info!(model = %generative.model(), "Backends configured");

        Ok(Self {
            generative: Arc::new(generative),
            market: Arc::new(market),
            reports: Arc::new(reports),
        })
    }
}

/// Build the shared handler state.
pub fn build_state(
    config: &StockdeskConfig,
    backends: Backends,
    clock: Arc<dyn Clock>,
) -> HttpState {
    let selection = Arc::new(ChannelSelectionBridge::new());

    let assistant = Assistant::new(
        Conversation::new(&config.assistant.system_prompt, &config.assistant.greeting),
        backends.generative,
        selection.clone(),
        TickerResolver::from_config(&config.tickers),
        clock.clone(),
        AssistantSettings::from(&config.assistant),
    );
    let quotes = QuoteService::new(backends.market, clock, &config.market);
    let library = Library::new(backends.reports);

    HttpState {
        assistant: Arc::new(assistant),
        quotes: Arc::new(quotes),
        library: Arc::new(library),
        selection,
        watchlist: config.market.watchlist.clone(),
    }
}

pub fn build_state_from_config(config: &StockdeskConfig) -> Result<HttpState, StockdeskError> {
    let backends = Backends::from_config(config)?;
    Ok(build_state(config, backends, Arc::new(SystemClock)))
}

/// How often the watchlist is re-fetched: once per cache lifetime.
pub fn watchlist_interval(config: &StockdeskConfig) -> Duration {
    Duration::from_secs(config.market.cache_ttl_seconds.max(1))
}
