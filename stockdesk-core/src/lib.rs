pub mod cache;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod documents;
pub mod error;
pub mod gemini;
pub mod market;
pub mod models;
pub mod reports;
pub mod selection;
pub mod symbols;
pub mod ticker;

pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StockdeskConfig;
pub use conversation::{Conversation, ConversationError, ConversationSnapshot, TurnPatch};
pub use documents::DocumentStore;
pub use error::StockdeskError;
pub use gemini::{
    build_request, ChunkStream, GeminiClient, GeminiConfig, GenerateRequest, GenerativeBackend,
    ProviderError,
};
pub use market::{HttpMarketClient, MarketClientConfig, MarketDataProvider, MarketError};
pub use reports::{ReportError, ReportStore, RestReportConfig, RestReportStore};
pub use selection::{ChannelSelectionBridge, Selection, SelectionBridge};
pub use symbols::{Exchange, ExchangeSymbol};
pub use ticker::{TickerFilter, TickerResolver};
