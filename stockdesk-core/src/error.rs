use thiserror::Error;

use crate::gemini::ProviderError;
use crate::market::MarketError;
use crate::reports::ReportError;

#[derive(Error, Debug)]
pub enum StockdeskError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Market data error: {0}")]
    Market(#[from] MarketError),

    #[error("Report store error: {0}")]
    Reports(#[from] ReportError),

    #[error("Other error: {0}")]
    Other(String),
}
