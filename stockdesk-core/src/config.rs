use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct StockdeskConfig {
    pub service: ServiceConfig,
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub tickers: TickerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    pub model: String,
    pub system_prompt: String,
    pub greeting: String,
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    #[serde(default = "default_throttle_ms")]
    pub stream_throttle_ms: u64,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
}

fn default_fallback_message() -> String {
    "Sorry, I encountered an error while processing your request. Please try again.".to_string()
}

fn default_throttle_ms() -> u64 {
    50
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    pub base_url: String,
    pub cache_ttl_seconds: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Symbols shown in the ticker strip when a client asks for no symbols.
    #[serde(default)]
    pub watchlist: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: "https://finnhub.io/api/v1".to_string(),
            cache_ttl_seconds: 300,
            batch_size: 5,
            batch_delay_ms: 1000,
            watchlist: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    pub base_url: String,
    #[serde(default = "default_reports_table")]
    pub table: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            table: default_reports_table(),
        }
    }
}

fn default_reports_table() -> String {
    "reports".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TickerConfig {
    /// Substring fallback when an extracted company name has no exact match.
    pub fuzzy_fallback: bool,
    #[serde(default)]
    pub known: Vec<KnownCompanyConfig>,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            fuzzy_fallback: true,
            known: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnownCompanyConfig {
    pub symbol: String,
    pub name: String,
}

impl StockdeskConfig {
    /// Load from a TOML file; `STOCKDESK__SECTION__KEY` env vars override file values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("STOCKDESK").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
