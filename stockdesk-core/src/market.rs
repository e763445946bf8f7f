//! Market-data client for the ticker strip and the company detail panel.
//!
//! One symbol per request. The provider's numeric fields are loosely typed
//! (numbers, numeric strings, `null`), so every field is validated before
//! it reaches a [`Quote`] or [`Fundamentals`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Fundamentals, Quote};
use crate::symbols::ExchangeSymbol;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote, MarketError>;

    async fn fundamentals(&self, symbol: &str) -> Result<Fundamentals, MarketError>;
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Malformed response for {symbol}: {reason}")]
    Malformed { symbol: String, reason: String },

    #[error("No data for symbol {0}")]
    NotFound(String),

    #[error("Missing API key")]
    MissingApiKey,
}

/// Accept JSON numbers and numeric strings; reject everything else.
pub fn numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Finnhub-style quote body: `{c, d, dp, h, l, o, pc}`.
pub fn parse_quote(symbol: &str, body: &Value) -> Result<Quote, MarketError> {
    let current = numeric(&body["c"]).ok_or_else(|| MarketError::Malformed {
        symbol: symbol.to_string(),
        reason: format!("current price is not numeric: {}", body["c"]),
    })?;

    let previous_close = numeric(&body["pc"]);

    // Unknown symbols come back as an all-zero quote
    if current == 0.0 && previous_close.unwrap_or(0.0) == 0.0 {
        return Err(MarketError::NotFound(symbol.to_string()));
    }

    Ok(Quote {
        symbol: symbol.to_string(),
        current,
        change: numeric(&body["d"]),
        percent_change: numeric(&body["dp"]),
        high: numeric(&body["h"]),
        low: numeric(&body["l"]),
        open: numeric(&body["o"]),
        previous_close,
    })
}

/// Combine a company profile and its metric block.
pub fn parse_fundamentals(symbol: &str, profile: &Value, metrics: &Value) -> Fundamentals {
    let metric = &metrics["metric"];
    Fundamentals {
        symbol: symbol.to_string(),
        name: text(&profile["name"]),
        sector: text(&profile["finnhubIndustry"]),
        market_cap: numeric(&profile["marketCapitalization"]),
        pe_ratio: numeric(&metric["peBasicExclExtraTTM"]).or_else(|| numeric(&metric["peTTM"])),
        eps: numeric(&metric["epsBasicExclExtraItemsTTM"]).or_else(|| numeric(&metric["epsTTM"])),
        dividend_yield: numeric(&metric["dividendYieldIndicatedAnnual"]),
        week52_high: numeric(&metric["52WeekHigh"]),
        week52_low: numeric(&metric["52WeekLow"]),
    }
}

#[derive(Debug, Clone)]
pub struct MarketClientConfig {
    pub api_key: String,
    pub base_url: String,
}

impl MarketClientConfig {
    pub fn new(api_key: Option<String>, base_url: String) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("MARKET_API_KEY").ok())
            .unwrap_or_default();
        Self { api_key, base_url }
    }
}

#[derive(Clone)]
pub struct HttpMarketClient {
    client: Client,
    config: MarketClientConfig,
}

impl HttpMarketClient {
    pub fn new(config: MarketClientConfig) -> Result<Self, MarketError> {
        if config.api_key.is_empty() {
            return Err(MarketError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self { client, config })
    }

    async fn get_json(&self, endpoint: &str, symbol: &str) -> Result<Value, MarketError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let provider_symbol = ExchangeSymbol::parse(symbol).provider_symbol();

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", provider_symbol.as_str()), ("token", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(symbol = %symbol, code = status.as_u16(), "Market data API error");
            return Err(MarketError::Api {
                code: status.as_u16(),
                message,
            });
        }

        response.json::<Value>().await.map_err(|e| MarketError::Malformed {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketClient {
    async fn quote(&self, symbol: &str) -> Result<Quote, MarketError> {
        let body = self.get_json("/quote", symbol).await?;
        parse_quote(symbol, &body)
    }

    async fn fundamentals(&self, symbol: &str) -> Result<Fundamentals, MarketError> {
        let profile = self.get_json("/stock/profile2", symbol).await?;
        if profile.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Err(MarketError::NotFound(symbol.to_string()));
        }
        let metrics = self.get_json("/stock/metric", symbol).await?;
        Ok(parse_fundamentals(symbol, &profile, &metrics))
    }
}
