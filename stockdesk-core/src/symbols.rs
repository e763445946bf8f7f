//! Exchange-suffixed ticker symbols (`RELIANCE.NS`, `VOD.L`, `AAPL`).
//!
//! The dashboard uses Yahoo-style suffixes; the market-data provider wants
//! `EXCHANGE:BASE` for anything that is not a US listing.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Us,
    Nse,
    Bse,
    Lse,
    Tsx,
}

impl Exchange {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.to_ascii_uppercase().as_str() {
            "NS" => Some(Exchange::Nse),
            "BO" => Some(Exchange::Bse),
            "L" => Some(Exchange::Lse),
            "TO" => Some(Exchange::Tsx),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Exchange::Us => "US",
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Lse => "LSE",
            Exchange::Tsx => "TSX",
        }
    }

    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Exchange::Us => None,
            Exchange::Nse => Some("NS"),
            Exchange::Bse => Some("BO"),
            Exchange::Lse => Some("L"),
            Exchange::Tsx => Some("TO"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSymbol {
    pub base: String,
    pub exchange: Exchange,
}

impl ExchangeSymbol {
    /// Parse a dashboard symbol. Unknown suffixes are kept as part of the
    /// base (`BRK.B` stays a US symbol).
    pub fn parse(symbol: &str) -> Self {
        let symbol = symbol.trim().to_ascii_uppercase();
        if let Some((base, suffix)) = symbol.rsplit_once('.') {
            if let Some(exchange) = Exchange::from_suffix(suffix) {
                if !base.is_empty() {
                    return Self {
                        base: base.to_string(),
                        exchange,
                    };
                }
            }
        }
        Self {
            base: symbol,
            exchange: Exchange::Us,
        }
    }

    /// Symbol as shown in the ticker strip.
    pub fn display(&self) -> &str {
        &self.base
    }

    /// Symbol in the form the market-data provider expects.
    pub fn provider_symbol(&self) -> String {
        match self.exchange {
            Exchange::Us => self.base.clone(),
            other => format!("{}:{}", other.code(), self.base),
        }
    }
}

impl fmt::Display for ExchangeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exchange.suffix() {
            Some(suffix) => write!(f, "{}.{}", self.base, suffix),
            None => f.write_str(&self.base),
        }
    }
}
