use serde::{Deserialize, Serialize};

/// A `!SYMBOL, Company Name!` token found in assistant output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerMatch {
    pub raw_token: String,
    pub ticker_symbol: String,
    pub company_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownCompany {
    pub symbol: String,
    pub name: String,
}

impl From<&crate::config::KnownCompanyConfig> for KnownCompany {
    fn from(c: &crate::config::KnownCompanyConfig) -> Self {
        Self {
            symbol: c.symbol.clone(),
            name: c.name.clone(),
        }
    }
}
