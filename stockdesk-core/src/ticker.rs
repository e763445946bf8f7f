//! Ticker tokens in assistant output.
//!
//! The assistant is prompted to mark companies it talks about as
//! `!SYMBOL, Company Name!`. [`extract`] finds those tokens, [`TickerFilter`]
//! remembers which ones were already reported this session, and
//! [`TickerResolver`] maps them onto the dashboard's known companies.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{KnownCompany, TickerMatch};

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"!([A-Z][A-Za-z0-9.:\-]*)\s*,\s*([^!]+?)\s*!")
            .expect("ticker token pattern is valid")
    })
}

/// Lazily scan `text` for ticker tokens.
///
/// Each distinct raw token is yielded once per call, in order of first
/// appearance. A dangling `!` is simply not matched.
pub fn extract(text: &str) -> impl Iterator<Item = TickerMatch> + '_ {
    let mut seen = HashSet::new();
    token_pattern().captures_iter(text).filter_map(move |caps| {
        let raw = caps.get(0)?.as_str();
        if !seen.insert(raw) {
            return None;
        }
        Some(TickerMatch {
            raw_token: raw.to_string(),
            ticker_symbol: caps[1].to_string(),
            company_name: caps[2].to_string(),
        })
    })
}

/// Session-scoped dedup over [`extract`].
#[derive(Debug, Default)]
pub struct TickerFilter {
    seen: HashSet<String>,
}

impl TickerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches in `text` whose raw token has not been reported before.
    pub fn filter<'a>(&'a mut self, text: &'a str) -> impl Iterator<Item = TickerMatch> + 'a {
        extract(text).filter(move |m| self.seen.insert(m.raw_token.clone()))
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Maps extracted tokens onto the known company list.
#[derive(Debug, Clone)]
pub struct TickerResolver {
    known: Vec<KnownCompany>,
    fuzzy_fallback: bool,
}

impl TickerResolver {
    pub fn new(known: Vec<KnownCompany>, fuzzy_fallback: bool) -> Self {
        Self {
            known,
            fuzzy_fallback,
        }
    }

    pub fn from_config(config: &crate::config::TickerConfig) -> Self {
        Self::new(
            config.known.iter().map(KnownCompany::from).collect(),
            config.fuzzy_fallback,
        )
    }

    /// Resolve a match to a single company, or `None` when nothing (or more
    /// than one candidate) fits.
    pub fn resolve(&self, m: &TickerMatch) -> Option<KnownCompany> {
        if self.known.is_empty() {
            return Some(KnownCompany {
                symbol: m.ticker_symbol.clone(),
                name: m.company_name.clone(),
            });
        }

        let name = m.company_name.to_lowercase();

        let exact = self
            .known
            .iter()
            .find(|k| k.symbol == m.ticker_symbol && k.name == m.company_name)
            .or_else(|| self.known.iter().find(|k| k.name.to_lowercase() == name))
            .or_else(|| {
                self.known
                    .iter()
                    .find(|k| k.symbol.eq_ignore_ascii_case(&m.ticker_symbol))
            });
        if let Some(k) = exact {
            return Some(k.clone());
        }

        if !self.fuzzy_fallback || name.is_empty() {
            return None;
        }

        let mut candidates = self.known.iter().filter(|k| {
            let known = k.name.to_lowercase();
            known.contains(&name) || name.contains(&known)
        });
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only.clone()),
            (Some(_), Some(_)) => {
                tracing::debug!(
                    company = %m.company_name,
                    "Ambiguous company name, skipping selection"
                );
                None
            }
            _ => None,
        }
    }
}
