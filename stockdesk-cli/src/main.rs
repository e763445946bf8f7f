//! stockdesk-cli: terminal client for a running Stockdesk server
//!
//! # Subcommands
//! - `chat <message> [--attach FILE] [--json]`  ask the assistant, wait for the reply
//! - `stop`                                    cancel the reply being streamed
//! - `documents [--json]`                      list attached documents
//! - `quotes [SYMBOLS]... [--json]`            quotes (watchlist when none given)
//! - `reports [QUERY] [--json]`                search the report library
//! - `attach <REPORT_ID>`                      attach a library report to the chat
//! - `status`                                  show server health

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "stockdesk-cli", version, about = "Stockdesk assistant, quotes and reports from the terminal")]
struct Cli {
    /// Stockdesk HTTP server URL (overrides STOCKDESK_HTTP_URL env var)
    #[arg(long, env = "STOCKDESK_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a message to the assistant
    Chat {
        message: String,

        /// PDF to attach to this message
        #[arg(short, long)]
        attach: Option<String>,

        /// Print the raw server response
        #[arg(long)]
        json: bool,
    },

    /// Stop the reply currently streaming
    Stop,

    /// List documents attached to the conversation
    Documents {
        #[arg(long)]
        json: bool,
    },

    /// Show quotes for symbols, or the server watchlist when none are given
    Quotes {
        symbols: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Search the report library
    Reports {
        query: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Attach a library report to the conversation
    Attach { report_id: String },

    /// Show server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReplyTurn {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectionDto {
    pub ticker_symbol: String,
    pub company_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub reply: ReplyTurn,
    #[serde(default)]
    pub selections: Vec<SelectionDto>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuoteDto {
    pub symbol: String,
    pub current: f64,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct QuotesResponse {
    pub quotes: Vec<QuoteDto>,
    #[serde(default)]
    pub stale: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportDto {
    pub id: String,
    pub title: String,
    pub stock_symbol: Option<String>,
    pub report_type: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportsResponse {
    pub reports: Vec<ReportDto>,
}

// ============================================================================
// Formatting
// ============================================================================

/// Replace `!SYMBOL, Company!` markers with `Company (SYMBOL)` for display.
pub fn render_tickers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('!') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let replaced = after.find('!').and_then(|end| {
            let inner = &after[..end];
            let (symbol, name) = inner.split_once(',')?;
            let (symbol, name) = (symbol.trim(), name.trim());
            let valid = symbol.chars().next().map_or(false, |c| c.is_ascii_uppercase())
                && !symbol.contains(char::is_whitespace)
                && !name.is_empty();
            valid.then(|| (format!("{} ({})", name, symbol), end))
        });
        match replaced {
            Some((display, end)) => {
                out.push_str(&display);
                rest = &after[end + 1..];
            }
            None => {
                out.push('!');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn format_quote(q: &QuoteDto) -> String {
    let change = match (q.change, q.percent_change) {
        (Some(c), Some(p)) => format!("{:+.2} ({:+.2}%)", c, p),
        (Some(c), None) => format!("{:+.2}", c),
        _ => "-".to_string(),
    };
    format!("{:<12} {:>12.2}  {}", q.symbol, q.current, change)
}

pub fn format_report(r: &ReportDto) -> String {
    let date = r.created_at.as_deref().and_then(|d| d.get(..10)).unwrap_or("");
    format!(
        "{}  {:<10} {:<8} {}  [{}]",
        date,
        r.stock_symbol.as_deref().unwrap_or("-"),
        r.report_type.as_deref().unwrap_or("-"),
        r.title,
        r.id
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    server: String,
    client: reqwest::blocking::Client,
}

impl Api {
    fn new(server: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder, url: &str) -> anyhow::Result<Value> {
        let resp = request
            .send()
            .with_context(|| format!("connection failed to {}", url))?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no details");
            bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.server, path);
        self.send(self.client.get(&url).query(query), &url)
    }

    fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.server, path);
        self.send(self.client.post(&url).json(body), &url)
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_attachment(path: &str) -> anyhow::Result<Value> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path))?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no file name", path))?;
    Ok(serde_json::json!({
        "filename": filename,
        "content": STANDARD.encode(bytes),
    }))
}

fn do_chat(server: &str, message: &str, attach: Option<&str>, json: bool) -> anyhow::Result<()> {
    // Replies stream to completion before the server answers
    let api = Api::new(server, Duration::from_secs(300))?;
    let mut body = serde_json::json!({ "message": message });
    if let Some(path) = attach {
        body["document"] = read_attachment(path)?;
    }

    let resp = api.post("/chat", &body)?;
    if json {
        return print_json(&resp);
    }

    let chat: ChatResponse = serde_json::from_value(resp)?;
    println!("{}", render_tickers(&chat.reply.text));
    if chat.cancelled {
        eprintln!("(reply stopped)");
    }
    if chat.failed {
        std::process::exit(2);
    }
    for s in &chat.selections {
        eprintln!("Selected: {} ({})", s.company_name, s.ticker_symbol);
    }
    Ok(())
}

fn do_stop(server: &str) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(10))?;
    let resp = api.post("/chat/stop", &Value::Null)?;
    if resp["stopped"].as_bool().unwrap_or(false) {
        println!("Reply stopped");
    } else {
        println!("Nothing streaming");
    }
    Ok(())
}

fn do_documents(server: &str, json: bool) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(10))?;
    let resp = api.get("/documents", &[])?;
    if json {
        return print_json(&resp);
    }
    let docs = resp["documents"].as_array().cloned().unwrap_or_default();
    if docs.is_empty() {
        eprintln!("No documents attached");
    }
    for d in docs {
        println!(
            "{}  ({}, {} bytes base64)",
            d["filename"].as_str().unwrap_or("?"),
            d["mime_type"].as_str().unwrap_or("?"),
            d["bytes"].as_u64().unwrap_or(0)
        );
    }
    Ok(())
}

fn do_quotes(server: &str, symbols: &[String], json: bool) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(60))?;
    let joined = symbols.join(",");
    let query: Vec<(&str, &str)> = if joined.is_empty() {
        Vec::new()
    } else {
        vec![("symbols", joined.as_str())]
    };
    let resp = api.get("/quotes", &query)?;
    if json {
        return print_json(&resp);
    }

    let quotes: QuotesResponse = serde_json::from_value(resp)?;
    for q in &quotes.quotes {
        let marker = if quotes.stale.contains(&q.symbol) { "  (stale)" } else { "" };
        println!("{}{}", format_quote(q), marker);
    }
    for s in &quotes.failed {
        eprintln!("{:<12} unavailable", s);
    }
    Ok(())
}

fn do_reports(server: &str, query: Option<&str>, json: bool) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(30))?;
    let params: Vec<(&str, &str)> = query.map(|q| vec![("q", q)]).unwrap_or_default();
    let resp = api.get("/reports", &params)?;
    if json {
        return print_json(&resp);
    }

    let reports: ReportsResponse = serde_json::from_value(resp)?;
    if reports.reports.is_empty() {
        eprintln!("No reports found");
    }
    for r in &reports.reports {
        println!("{}", format_report(r));
    }
    Ok(())
}

fn do_attach(server: &str, report_id: &str) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(120))?;
    let resp = api.post(&format!("/reports/{}/attach", report_id), &Value::Null)?;
    let filename = resp["filename"].as_str().unwrap_or("?");
    if resp["added"].as_bool().unwrap_or(false) {
        println!("Attached {}", filename);
    } else {
        println!("{} was already attached", filename);
    }
    Ok(())
}

fn do_status(server: &str) -> anyhow::Result<()> {
    let api = Api::new(server, Duration::from_secs(10))?;
    let body = api.get("/health", &[])?;
    println!("Stockdesk server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
    println!("Backend:          {}", body["backend"].as_str().unwrap_or("?"));
    println!("Streaming:        {}", body["busy"].as_bool().unwrap_or(false));
    println!("Documents:        {}", body["documents"].as_u64().unwrap_or(0));

    if let Ok(sel) = api.get("/selection", &[]) {
        if let Some(s) = sel["selection"].as_object() {
            println!(
                "Selected:         {} ({})",
                s.get("company_name").and_then(Value::as_str).unwrap_or("?"),
                s.get("ticker_symbol").and_then(Value::as_str).unwrap_or("?")
            );
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.as_str();

    let result = match &cli.command {
        Commands::Chat { message, attach, json } => do_chat(server, message, attach.as_deref(), *json),
        Commands::Stop => do_stop(server),
        Commands::Documents { json } => do_documents(server, *json),
        Commands::Quotes { symbols, json } => do_quotes(server, symbols, *json),
        Commands::Reports { query, json } => do_reports(server, query.as_deref(), *json),
        Commands::Attach { report_id } => do_attach(server, report_id),
        Commands::Status => do_status(server),
    };

    if let Err(e) = result {
        eprintln!("stockdesk-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
