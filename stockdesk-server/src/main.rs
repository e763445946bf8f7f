use std::sync::Arc;

use clap::Parser;
use stockdesk_core::StockdeskConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use stockdesk_server::{app, http, subsystems};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "stockdesk.toml")]
    config: String,

    /// Print the resolved configuration (without secrets) and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // API keys usually live in .env during development
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match StockdeskConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.check {
        println!("model:      {}", config.assistant.model);
        println!("http:       {}:{}", config.http.host, config.http.port);
        println!("market:     {}", config.market.base_url);
        println!("reports:    {}/{}", config.reports.base_url, config.reports.table);
        println!("watchlist:  {}", config.market.watchlist.join(", "));
        println!("tickers:    {} known", config.tickers.known.len());
        return Ok(());
    }

    let state = match app::build_state_from_config(&config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    let shutdown_assistant = state.assistant.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown_assistant.shutdown();
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(subsystems::quotes::run_watchlist_loop(
        state.quotes.clone(),
        config.market.watchlist.clone(),
        app::watchlist_interval(&config),
        tx.subscribe(),
    ));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    http::start_http_server(state, addr, tx.subscribe()).await?;

    Ok(())
}
