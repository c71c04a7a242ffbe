//! Demo binary: subscribe a token list and tail the update channel, printing
//! top-of-book reads as they change.

use anyhow::{Context, Result};
use clap::Parser;

use core_types::{BookError, FeedConfig, UpdateKind};
use polybook_sdk::OrderBookSdk;

#[derive(Parser, Debug)]
#[command(name = "polybook", about = "Polymarket order book stream viewer", version)]
struct Cli {
    /// Token ids (asset ids) to subscribe.
    #[arg(required = true)]
    tokens: Vec<String>,
    /// Optional TOML config; env overrides still apply on top of defaults.
    #[arg(long)]
    config: Option<String>,
    /// Override the WebSocket endpoint.
    #[arg(long)]
    endpoint: Option<String>,
    /// Depth levels to print per side.
    #[arg(long, default_value_t = 5)]
    depth: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = observability::init_tracing("polybook");
    observability::init_metrics();

    let mut cfg = match &cli.config {
        Some(path) => FeedConfig::from_toml_path(path).context("load config")?,
        None => FeedConfig::from_env(),
    };
    if let Some(endpoint) = cli.endpoint {
        cfg.endpoint = endpoint;
    }

    let sdk = OrderBookSdk::new(cfg);
    sdk.subscribe(&cli.tokens).await.context("subscribe")?;
    tracing::info!(tokens = cli.tokens.len(), "subscribed, waiting for books");

    let updates = sdk.updates();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                if update.kind == UpdateKind::Book {
                    tracing::info!(token = %update.token_id, ts = update.ts_ms, "snapshot applied");
                }
                print_top(&sdk, &update.token_id, cli.depth);
            }
        }
    }

    let stats = sdk.stats();
    tracing::info!(
        snapshots = stats.snapshots_applied,
        deltas = stats.deltas_applied,
        buffered = stats.deltas_buffered,
        dropped = stats.updates_dropped,
        parse_errors = stats.parse_errors,
        "ingestion totals"
    );
    sdk.close().await;
    Ok(())
}

fn print_top(sdk: &OrderBookSdk, token_id: &str, depth: usize) {
    let bbo = match sdk.bbo(token_id) {
        Ok(bbo) => bbo,
        Err(BookError::NotInitialized) => return,
        Err(err) => {
            tracing::warn!(token = token_id, error = %err, "read failed");
            return;
        }
    };

    let fmt_quote = |q: Option<core_types::BestQuote>| match q {
        Some(q) => format!("{} x {}", q.price, q.size),
        None => "-".to_string(),
    };
    let mid = sdk
        .mid_price(token_id)
        .map(|m| m.to_string())
        .unwrap_or_else(|_| "-".to_string());
    let spread = sdk
        .spread(token_id)
        .map(|s| s.to_string())
        .unwrap_or_else(|_| "-".to_string());

    println!(
        "{token_id}  bid {}  ask {}  mid {mid}  spread {spread}",
        fmt_quote(bbo.bid),
        fmt_quote(bbo.ask)
    );

    if let Ok((bids, asks)) = sdk.depth(token_id, depth) {
        for level in asks.iter().rev() {
            println!("    ask {:>10} x {}", level.price.to_string(), level.size);
        }
        for level in &bids {
            println!("    bid {:>10} x {}", level.price.to_string(), level.size);
        }
    }
}
