//! Demo for the Bitfinex websocket client
//!
//! Streams the ticker and one-minute candles of a symbol, plus wallet updates
//! when `BFX_API_KEY` / `BFX_API_SECRET` are set.
//! Run with: `cargo run --bin demo --features demo -- tBTCUSD 60`

use std::time::Duration;

use bitfinex_ws::websocket::{ConnectionEvent, WsClient, WsConfig};
use bitfinex_ws::{CandleInterval, Credentials, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SYMBOL: &str = "tBTCUSD";
const DEFAULT_SECONDS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo=info,bitfinex_ws=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let symbol = args.next().unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
    let seconds = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);

    let client = match Credentials::from_env() {
        Ok(credentials) => {
            tracing::info!("Using API key {}", credentials.api_key());
            WsClient::with_credentials(WsConfig::default(), credentials)
        }
        Err(e) => {
            tracing::info!("Public data only: {e}");
            WsClient::new(WsConfig::public())
        }
    };

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::AuthenticationFailed(reason) => {
                    tracing::warn!("Authentication failed: {reason}")
                }
                other => tracing::info!("Connection event: {other:?}"),
            }
        }
    });

    // Queued until connected
    client
        .subscribe_ticker(&symbol, |frame| tracing::info!("ticker {frame}"))
        .await?;
    client
        .subscribe_candles(&symbol, CandleInterval::OneMinute, |frame| {
            tracing::info!("candle {frame}")
        })
        .await?;
    client
        .subscribe_wallets(|frame| tracing::info!("wallet {frame}"))
        .await;

    client.start().await?;
    tracing::info!("Streaming {symbol} for {seconds}s");

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    client.close().await
}
