/*
[INPUT]:  Relay WebSocket URL (first CLI argument)
[OUTPUT]: Live trade and candle updates printed to stdout
[POS]:    Examples - relay stream handling
[UPDATE]: When the relay client API changes
*/

use market_relay_client::*;
use tokio::time::{Duration, sleep};

/// Example: stream BTCUSDT trades and 1m candles from a running relay
#[tokio::main]
async fn main() {
    println!("=== Market Relay WebSocket Example ===\n");

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8090".to_string());

    let hooks = ConnectionHooks::new()
        .on_connect(|| println!("✓ connected"))
        .on_disconnect(|| println!("✗ connection lost, reconnecting"))
        .on_fatal(|err| eprintln!("✗ giving up: {}", err));
    let client = RelayClient::with_hooks(RelayConfig::default(), hooks);

    if let Err(e) = client.connect(&url).await {
        eprintln!("Failed to connect to {}: {}", url, e);
        return;
    }

    let trades = client
        .subscribe(Channel::Trade, "BTCUSDT", None, |data| {
            println!("trade  {}", data);
        })
        .await;
    if let Err(e) = trades {
        eprintln!("Failed to subscribe trades: {}", e);
    }

    match client.subscribe_stream(Channel::Candle, "BTCUSDT", Some("1m")).await {
        Ok(mut candles) => {
            tokio::spawn(async move {
                while let Some(candle) = candles.recv().await {
                    println!("candle {}", candle);
                }
            });
        }
        Err(e) => eprintln!("Failed to subscribe candles: {}", e),
    }

    println!("\nStreaming for 30 seconds...");
    sleep(Duration::from_secs(30)).await;

    client.disconnect().await;
    println!("\n✓ WebSocket example complete");
}
