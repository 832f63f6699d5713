/*
[INPUT]:  Dashboard backend base URL (first CLI argument)
[OUTPUT]: 24h market snapshots
[POS]:    Examples - REST snapshot queries
[UPDATE]: When adding new market data endpoints
*/

use market_relay_client::*;

/// Example: query market snapshots (used when the relay is unavailable)
#[tokio::main]
async fn main() {
    println!("=== Market Snapshot Example ===\n");

    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:3000".to_string());

    let client = match MarketsClient::with_config(ClientConfig::default(), &base_url) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create client: {}", e);
            return;
        }
    };

    println!("Querying all markets...");
    match client.get_markets().await {
        Ok(markets) => {
            for market in markets {
                println!(
                    "  {:<10} {:>14} {:>8}%",
                    market.symbol,
                    market.last_price,
                    market
                        .price_change_percent
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        Err(e) => println!("✗ Error: {}", e),
    }

    println!("\nQuerying BTCUSDT...");
    match client.get_market("BTCUSDT").await {
        Ok(market) => println!("✓ {:?}", market),
        Err(e) => println!("✗ Error: {}", e),
    }

    println!("\n✓ Market snapshot example complete");
}
