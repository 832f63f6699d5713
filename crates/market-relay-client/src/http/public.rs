/*
[INPUT]:  Symbol identifiers
[OUTPUT]: Market snapshots (24h ticker) from the dashboard backend
[POS]:    HTTP layer - public market endpoints (no auth required)
[UPDATE]: When adding new public endpoints or changing response format
*/

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;
use crate::http::MarketsClient;
use crate::types::MarketSnapshot;

/// Source of market snapshots used to seed views while no live stream is available
#[async_trait]
pub trait MarketSnapshotSource: Send + Sync {
    async fn get_markets(&self) -> Result<Vec<MarketSnapshot>>;

    async fn get_market(&self, symbol: &str) -> Result<MarketSnapshot>;
}

#[async_trait]
impl MarketSnapshotSource for MarketsClient {
    /// GET /api/markets
    async fn get_markets(&self) -> Result<Vec<MarketSnapshot>> {
        let builder = self.request(Method::GET, "/api/markets")?;
        self.send_json(builder).await
    }

    /// GET /api/markets/{symbol}
    async fn get_market(&self, symbol: &str) -> Result<MarketSnapshot> {
        let endpoint = format!("/api/markets/{}", symbol);
        let builder = self.request(Method::GET, &endpoint)?;
        self.send_json(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::http::ClientConfig;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> MarketsClient {
        MarketsClient::with_config(ClientConfig::default(), &server.uri()).expect("client init")
    }

    #[tokio::test]
    async fn test_get_markets() {
        let server = MockServer::start().await;
        let mock_response = r#"[
            {"symbol": "BTCUSDT", "lastPrice": "64000.5", "priceChangePercent": "2.10", "volume": "900.1"},
            {"symbol": "ETHUSDT", "lastPrice": "2500", "priceChangePercent": "-0.50"}
        ]"#;

        Mock::given(method("GET"))
            .and(path("/api/markets"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(mock_response, "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let markets = client_for(&server).get_markets().await.expect("get_markets failed");

        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].symbol, "BTCUSDT");
        assert_eq!(markets[0].last_price, Decimal::from_str("64000.5").unwrap());
        assert_eq!(markets[1].volume, None);
    }

    #[tokio::test]
    async fn test_get_market_by_symbol() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/markets/SOLUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "SOLUSDT",
                "lastPrice": "150.25",
                "highPrice": "155.00",
                "lowPrice": "140.00"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let market = client_for(&server).get_market("SOLUSDT").await.expect("get_market failed");
        assert_eq!(market.high_price, Some(Decimal::from_str("155.00").unwrap()));
    }

    #[tokio::test]
    async fn test_backend_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/markets"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        match client_for(&server).get_markets().await {
            Err(RelayError::Api { code, message }) => {
                assert_eq!(code, 502);
                assert_eq!(message, "upstream unavailable");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
