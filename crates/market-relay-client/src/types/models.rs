/*
[INPUT]:  Dashboard backend market snapshot schema (Binance 24h ticker fields)
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - REST snapshot types used when the relay is unavailable
[UPDATE]: When the backend snapshot schema changes
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 24h market snapshot for one trading pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price_change_percent: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub high_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub low_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub volume: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub quote_volume: Option<Decimal>,
}
