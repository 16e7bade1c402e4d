use chrono::{DateTime, Utc};

use crate::fixed_point::{Micros, PriceMicros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "enriched" => EnrichmentStatus::Enriched,
            "failed" => EnrichmentStatus::Failed,
            _ => EnrichmentStatus::Pending,
        }
    }
}

/// One row per decoded on-chain fill. Append-only, unique by
/// `(tx_hash, log_index)`.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub id: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub followed_user_id: String,
    pub profile_address: String,
    pub proxy_address: Option<String>,
    pub token_id: String,
    pub side: Side,
    pub price_micros: PriceMicros,
    pub share_micros: Micros,
    pub notional_micros: Micros,
    pub fee_micros: Micros,
    pub event_time: DateTime<Utc>,
    pub detect_time: DateTime<Utc>,
    pub enrichment_status: EnrichmentStatus,
    pub market_id: Option<String>,
    pub condition_id: Option<String>,
    pub asset_id: Option<String>,
}
