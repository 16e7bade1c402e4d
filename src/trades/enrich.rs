//! Token metadata enrichment: resolves a raw CLOB `token_id` into the
//! `(market_id, condition_id, asset_id)` triple a [`super::TradeEvent`]
//! needs before it can be grouped per market or exposure-capped per
//! §4.8 step 8. Runs off the ingest-post-processing durable queue so a
//! slow or flaky metadata service never blocks the hot fill -> group
//! path.
//!
//! Grounded on the external-collaborator trait shape already used for
//! [`super::writer::BlockTimestampLookup`] and
//! [`super::reconcile::UserTradeHistoryApi`]: a thin `async_trait`
//! seam plus a `Null...` default that keeps the pipeline usable with no
//! metadata service configured.

use async_trait::async_trait;

/// Resolved metadata for one outcome token.
#[derive(Debug, Clone)]
pub struct EnrichedTokenMetadata {
    pub market_id: Option<String>,
    pub condition_id: Option<String>,
    pub asset_id: String,
}

#[async_trait]
pub trait TokenMetadataEnricher: Send + Sync {
    async fn enrich(&self, token_id: &str) -> Option<EnrichedTokenMetadata>;
}

/// Fallback enricher: treats the token id itself as the asset id and
/// leaves market/condition unresolved. Used when no metadata service is
/// configured -- exposure caps keyed on `marketId` simply won't fire for
/// unenriched trades, which is a degraded mode, not a crash.
pub struct NullTokenMetadataEnricher;

#[async_trait]
impl TokenMetadataEnricher for NullTokenMetadataEnricher {
    async fn enrich(&self, token_id: &str) -> Option<EnrichedTokenMetadata> {
        Some(EnrichedTokenMetadata {
            market_id: None,
            condition_id: None,
            asset_id: token_id.to_string(),
        })
    }
}

/// HTTP-backed enricher against Polymarket's Gamma markets API, keyed by
/// CLOB token id. Same `reqwest::Client` + `anyhow::Context` shape as
/// the chain scrapers' JSON-RPC calls.
pub struct HttpTokenMetadataEnricher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenMetadataEnricher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with a timeout-only config"),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct GammaTokenLookupResponse {
    market_id: Option<String>,
    condition_id: Option<String>,
}

#[async_trait]
impl TokenMetadataEnricher for HttpTokenMetadataEnricher {
    async fn enrich(&self, token_id: &str) -> Option<EnrichedTokenMetadata> {
        let url = format!("{}/tokens/{}", self.base_url, token_id);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: GammaTokenLookupResponse = resp.json().await.ok()?;
        Some(EnrichedTokenMetadata {
            market_id: body.market_id,
            condition_id: body.condition_id,
            asset_id: token_id.to_string(),
        })
    }
}

/// Durable-queue payload for one enrichment job: identifies the trade
/// event row to enrich and re-insert rather than carrying the full
/// event, so the job stays small and the latest row state always wins.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnrichmentJob {
    pub trade_event_id: String,
    pub token_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_enricher_falls_back_to_token_id_as_asset() {
        let enricher = NullTokenMetadataEnricher;
        let resolved = enricher.enrich("12345").await.unwrap();
        assert_eq!(resolved.asset_id, "12345");
        assert!(resolved.market_id.is_none());
    }
}
