//! Settlement loop (C12): closes EXEC_GLOBAL positions on resolved
//! markets using per-share payouts, §4.12.
//!
//! Grounded directly on the `settlement_idempotent_across_two_runs`
//! test in [`crate::ledger::store`]: the two-row zero-out/credit shape
//! and its deterministic `refId`s are exactly what that test already
//! exercises against [`crate::ledger::LedgerStore::append_batch_if_absent`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fixed_point::{notional_micros, Micros};
use crate::ledger::{EntryType, LedgerEntry, LedgerStore, PortfolioScope};

/// Looks up the resolved per-share payout for a market's outcome token,
/// in micros (0 or 1_000_000 for a binary market). Returns `None` while
/// the market is still open. Same external-collaborator trait shape as
/// [`crate::trades::writer::BlockTimestampLookup`].
#[async_trait]
pub trait PayoutLookup: Send + Sync {
    async fn resolved_payout_per_share(&self, asset_id: &str) -> Option<Micros>;
}

/// Default: never resolves anything. Keeps the loop a safe no-op with
/// no settlement service configured, rather than requiring one to boot.
pub struct NullPayoutLookup;

#[async_trait]
impl PayoutLookup for NullPayoutLookup {
    async fn resolved_payout_per_share(&self, _asset_id: &str) -> Option<Micros> {
        None
    }
}

/// HTTP-backed payout lookup against a settlement/metadata service.
/// Same `reqwest::Client` + JSON body shape as the chain scrapers.
pub struct HttpPayoutLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPayoutLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with a timeout-only config"),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct PayoutResponse {
    resolved: bool,
    payout_per_share_micros: Option<i64>,
}

#[async_trait]
impl PayoutLookup for HttpPayoutLookup {
    async fn resolved_payout_per_share(&self, asset_id: &str) -> Option<Micros> {
        let url = format!("{}/payouts/{}", self.base_url, asset_id);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: PayoutResponse = resp.json().await.ok()?;
        if body.resolved {
            body.payout_per_share_micros
        } else {
            None
        }
    }
}

fn zero_out_ref_id(asset_id: &str) -> String {
    format!("settle:{asset_id}:zero")
}

fn credit_ref_id(asset_id: &str) -> String {
    format!("settle:{asset_id}:credit")
}

/// Settlement loop: every 2 minutes, enumerates open EXEC_GLOBAL
/// positions, fetches the resolved payout for each, and writes the
/// idempotent settlement rows for any that have resolved.
pub async fn run_settlement_loop<P: PayoutLookup>(
    ledger: LedgerStore,
    payouts: Arc<P>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(120));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = settlement_tick(&ledger, payouts.as_ref()).await {
                    warn!(error = %e, "settlement tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn settlement_tick<P: PayoutLookup>(ledger: &LedgerStore, payouts: &P) -> Result<()> {
    let assets = ledger.assets_with_open_position(PortfolioScope::ExecGlobal, None).await?;
    for asset_id in assets {
        let Some(payout_per_share) = payouts.resolved_payout_per_share(&asset_id).await else {
            continue;
        };
        settle_asset(ledger, &asset_id, payout_per_share).await?;
    }
    Ok(())
}

async fn settle_asset(ledger: &LedgerStore, asset_id: &str, payout_per_share_micros: Micros) -> Result<()> {
    let current_shares = ledger.position(PortfolioScope::ExecGlobal, None, asset_id).await?;
    if current_shares == 0 {
        return Ok(());
    }

    let now = Utc::now();
    let mut entries = vec![LedgerEntry {
        id: Uuid::new_v4().to_string(),
        scope: PortfolioScope::ExecGlobal,
        followed_user_id: None,
        market_id: None,
        asset_id: Some(asset_id.to_string()),
        entry_type: EntryType::Settlement,
        share_delta_micros: -current_shares,
        cash_delta_micros: 0,
        price_micros: None,
        ref_id: zero_out_ref_id(asset_id),
        created_at: now,
    }];

    let credit = notional_micros(current_shares, payout_per_share_micros as i32);
    if credit != 0 {
        entries.push(LedgerEntry {
            id: Uuid::new_v4().to_string(),
            scope: PortfolioScope::ExecGlobal,
            followed_user_id: None,
            market_id: None,
            asset_id: Some(asset_id.to_string()),
            entry_type: EntryType::Settlement,
            share_delta_micros: 0,
            cash_delta_micros: credit,
            price_micros: None,
            ref_id: credit_ref_id(asset_id),
            created_at: now,
        });
    }

    let written = ledger.append_batch_if_absent(&entries).await?;
    debug!(asset_id, written, "settlement rows written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPayout(Micros);

    #[async_trait]
    impl PayoutLookup for FixedPayout {
        async fn resolved_payout_per_share(&self, _asset_id: &str) -> Option<Micros> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn settles_open_position_and_is_idempotent_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        ledger
            .append_if_absent(&LedgerEntry {
                id: Uuid::new_v4().to_string(),
                scope: PortfolioScope::ExecGlobal,
                followed_user_id: None,
                market_id: Some("m1".to_string()),
                asset_id: Some("a1".to_string()),
                entry_type: EntryType::TradeBuy,
                share_delta_micros: 100_000_000,
                cash_delta_micros: -60_000_000,
                price_micros: None,
                ref_id: "open".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let payouts = FixedPayout(1_000_000);
        settlement_tick(&ledger, &payouts).await.unwrap();
        assert_eq!(ledger.position(PortfolioScope::ExecGlobal, None, "a1").await.unwrap(), 0);
        let cash_after_first = ledger.cash(PortfolioScope::ExecGlobal, None).await.unwrap();

        settlement_tick(&ledger, &payouts).await.unwrap();
        assert_eq!(ledger.cash(PortfolioScope::ExecGlobal, None).await.unwrap(), cash_after_first);
    }

    #[tokio::test]
    async fn zero_payout_omits_credit_row() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        ledger
            .append_if_absent(&LedgerEntry {
                id: Uuid::new_v4().to_string(),
                scope: PortfolioScope::ExecGlobal,
                followed_user_id: None,
                market_id: Some("m1".to_string()),
                asset_id: Some("a2".to_string()),
                entry_type: EntryType::TradeBuy,
                share_delta_micros: 50_000_000,
                cash_delta_micros: -10_000_000,
                price_micros: None,
                ref_id: "open2".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let payouts = FixedPayout(0);
        settlement_tick(&ledger, &payouts).await.unwrap();
        assert_eq!(ledger.position(PortfolioScope::ExecGlobal, None, "a2").await.unwrap(), 0);
        assert_eq!(ledger.cash(PortfolioScope::ExecGlobal, None).await.unwrap(), -10_000_000);
    }
}
