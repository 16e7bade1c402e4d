//! Reconcile safety net (C6): periodic and reconnect-triggered catch-up
//! ingest via a secondary trade API. Must never be the primary detector
//! -- its write rate should stay at zero in steady state since C4/C5
//! already cover every fill.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use super::model::{EnrichmentStatus, Side, TradeEvent};
use super::store::TradeEventStore;
use crate::followed_user::FollowedUserStore;

/// The venue's per-user, time-paginated trade history API. External
/// collaborator; swappable for tests.
#[async_trait]
pub trait UserTradeHistoryApi: Send + Sync {
    async fn fetch_since(
        &self,
        profile_address: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<UserTradePage>;
}

pub struct UserTradePage {
    pub events: Vec<TradeEvent>,
    pub next_cursor: Option<String>,
}

/// HTTP-backed secondary trade API (§6 "Trade REST"), same
/// `reqwest::Client` + JSON shape as [`super::enrich::HttpTokenMetadataEnricher`]
/// and [`crate::settlement::HttpPayoutLookup`]. Per-user, time-paginated,
/// cursor-driven per spec §4.6.
pub struct HttpUserTradeHistoryApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserTradeHistoryApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a timeout-only config"),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct WireTrade {
    tx_hash: String,
    log_index: i64,
    proxy_address: Option<String>,
    token_id: String,
    side: String,
    price_micros: i32,
    share_micros: i64,
    notional_micros: i64,
    fee_micros: i64,
    event_time_ms: i64,
}

#[derive(serde::Deserialize)]
struct WireTradePage {
    trades: Vec<WireTrade>,
    next_cursor: Option<String>,
}

#[async_trait]
impl UserTradeHistoryApi for HttpUserTradeHistoryApi {
    async fn fetch_since(
        &self,
        profile_address: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<UserTradePage> {
        let mut req = self
            .client
            .get(format!("{}/users/{}/trades", self.base_url, profile_address))
            .query(&[("since", since.timestamp_millis().to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let body: WireTradePage = req.send().await?.error_for_status()?.json().await?;
        let events = body
            .trades
            .into_iter()
            .filter_map(|t| {
                Some(TradeEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    tx_hash: t.tx_hash,
                    log_index: t.log_index,
                    followed_user_id: String::new(),
                    profile_address: profile_address.to_string(),
                    proxy_address: t.proxy_address,
                    token_id: t.token_id,
                    side: Side::parse(&t.side)?,
                    price_micros: t.price_micros,
                    share_micros: t.share_micros,
                    notional_micros: t.notional_micros,
                    fee_micros: t.fee_micros,
                    event_time: DateTime::from_timestamp_millis(t.event_time_ms)?,
                    detect_time: Utc::now(),
                    enrichment_status: EnrichmentStatus::Pending,
                    market_id: None,
                    condition_id: None,
                    asset_id: None,
                })
            })
            .collect();
        Ok(UserTradePage { events, next_cursor: body.next_cursor })
    }
}

/// No-op reconcile source for deployments with no secondary trade API
/// configured. `fetch_since` always returns an empty page, so
/// `ReconcileWorker::backfill` is a cheap no-op loop -- same stand-in
/// role as [`super::enrich::NullTokenMetadataEnricher`] and
/// [`crate::settlement::NullPayoutLookup`].
pub struct NullUserTradeHistoryApi;

#[async_trait]
impl UserTradeHistoryApi for NullUserTradeHistoryApi {
    async fn fetch_since(
        &self,
        _profile_address: &str,
        _since: DateTime<Utc>,
        _cursor: Option<&str>,
    ) -> Result<UserTradePage> {
        Ok(UserTradePage { events: Vec::new(), next_cursor: None })
    }
}

pub struct ReconcileWorker<A: UserTradeHistoryApi> {
    store: TradeEventStore,
    users: FollowedUserStore,
    api: A,
    periodic_interval: Duration,
    periodic_window_minutes: i64,
}

impl<A: UserTradeHistoryApi> ReconcileWorker<A> {
    pub fn new(store: TradeEventStore, users: FollowedUserStore, api: A) -> Self {
        Self {
            store,
            users,
            api,
            periodic_interval: Duration::from_secs(120),
            periodic_window_minutes: 3,
        }
    }

    /// Runs the periodic-cadence trigger forever; the reconnect trigger
    /// is driven separately via `reconcile_rx` fed by C4.
    pub async fn run(
        self,
        mut reconcile_rx: mpsc::Receiver<crate::chain::fill_subscriber::ReconcileRequest>,
        grouper_tx: mpsc::Sender<TradeEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = interval(self.periodic_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.backfill(self.periodic_window_minutes, &grouper_tx).await;
                }
                req = reconcile_rx.recv() => {
                    match req {
                        Some(req) => self.backfill(req.since_minutes, &grouper_tx).await,
                        None => return,
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

    async fn backfill(&self, window_minutes: i64, grouper_tx: &mpsc::Sender<TradeEvent>) {
        let since = Utc::now() - chrono::Duration::minutes(window_minutes);
        let users = match self.users.list_enabled().await {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "reconcile: failed to list followed users");
                return;
            }
        };
        for user in users {
            let mut cursor: Option<String> = None;
            loop {
                let page = match self.api.fetch_since(&user.profile_address, since, cursor.as_deref()).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(user = %user.id, error = %e, "reconcile fetch failed");
                        break;
                    }
                };
                for mut event in page.events {
                    event.followed_user_id = user.id.clone();
                    match self.store.insert_if_absent(&event).await {
                        Ok(true) => {
                            info!(user = %user.id, tx = %event.tx_hash, "reconcile recovered a missed fill");
                            let _ = grouper_tx.send(event).await;
                        }
                        Ok(false) => {}
                        Err(e) => debug!(error = %e, "reconcile insert failed"),
                    }
                }
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
    }
}
