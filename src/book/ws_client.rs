//! Book WS client (C3): drives the [`super::cache::BookCache`] from an
//! upstream order-book feed, with reconnect + full resubscribe.
//!
//! Grounded on `scrapers/polymarket_ws.rs`'s single-connection,
//! command-channel design, generalized to consume `Subscribe`/
//! `Unsubscribe` events from the cache's event bus instead of a bespoke
//! `WsCommand` enum, and to normalize into integer-micros deltas/
//! snapshots rather than `f64`.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::book::cache::{BookCache, CacheEvent};
use crate::book::{BookSource, RawLevel};
use crate::fixed_point::price_to_micros;
use crate::health::ConnectionFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct BookWsConfig {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for BookWsConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            ping_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    #[serde(deserialize_with = "de_micros")]
    price: i64,
    #[serde(deserialize_with = "de_micros")]
    size: i64,
}

fn de_micros<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    let s = match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => return Ok(0),
    };
    Ok(price_to_micros(&s) as i64)
}

#[derive(Debug, Deserialize)]
struct WireBookMsg {
    event_type: String,
    asset_id: String,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

/// Drives the shared [`BookCache`] from the upstream feed. Call [`run`]
/// inside a `tokio::spawn`; it loops forever until cancelled.
pub struct BookWsClient {
    cache: BookCache,
    config: BookWsConfig,
    status: ConnectionFlag,
}

impl BookWsClient {
    pub fn new(cache: BookCache, config: BookWsConfig) -> Self {
        Self { cache, config, status: ConnectionFlag::new() }
    }

    /// Shares a [`ConnectionFlag`] the health endpoint reads, instead of
    /// the client's own private one.
    pub fn with_status(mut self, status: ConnectionFlag) -> Self {
        self.status = status;
        self
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut cache_events = self.cache.events();
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut state = ConnectionState::Disconnected;
        let mut reconnect_delay = self.config.reconnect_base_delay;

        loop {
            if *shutdown.borrow() {
                info!("book ws client shutting down");
                return;
            }

            // Drain any subscribe/unsubscribe requests that arrived while
            // disconnected so the next connection attempt resubscribes
            // everything currently wanted.
            drain_cache_events(&mut cache_events, &mut subscribed);

            state = ConnectionState::Connecting;
            match self
                .connect_and_stream(&mut cache_events, &mut subscribed, &mut shutdown)
                .await
            {
                Ok(()) => {
                    reconnect_delay = self.config.reconnect_base_delay;
                }
                Err(e) => {
                    warn!(error = %e, "book ws disconnected; reconnecting");
                }
            }
            state = ConnectionState::Disconnected;
            self.status.set_connected(false);
            debug!(?state, "book ws state");

            if *shutdown.borrow() {
                return;
            }
            let jitter = rand::thread_rng().gen_range(0..250);
            sleep(reconnect_delay + Duration::from_millis(jitter)).await;
            reconnect_delay = (reconnect_delay * 2).min(self.config.reconnect_max_delay);
        }
    }

    async fn connect_and_stream(
        &self,
        cache_events: &mut broadcast::Receiver<CacheEvent>,
        subscribed: &mut HashSet<String>,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let (ws_stream, _resp) = connect_async(&self.config.ws_url)
            .await
            .context("connect book ws")?;
        info!(url = %self.config.ws_url, "book ws connected");

        let (mut write, mut read) = ws_stream.split();

        // Resubscribe every currently-subscribed token exactly, preserving
        // the subscription set across reconnects per §4.3.
        if !subscribed.is_empty() {
            let assets: Vec<&String> = subscribed.iter().collect();
            let sub_msg = serde_json::json!({ "type": "market", "assets_ids": assets });
            write
                .send(Message::Text(sub_msg.to_string()))
                .await
                .context("send resubscribe")?;
        }

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                evt = cache_events.recv() => {
                    match evt {
                        Ok(CacheEvent::Subscribe { token_id }) => {
                            if subscribed.insert(token_id.clone()) {
                                let msg = serde_json::json!({
                                    "assets_ids": [token_id],
                                    "operation": "subscribe",
                                });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                            }
                        }
                        Ok(CacheEvent::Unsubscribe { token_id }) => {
                            if subscribed.remove(&token_id) {
                                let msg = serde_json::json!({
                                    "assets_ids": [token_id],
                                    "operation": "unsubscribe",
                                });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "book cache event bus lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow::anyhow!("book ws stream ended"));
                    };
                    match msg {
                        Ok(Message::Text(text)) => self.handle_text(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "book ws close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow::anyhow!("book ws error: {e}")),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        if text.eq_ignore_ascii_case("PONG") {
            return;
        }
        let json: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let event_type = json.get("event_type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "book" => {
                let msg: WireBookMsg = match serde_json::from_value(json) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "failed to parse book snapshot");
                        return;
                    }
                };
                let bids: Vec<RawLevel> = msg
                    .bids
                    .iter()
                    .map(|l| RawLevel { price_micros: l.price, size_micros: l.size })
                    .collect();
                let asks: Vec<RawLevel> = msg
                    .asks
                    .iter()
                    .map(|l| RawLevel { price_micros: l.price, size_micros: l.size })
                    .collect();
                self.cache.apply_snapshot(&msg.asset_id, &bids, &asks, BookSource::Ws);
            }
            "price_change" => {
                let msg: WireBookMsg = match serde_json::from_value(json) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "failed to parse price_change delta");
                        return;
                    }
                };
                let (Some(price), Some(side), Some(size)) = (msg.price, msg.side, msg.size) else {
                    return;
                };
                let is_bid = side.eq_ignore_ascii_case("buy");
                let price_micros = price_to_micros(&price) as i64;
                let size_shares = crate::fixed_point::shares_to_micros(&size);
                self.cache
                    .apply_delta(&msg.asset_id, is_bid, price_micros, size_shares, BookSource::Ws);
            }
            _ => {}
        }
    }
}

fn drain_cache_events(rx: &mut broadcast::Receiver<CacheEvent>, subscribed: &mut HashSet<String>) {
    loop {
        match rx.try_recv() {
            Ok(CacheEvent::Subscribe { token_id }) => {
                subscribed.insert(token_id);
            }
            Ok(CacheEvent::Unsubscribe { token_id }) => {
                subscribed.remove(&token_id);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}
