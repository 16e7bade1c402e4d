//! Fill subscriber (C4): raw `eth_subscribe("logs", ...)` over a plain
//! WebSocket, filtered to the CTF exchange addresses and the
//! `OrderFilled` topic, further filtered to tracked wallets on the
//! maker/taker topics.
//!
//! Grounded on the reconnect loop shape in
//! `thesSmartApe-polymarket-copy-trading-bot-rust`'s `run_ws_loop`, and
//! on `scrapers/polymarket_ws.rs` for the backoff/resubscribe pattern
//! the teacher uses elsewhere. State machine per spec §4.4: Starting ->
//! Live -> Disconnected -> (reconnect) -> Backfilling -> Live.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::decode::{decode_order_filled, RawLog};
use super::{address_to_topic, DecodedFill, EXCHANGE_ADDR_LEGACY, EXCHANGE_ADDR_NEG_RISK, ORDER_FILLED_TOPIC};
use crate::health::ConnectionFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Starting,
    Live,
    Disconnected,
    Backfilling,
}

#[derive(Debug, Clone)]
pub struct FillSubscriberConfig {
    pub ws_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub backfill_minutes: i64,
}

impl Default for FillSubscriberConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            backfill_minutes: 5,
        }
    }
}

/// Durable checkpoint of the last fully-processed block, persisted by the
/// fill subscriber so a restart resumes instead of re-scanning from
/// genesis. Implemented by [`crate::checkpoint::CheckpointStore`].
#[async_trait]
pub trait ChainCheckpointStore: Send + Sync {
    async fn last_block(&self) -> Result<Option<u64>>;
    async fn set_last_block(&self, block: u64) -> Result<()>;
}

/// A reconcile job emitted on reconnect, to be enqueued on the reconcile
/// queue (C13) by the caller.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub since_minutes: i64,
}

pub struct FillSubscriber<C: ChainCheckpointStore> {
    config: FillSubscriberConfig,
    checkpoint: C,
    tracked_wallets: Vec<String>,
    status: ConnectionFlag,
}

impl<C: ChainCheckpointStore> FillSubscriber<C> {
    pub fn new(config: FillSubscriberConfig, checkpoint: C, tracked_wallets: Vec<String>) -> Self {
        Self { config, checkpoint, tracked_wallets, status: ConnectionFlag::new() }
    }

    /// Shares a [`ConnectionFlag`] the health endpoint reads, instead of
    /// the subscriber's own private one -- same pattern as
    /// [`crate::book::ws_client::BookWsClient::with_status`].
    pub fn with_status(mut self, status: ConnectionFlag) -> Self {
        self.status = status;
        self
    }

    /// Runs forever, pushing decoded fills onto `fills_tx` and reconcile
    /// requests onto `reconcile_tx` (one per reconnect). Call inside a
    /// `tokio::spawn`.
    pub async fn run(
        self,
        fills_tx: mpsc::Sender<DecodedFill>,
        reconcile_tx: mpsc::Sender<ReconcileRequest>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut state = SubscriberState::Starting;
        let mut reconnect_delay = self.config.reconnect_base_delay;
        let mut first_connect = true;

        loop {
            if *shutdown.borrow() {
                info!("fill subscriber shutting down");
                return;
            }

            if !first_connect {
                state = SubscriberState::Backfilling;
                let _ = reconcile_tx
                    .send(ReconcileRequest { since_minutes: self.config.backfill_minutes })
                    .await;
                debug!(?state, "emitted reconcile backfill request on reconnect");
            }

            match self.connect_and_stream(&fills_tx, &mut shutdown).await {
                Ok(()) => {
                    reconnect_delay = self.config.reconnect_base_delay;
                }
                Err(e) => {
                    warn!(error = %e, "fill subscriber disconnected; reconnecting");
                }
            }
            state = SubscriberState::Disconnected;
            self.status.set_connected(false);
            first_connect = false;
            debug!(?state, "fill subscriber state");

            if *shutdown.borrow() {
                return;
            }
            let jitter = rand::thread_rng().gen_range(0..250);
            sleep(reconnect_delay + Duration::from_millis(jitter)).await;
            reconnect_delay = (reconnect_delay * 2).min(self.config.reconnect_max_delay);
        }
    }

    fn subscribe_payload(&self) -> String {
        let maker_taker_topics: Vec<String> =
            self.tracked_wallets.iter().map(|w| address_to_topic(w)).collect();
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": [EXCHANGE_ADDR_LEGACY, EXCHANGE_ADDR_NEG_RISK],
                "topics": [ORDER_FILLED_TOPIC, Value::Null, maker_taker_topics, maker_taker_topics_dup(&maker_taker_topics)],
            }],
        })
        .to_string()
    }

    async fn connect_and_stream(
        &self,
        fills_tx: &mpsc::Sender<DecodedFill>,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let (ws_stream, _resp) = connect_async(&self.config.ws_url)
            .await
            .context("connect fill subscription ws")?;
        info!(url = %self.config.ws_url, "fill subscriber connected");
        self.status.set_connected(true);

        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(self.subscribe_payload()))
            .await
            .context("send eth_subscribe")?;

        let tracked: HashSet<String> =
            self.tracked_wallets.iter().map(|w| w.to_lowercase()).collect();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                msg = tokio::time::timeout(Duration::from_secs(30), read.next()) => {
                    let msg = msg.context("fill ws idle timeout")?;
                    let Some(msg) = msg else {
                        return Err(anyhow::anyhow!("fill ws stream ended"));
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(log) = parse_log_notification(&text) {
                                if !log_touches_tracked_wallet(&log, &tracked) {
                                    continue;
                                }
                                if let Some(fill) = decode_order_filled(&log) {
                                    self.checkpoint.set_last_block(fill.block_number).await.ok();
                                    if fills_tx.send(fill).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "fill ws close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow::anyhow!("fill ws error: {e}")),
                    }
                }
            }
        }
    }
}

fn maker_taker_topics_dup(topics: &[String]) -> Vec<String> {
    topics.to_vec()
}

fn log_touches_tracked_wallet(log: &RawLog, tracked: &HashSet<String>) -> bool {
    if tracked.is_empty() {
        return true;
    }
    log.topics
        .iter()
        .skip(2)
        .take(2)
        .filter_map(|t| {
            let clean = t.trim_start_matches("0x");
            clean.get(clean.len().saturating_sub(40)..).map(|s| format!("0x{}", s.to_lowercase()))
        })
        .any(|addr| tracked.contains(&addr))
}

fn parse_log_notification(text: &str) -> Option<RawLog> {
    let value: Value = serde_json::from_str(text).ok()?;
    let result = value.get("params")?.get("result")?;

    let topics: Vec<String> = result
        .get("topics")?
        .as_array()?
        .iter()
        .filter_map(|t| t.as_str().map(|s| s.to_string()))
        .collect();
    let data = result.get("data")?.as_str()?.to_string();
    let address = result.get("address")?.as_str()?.to_string();
    let removed = result.get("removed").and_then(|v| v.as_bool()).unwrap_or(false);
    let block_number = result
        .get("blockNumber")?
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())?;
    let tx_hash = result.get("transactionHash")?.as_str()?.to_string();
    let log_index = result
        .get("logIndex")?
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())?;

    Some(RawLog { address, topics, data, block_number, tx_hash, log_index, removed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_to_topic_zero_pads_to_32_bytes() {
        let topic = address_to_topic("0x1111111111111111111111111111111111111111".trim_end_matches('1'));
        assert!(topic.starts_with("0x"));
        assert_eq!(topic.len(), 66);
    }

    #[test]
    fn log_touches_tracked_wallet_matches_maker_or_taker_topic() {
        let mut tracked = HashSet::new();
        tracked.insert("0xabc0000000000000000000000000000000000a".to_string());
        let log = RawLog {
            address: String::new(),
            topics: vec![
                "0x0".to_string(),
                "0x0".to_string(),
                address_to_topic("0xabc0000000000000000000000000000000000a"),
                "0x0".to_string(),
            ],
            data: String::new(),
            block_number: 1,
            tx_hash: String::new(),
            log_index: 0,
            removed: false,
        };
        assert!(log_touches_tracked_wallet(&log, &tracked));
    }
}
