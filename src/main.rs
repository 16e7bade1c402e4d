//! Copy-trade engine worker binary.
//!
//! Owns wiring only: reads configuration from the environment, opens the
//! durable stores, spawns every loop in spec §2's data flow (C2-C14),
//! serves the health endpoint, and drives graceful shutdown per §5.
//! Everything else lives in `copytrade_engine`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use copytrade_engine::book::cache::{BookCache, BookCacheConfig};
use copytrade_engine::book::ws_client::{BookWsClient, BookWsConfig};
use copytrade_engine::buffer::SmallTradeBuffer;
use copytrade_engine::chain::fill_subscriber::{FillSubscriber, FillSubscriberConfig};
use copytrade_engine::checkpoint::CheckpointStore;
use copytrade_engine::config::ConfigStore;
use copytrade_engine::decision::attempt::CopyAttemptStore;
use copytrade_engine::decision::engine::{CopyDecisionEngine, NullMarketMetadata};
use copytrade_engine::decision::job::CopyAttemptJob;
use copytrade_engine::decision::router::GroupRouter;
use copytrade_engine::followed_user::FollowedUserStore;
use copytrade_engine::health::{ConnectionFlag, HealthState, LastEventClock, LatencyTracker};
use copytrade_engine::ledger::LedgerStore;
use copytrade_engine::queue::{run_consumer, DurableQueue};
use copytrade_engine::settlement::{run_settlement_loop, NullPayoutLookup};
use copytrade_engine::snapshot::{
    run_portfolio_snapshot_loop, run_price_snapshot_loop, MarketPriceSnapshotStore, PortfolioSnapshotStore,
};
use copytrade_engine::trades::enrich::{EnrichmentJob, NullTokenMetadataEnricher, TokenMetadataEnricher};
use copytrade_engine::trades::grouper::{EventGrouper, EventGrouperConfig};
use copytrade_engine::trades::reconcile::{NullUserTradeHistoryApi, ReconcileWorker};
use copytrade_engine::trades::store::TradeEventStore;
use copytrade_engine::trades::writer::{NullBlockTimestampLookup, TradeWriter};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    info!("copy-trade engine starting up");

    let db_path = env_or("DB_PATH", "copytrade.db");
    let book_ws_url = env::var("BOOK_WS_URL")
        .context("BOOK_WS_URL is required (upstream order-book feed)")?;
    let fill_ws_url = env::var("FILL_WS_URL")
        .context("FILL_WS_URL is required (on-chain log subscription endpoint)")?;
    let worker_port: u16 = env_u64("WORKER_PORT", 8080) as u16;
    let initial_bankroll_micros: i64 = env_i64("INITIAL_BANKROLL_MICROS", 100_000_000_000);

    // --- durable stores (C10, C14, C4/C6 checkpoints, C13 queues) -------
    let checkpoint_store =
        CheckpointStore::new(&db_path).context("open checkpoint store")?;
    let config_store = ConfigStore::new(&db_path).context("open config store")?;
    let trade_store = TradeEventStore::new(&db_path).context("open trade event store")?;
    let users_store = FollowedUserStore::new(&db_path).context("open followed user store")?;
    let ledger = LedgerStore::new(&db_path).context("open ledger store")?;
    let attempts_store = CopyAttemptStore::new(&db_path).context("open copy attempt store")?;
    let price_snapshot_store =
        MarketPriceSnapshotStore::new(&db_path).context("open price snapshot store")?;
    let portfolio_snapshot_store =
        PortfolioSnapshotStore::new(&db_path).context("open portfolio snapshot store")?;

    let copy_attempt_queue: Arc<DurableQueue<CopyAttemptJob>> =
        Arc::new(DurableQueue::new(&db_path, "copy_attempt_queue").context("open copy-attempt queue")?);
    let ingest_queue: Arc<DurableQueue<EnrichmentJob>> =
        Arc::new(DurableQueue::new(&db_path, "ingest_queue").context("open ingest queue")?);

    // --- health/observability handles ------------------------------------
    let book_ws_connected = ConnectionFlag::new();
    let fill_subscriber_connected = ConnectionFlag::new();
    let last_canonical_event = LastEventClock::new();
    let latency = LatencyTracker::new();

    // --- book cache + WS client (C2 / C3) ---------------------------------
    let book_cache = BookCache::new(BookCacheConfig::default());
    let book_ws_client = BookWsClient::new(
        book_cache.clone(),
        BookWsConfig { ws_url: book_ws_url, ..BookWsConfig::default() },
    )
    .with_status(book_ws_connected.clone());

    // --- followed wallets tracked by the fill subscriber (C4) -------------
    let tracked_users = users_store.list_enabled().await.context("list followed users")?;
    let mut tracked_wallets: Vec<String> = Vec::new();
    for user in &tracked_users {
        tracked_wallets.push(user.profile_address.clone());
        tracked_wallets.extend(user.proxy_addresses.iter().cloned());
    }
    let last_block = checkpoint_store.last_block().await.context("read last block checkpoint")?;
    if let Some(block) = last_block {
        info!(block, "resuming fill subscription from checkpoint");
    }
    let fill_subscriber = FillSubscriber::new(
        FillSubscriberConfig { ws_url: fill_ws_url, ..FillSubscriberConfig::default() },
        checkpoint_store.clone(),
        tracked_wallets,
    )
    .with_status(fill_subscriber_connected.clone());

    // --- canonical trade writer (C5) + event grouper (C7) -----------------
    let trade_writer = Arc::new(TradeWriter::new(
        trade_store.clone(),
        users_store.clone(),
        NullBlockTimestampLookup,
    ));
    let grouper = EventGrouper::new(EventGrouperConfig::default());

    // --- copy decision engine (C8) + small-trade buffer (C9) --------------
    let engine = Arc::new(CopyDecisionEngine::new(
        ledger.clone(),
        config_store.clone(),
        book_cache.clone(),
        attempts_store.clone(),
        users_store.clone(),
        NullMarketMetadata,
        initial_bankroll_micros,
    ));
    let small_trade_buffer = Arc::new(SmallTradeBuffer::new());
    let router = Arc::new(GroupRouter::new(
        config_store.clone(),
        ledger.clone(),
        book_cache.clone(),
        engine.clone(),
        small_trade_buffer.clone(),
        copy_attempt_queue.clone(),
        initial_bankroll_micros,
    ));

    // --- reconcile safety net (C6) -----------------------------------------
    let reconcile_worker = ReconcileWorker::new(trade_store.clone(), users_store.clone(), NullUserTradeHistoryApi);

    // --- token metadata enricher (post-processing, out-of-core but wired) -
    let enricher: Arc<dyn TokenMetadataEnricher> = match env::var("GAMMA_API_BASE") {
        Ok(base) => Arc::new(copytrade_engine::trades::enrich::HttpTokenMetadataEnricher::new(base)),
        Err(_) => Arc::new(NullTokenMetadataEnricher),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fills_tx, mut fills_rx) = mpsc::channel(1024);
    let (reconcile_tx, reconcile_rx) = mpsc::channel(64);
    let (grouper_tx, mut grouper_rx) = mpsc::channel::<copytrade_engine::trades::model::TradeEvent>(1024);
    let (groups_tx, mut groups_rx) = mpsc::channel(256);
    let (buffer_flush_tx, mut buffer_flush_rx) = mpsc::channel(256);

    let mut tasks = Vec::new();

    // C3: book WS client.
    tasks.push(tokio::spawn(book_ws_client.run(shutdown_rx.clone())));

    // C4: fill subscriber -> decoded fills channel + reconcile triggers.
    tasks.push(tokio::spawn(fill_subscriber.run(fills_tx, reconcile_tx.clone(), shutdown_rx.clone())));

    // C5: canonical trade writer, draining decoded fills.
    {
        let trade_writer = trade_writer.clone();
        let grouper_tx = grouper_tx.clone();
        let ingest_queue = ingest_queue.clone();
        let last_canonical_event = last_canonical_event.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    fill = fills_rx.recv() => {
                        let Some(fill) = fill else { return; };
                        match trade_writer.handle_fill(fill, &grouper_tx).await {
                            Ok(Some(event)) => {
                                last_canonical_event.mark(event.event_time);
                                let job = EnrichmentJob { trade_event_id: event.id.clone(), token_id: event.token_id.clone() };
                                if let Err(e) = ingest_queue.enqueue(&job).await {
                                    warn!(error = %e, "failed to enqueue enrichment job");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to write canonical trade"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        }));
    }

    // C6: reconcile safety net (reconnect-triggered + periodic).
    tasks.push(tokio::spawn(reconcile_worker.run(reconcile_rx, grouper_tx.clone(), shutdown_rx.clone())));

    // ingest-post-processing queue consumer: resolves token metadata.
    {
        let enricher = enricher.clone();
        let trade_store = trade_store.clone();
        let ingest_queue = ingest_queue.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            run_consumer(ingest_queue, Duration::from_millis(250), shutdown, move |job: EnrichmentJob| {
                let enricher = enricher.clone();
                let trade_store = trade_store.clone();
                async move {
                    match enricher.enrich(&job.token_id).await {
                        Some(meta) => {
                            trade_store
                                .mark_enriched(
                                    &job.trade_event_id,
                                    meta.market_id.as_deref().unwrap_or(""),
                                    meta.condition_id.as_deref().unwrap_or(""),
                                    &meta.asset_id,
                                )
                                .await
                        }
                        None => Ok(()),
                    }
                }
            })
            .await;
        }));
    }

    // C7: event grouper, draining canonical trade events and sweeping.
    {
        let grouper = grouper.clone();
        let groups_tx = groups_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = grouper_rx.recv() => {
                        let Some(event) = event else { return; };
                        if let Some(closed) = grouper.add_event(event) {
                            let _ = groups_tx.send(closed).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        }));
    }
    tasks.push(tokio::spawn(copytrade_engine::trades::grouper::run_sweeper(
        grouper.clone(),
        groups_tx.clone(),
        shutdown_rx.clone(),
    )));

    // C9: small-trade buffer sweeper, forwarding flushed buckets to the router.
    tasks.push(tokio::spawn(copytrade_engine::buffer::run_sweeper(
        small_trade_buffer.clone(),
        buffer_flush_tx,
        shutdown_rx.clone(),
    )));

    // Router: closed groups and flushed buckets both land on the copy-attempt queue.
    {
        let router = router.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    group = groups_rx.recv() => {
                        let Some(group) = group else { return; };
                        let asset_id = group.token_id.clone();
                        if let Err(e) = router.route_group(group, asset_id, None).await {
                            warn!(error = %e, "failed to route closed group");
                        }
                    }
                    flushed = buffer_flush_rx.recv() => {
                        let Some(flushed) = flushed else { return; };
                        if let Err(e) = router.route_flushed(flushed).await {
                            warn!(error = %e, "failed to route flushed buffer bucket");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        }));
    }

    // C8 consumer: copy-attempt queue at concurrency 1 per portfolio scope.
    // EXEC_GLOBAL is the only scope copied into today (spec §4.8), so a
    // single consumer preserves the required per-scope FIFO ordering.
    {
        let engine = engine.clone();
        let copy_attempt_queue = copy_attempt_queue.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            run_consumer(copy_attempt_queue, Duration::from_millis(100), shutdown, move |job: CopyAttemptJob| {
                let engine = engine.clone();
                async move {
                    engine
                        .handle_group(&job.group, &job.asset_id, job.market_id.as_deref(), job.source)
                        .await
                        .map(|_| ())
                }
            })
            .await;
        }));
    }

    // C11: snapshot loops.
    tasks.push(tokio::spawn(run_price_snapshot_loop(
        ledger.clone(),
        book_cache.clone(),
        price_snapshot_store,
        Duration::from_secs(env_u64("PRICE_SNAPSHOT_PERIOD_SECS", 30)),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_portfolio_snapshot_loop(
        ledger.clone(),
        book_cache.clone(),
        portfolio_snapshot_store,
        initial_bankroll_micros,
        shutdown_rx.clone(),
    )));

    // C12: settlement loop (resolved-market payouts; no metadata service
    // configured by default, so open positions simply stay open).
    tasks.push(tokio::spawn(run_settlement_loop(
        ledger.clone(),
        Arc::new(NullPayoutLookup),
        shutdown_rx.clone(),
    )));

    // Health endpoint (§6).
    let health_state = HealthState {
        book_cache: Arc::new(book_cache.clone()),
        ledger: ledger.clone(),
        book_ws_connected,
        fill_subscriber_connected,
        last_canonical_event,
        latency,
        queues: vec![
            ("copy_attempt", copy_attempt_queue.clone() as Arc<dyn copytrade_engine::health::QueueDepthSource>),
            ("ingest", ingest_queue.clone() as Arc<dyn copytrade_engine::health::QueueDepthSource>),
        ],
        stale_event_threshold: Duration::from_secs(300),
        queue_depth_degraded_threshold: 1_000,
        prometheus_handle,
    };
    tasks.push(tokio::spawn(copytrade_engine::health::serve(worker_port, health_state, shutdown_rx.clone())));

    info!(port = worker_port, "copy-trade engine running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    info!("copy-trade engine shut down cleanly");
    Ok(())
}
