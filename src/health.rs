//! Health endpoint (§6): overall status, last canonical event time, WS
//! connected flag, book-cache stats, queue depths, DB-connected flag,
//! and latency aggregates, served over `axum`.
//!
//! The latency tracker is grounded on the `AtomicU64` sum/count/max
//! accumulator shape in the teacher's `performance::io::SqliteMetrics`,
//! reduced to a single named stage per recordable operation instead of
//! a whole profiler subsystem. Overall-status rollup is grounded on the
//! same `HealthScore` style in `performance::metrics`: thresholds on a
//! handful of signals, each contributing to one coarse verdict rather
//! than a numeric score, since this endpoint has no UI to render a
//! score against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::book::cache::{BookCache, BookCacheStats};
use crate::ledger::LedgerStore;
use crate::queue::DurableQueue;

/// Tracks connectivity for one upstream stream (book WS, on-chain fill
/// subscriber). Set by the owning loop on connect/disconnect.
#[derive(Clone, Default)]
pub struct ConnectionFlag(Arc<AtomicBool>);

impl ConnectionFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Records the timestamp of the most recently detected canonical fill
/// (C4's `OrderFilled` decode), for health's staleness signal.
#[derive(Clone, Default)]
pub struct LastEventClock(Arc<ArcSwapOption<DateTime<Utc>>>);

impl LastEventClock {
    pub fn new() -> Self {
        Self(Arc::new(ArcSwapOption::from(None)))
    }

    pub fn mark(&self, at: DateTime<Utc>) {
        self.0.store(Some(Arc::new(at)));
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0.load().as_deref().copied()
    }
}

/// One named latency stage: count, sum, and max in microseconds.
/// Exported both into the JSON snapshot and into the `metrics` crate's
/// global recorder so a Prometheus scrape sees the same numbers.
#[derive(Debug, Default)]
struct LatencyStage {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyStage {
    fn record(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        self.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencyStageSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        LatencyStageSnapshot {
            count,
            avg_us: if count > 0 { sum_us / count } else { 0 },
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyStageSnapshot {
    pub count: u64,
    pub avg_us: u64,
    pub max_us: u64,
}

/// Process-wide latency aggregates for the loops the health endpoint
/// reports on: fill-to-grouped-event, group-to-decision, and decision
/// commit. Stages are created lazily by name so new callers don't need
/// to touch this module.
#[derive(Clone, Default)]
pub struct LatencyTracker(Arc<parking_lot::RwLock<HashMap<&'static str, Arc<LatencyStage>>>>);

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &'static str, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        metrics::histogram!("copytrade_stage_latency_us", micros as f64, "stage" => stage);
        let existing = self.0.read().get(stage).cloned();
        let entry = existing.unwrap_or_else(|| {
            let mut map = self.0.write();
            map.entry(stage).or_insert_with(|| Arc::new(LatencyStage::default())).clone()
        });
        entry.record(micros);
    }

    fn snapshot(&self) -> HashMap<String, LatencyStageSnapshot> {
        self.0.read().iter().map(|(name, stage)| (name.to_string(), stage.snapshot())).collect()
    }
}

/// Type-erased queue depth source so the health state can hold the
/// three differently-typed `DurableQueue<T>` instances (reconcile,
/// ingest-post-processing, copy-attempt) behind one field type.
#[async_trait]
pub trait QueueDepthSource: Send + Sync {
    async fn depth(&self) -> anyhow::Result<i64>;
}

#[async_trait]
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> QueueDepthSource for DurableQueue<T> {
    async fn depth(&self) -> anyhow::Result<i64> {
        DurableQueue::depth(self).await
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OverallStatus {
    Ok,
    Degraded,
    Unhealthy,
}

impl Serialize for OverallStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            OverallStatus::Ok => "ok",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Shared state the `/health` handler reads. Cloned cheaply (every
/// field is an `Arc`-backed handle) into the `axum::Router`.
#[derive(Clone)]
pub struct HealthState {
    pub book_cache: Arc<BookCache>,
    pub ledger: LedgerStore,
    pub book_ws_connected: ConnectionFlag,
    pub fill_subscriber_connected: ConnectionFlag,
    pub last_canonical_event: LastEventClock,
    pub latency: LatencyTracker,
    pub queues: Vec<(&'static str, Arc<dyn QueueDepthSource>)>,
    /// Alerts past which the endpoint reports `degraded`.
    pub stale_event_threshold: Duration,
    pub queue_depth_degraded_threshold: i64,
    pub prometheus_handle: PrometheusHandle,
}

#[derive(Serialize)]
struct HealthReport {
    status: OverallStatus,
    last_canonical_event_time: Option<DateTime<Utc>>,
    ws_connected: bool,
    book_ws_connected: bool,
    fill_subscriber_connected: bool,
    book_cache: BookCacheStats,
    queue_depths: HashMap<String, i64>,
    db_connected: bool,
    latency: HashMap<String, LatencyStageSnapshot>,
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let db_connected = state.ledger.ping().await.is_ok();
    let book_ws_connected = state.book_ws_connected.is_connected();
    let fill_subscriber_connected = state.fill_subscriber_connected.is_connected();
    let ws_connected = book_ws_connected && fill_subscriber_connected;

    let mut queue_depths = HashMap::new();
    let mut any_queue_unreachable = false;
    for (name, queue) in &state.queues {
        match queue.depth().await {
            Ok(depth) => {
                queue_depths.insert(name.to_string(), depth);
            }
            Err(_) => {
                any_queue_unreachable = true;
                queue_depths.insert(name.to_string(), -1);
            }
        }
    }

    let last_canonical_event_time = state.last_canonical_event.get();
    let stale = match last_canonical_event_time {
        Some(t) => Utc::now().signed_duration_since(t).to_std().unwrap_or_default() > state.stale_event_threshold,
        None => false,
    };
    let queue_backed_up = queue_depths.values().any(|&d| d >= state.queue_depth_degraded_threshold);

    let status = if !db_connected || any_queue_unreachable {
        OverallStatus::Unhealthy
    } else if !ws_connected || stale || queue_backed_up {
        OverallStatus::Degraded
    } else {
        OverallStatus::Ok
    };

    let report = HealthReport {
        status,
        last_canonical_event_time,
        ws_connected,
        book_ws_connected,
        fill_subscriber_connected,
        book_cache: state.book_cache.stats(),
        queue_depths,
        db_connected,
        latency: state.latency.snapshot(),
    };

    let code = match status {
        OverallStatus::Ok | OverallStatus::Degraded => StatusCode::OK,
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.prometheus_handle.render()
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(port: u16, state: HealthState, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_flag_defaults_to_disconnected() {
        let flag = ConnectionFlag::new();
        assert!(!flag.is_connected());
        flag.set_connected(true);
        assert!(flag.is_connected());
    }

    #[test]
    fn last_event_clock_round_trips() {
        let clock = LastEventClock::new();
        assert!(clock.get().is_none());
        let now = Utc::now();
        clock.mark(now);
        assert_eq!(clock.get(), Some(now));
    }

    #[test]
    fn latency_tracker_computes_average_and_max() {
        let tracker = LatencyTracker::new();
        tracker.record("decision", Duration::from_micros(100));
        tracker.record("decision", Duration::from_micros(300));
        let snapshot = tracker.snapshot();
        let stage = snapshot.get("decision").unwrap();
        assert_eq!(stage.count, 2);
        assert_eq!(stage.avg_us, 200);
        assert_eq!(stage.max_us, 300);
    }
}
