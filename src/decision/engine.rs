//! Copy decision engine (C8) -- the hot path. Triggered by one closed
//! [`TradeGroup`] at a time (callers run this at concurrency 1 per
//! portfolio scope, per spec §4.8 and §5, typically via a single
//! copy-attempt queue consumer since there is one `EXEC_GLOBAL` scope).
//!
//! [`evaluate`] is the pure decision function: every guardrail stage
//! appends a [`ReasonCode`] and short-circuits to `Skip` rather than
//! raising, per DESIGN NOTES §9. [`CopyDecisionEngine::handle_group`] is
//! the async wrapper that gathers book/config/ledger state, calls
//! [`evaluate`], applies the realism delay, and commits the ledger rows
//! and `CopyAttempt` row in one transactional batch.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use super::attempt::{AttemptDecision, AttemptSource, CopyAttempt, CopyAttemptStore};
use super::reason::ReasonCode;
use super::simulate::{simulate, SimulationResult};
use super::sizing::{compute_sizing, SizingResult};
use crate::book::{BookCache, NormalizedBook};
use crate::config::{ConfigStore, EffectiveConfig};
use crate::fixed_point::{apply_bps, notional_micros, Micros, PriceMicros};
use crate::followed_user::FollowedUserStore;
use crate::ledger::{EntryType, LedgerEntry, LedgerStore, PortfolioScope};
use crate::trades::{Side, TradeGroup};

/// External collaborator for market-level facts the copy decision
/// engine consults but doesn't own: close time (for the close-time
/// filter) and the blacklist flag (for the kill-switch stage). Token
/// metadata enrichment and admin blacklist persistence are themselves
/// out of scope per spec §1; this trait is the seam.
#[async_trait]
pub trait MarketMetadata: Send + Sync {
    async fn closes_at(&self, market_id: &str) -> Option<DateTime<Utc>>;
    async fn is_blacklisted(&self, market_id: &str) -> bool;
}

pub struct NullMarketMetadata;

#[async_trait]
impl MarketMetadata for NullMarketMetadata {
    async fn closes_at(&self, _market_id: &str) -> Option<DateTime<Utc>> {
        None
    }
    async fn is_blacklisted(&self, _market_id: &str) -> bool {
        false
    }
}

/// Every fact [`evaluate`] needs, gathered by the async caller so the
/// decision function itself stays pure and unit-testable without a
/// database or book cache.
#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub side: Side,
    pub reference_price_micros: PriceMicros,
    pub their_notional_micros: Micros,
    pub mid_micros: Option<PriceMicros>,
    pub best_bid_micros: Option<PriceMicros>,
    pub best_ask_micros: Option<PriceMicros>,
    pub levels: Vec<(PriceMicros, i64)>,
    pub config: EffectiveConfig,
    pub equity_micros: Micros,
    pub leader_exposure_micros: Micros,
    pub total_exposure_micros: Micros,
    pub market_exposure_micros: Micros,
    pub user_exposure_micros: Micros,
    pub existing_position_micros: Micros,
    pub user_enabled: bool,
    pub market_blacklisted: bool,
    pub engine_paused: bool,
    pub minutes_to_close: Option<i64>,
    pub daily_drawdown_bps: u32,
    pub weekly_drawdown_bps: u32,
}

#[derive(Debug, Clone)]
pub struct DecisionEvaluation {
    pub decision: AttemptDecision,
    pub reasons: Vec<ReasonCode>,
    pub sizing: SizingResult,
    pub price_bound_micros: Option<PriceMicros>,
    pub sim: Option<SimulationResult>,
}

/// `maxPrice`/`minPrice` per spec §4.8 step 3. When the book carries no
/// mid (an empty or not-yet-subscribed book), the bound falls back to
/// just the their-fill term rather than silently collapsing `M` to
/// zero -- that collapse is the literal bug spec.md §8 scenario 2 warns
/// about (`maxPrice=15_000` instead of `610_000`).
fn price_bound(
    side: Side,
    reference_price: PriceMicros,
    mid: Option<PriceMicros>,
    max_worsening: PriceMicros,
    max_over_mid: PriceMicros,
) -> PriceMicros {
    match side {
        Side::Buy => {
            let from_ref = reference_price + max_worsening;
            match mid {
                Some(m) => from_ref.min(m + max_over_mid),
                None => from_ref,
            }
        }
        Side::Sell => {
            let from_ref = reference_price - max_worsening;
            match mid {
                Some(m) => from_ref.max(m - max_over_mid),
                None => from_ref,
            }
        }
    }
}

/// The pure decision function: spec §4.8 steps 1-10, in order, each
/// capable of appending a reason code and short-circuiting.
pub fn evaluate(inputs: &DecisionInputs) -> DecisionEvaluation {
    let mut reasons = Vec::new();

    // Step 1: kill-switches.
    if inputs.engine_paused {
        reasons.push(ReasonCode::EnginePaused);
    }
    if !inputs.user_enabled {
        reasons.push(ReasonCode::UserDisabled);
    }
    if inputs.market_blacklisted {
        reasons.push(ReasonCode::MarketBlacklisted);
    }
    if !reasons.is_empty() {
        return skip(reasons, SizingResult::default_zero(), None, None);
    }

    // Step 2: sizing.
    let sizing = compute_sizing(
        inputs.their_notional_micros,
        &inputs.config,
        inputs.leader_exposure_micros,
        inputs.equity_micros,
    );
    let mut target_notional = sizing.target_notional_micros;

    // Invariant breach guard (§7): a SELL can never exceed the position
    // this engine actually holds in the paper book.
    if inputs.side == Side::Sell {
        if inputs.existing_position_micros <= 0 {
            reasons.push(ReasonCode::NotEnoughPositionToSell);
            return skip(reasons, sizing, None, None);
        }
        let max_sellable_notional =
            notional_micros(inputs.existing_position_micros, inputs.reference_price_micros);
        target_notional = target_notional.min(max_sellable_notional);
    }

    // Step 3: price bounds.
    let bound = price_bound(
        inputs.side,
        inputs.reference_price_micros,
        inputs.mid_micros,
        inputs.config.max_worsening_vs_their_fill_micros,
        inputs.config.max_over_mid_micros,
    );

    // Step 4: spread filter.
    if let (Some(bid), Some(ask)) = (inputs.best_bid_micros, inputs.best_ask_micros) {
        if (ask - bid) as PriceMicros > inputs.config.max_spread_micros {
            reasons.push(ReasonCode::SpreadTooWide);
            return skip(reasons, sizing, Some(bound), None);
        }
    }

    // Step 5: simulation.
    let sim = simulate(
        &inputs.levels,
        inputs.side,
        target_notional,
        inputs.reference_price_micros,
        bound,
    );

    // Step 6: depth requirement.
    let required = apply_bps(target_notional, inputs.config.min_depth_multiplier_bps);
    if sim.available_notional_within_bounds < required {
        reasons.push(ReasonCode::InsufficientDepth);
    }

    // Step 7: post-simulation price checks.
    match sim.vwap_price_micros {
        None => reasons.push(ReasonCode::NoLiquidityWithinBounds),
        Some(vwap) => {
            let worsening = match inputs.side {
                Side::Buy => vwap - inputs.reference_price_micros,
                Side::Sell => inputs.reference_price_micros - vwap,
            };
            if worsening > inputs.config.max_worsening_vs_their_fill_micros {
                reasons.push(ReasonCode::PriceWorseThanTheirFill);
            }
            if let Some(mid) = inputs.mid_micros {
                let over_mid = match inputs.side {
                    Side::Buy => vwap - mid,
                    Side::Sell => mid - vwap,
                };
                if over_mid > inputs.config.max_over_mid_micros {
                    reasons.push(ReasonCode::PriceTooFarOverMid);
                }
            }
            if inputs.side == Side::Buy {
                if let Some(max_cost) = inputs.config.max_buy_cost_per_share_micros {
                    if vwap >= max_cost {
                        reasons.push(ReasonCode::BuyCostPerShareTooHigh);
                    }
                }
            }
        }
    }

    // Step 8: exposure caps. Opening exposure only; a SELL reduces
    // exposure and is never capped here.
    if inputs.side == Side::Buy {
        let equity = inputs.equity_micros.max(0);
        let added = sim.filled_notional_micros;
        if inputs.total_exposure_micros + added > apply_bps(equity, inputs.config.max_total_exposure_bps) {
            reasons.push(ReasonCode::RiskCapTotalExposure);
        }
        if inputs.market_exposure_micros + added > apply_bps(equity, inputs.config.max_exposure_per_market_bps) {
            reasons.push(ReasonCode::RiskCapMarketExposure);
        }
        if inputs.user_exposure_micros + added > apply_bps(equity, inputs.config.max_exposure_per_user_bps) {
            reasons.push(ReasonCode::RiskCapUserExposure);
        }
    }

    // Step 9: close-time filter. Only opening new exposure is blocked;
    // SELLs that reduce exposure are always allowed through.
    if inputs.side == Side::Buy {
        if let Some(minutes) = inputs.minutes_to_close {
            if minutes <= inputs.config.no_new_opens_within_minutes_to_close {
                reasons.push(ReasonCode::MarketTooCloseToClose);
            }
        }
    }

    // Step 10: circuit breakers.
    if inputs.daily_drawdown_bps >= inputs.config.daily_drawdown_bps
        || inputs.weekly_drawdown_bps >= inputs.config.weekly_drawdown_bps
    {
        reasons.push(ReasonCode::CircuitBreakerTripped);
    }

    if reasons.is_empty() {
        DecisionEvaluation {
            decision: AttemptDecision::Execute,
            reasons,
            sizing,
            price_bound_micros: Some(bound),
            sim: Some(sim),
        }
    } else {
        skip(reasons, sizing, Some(bound), Some(sim))
    }
}

fn skip(
    reasons: Vec<ReasonCode>,
    sizing: SizingResult,
    price_bound_micros: Option<PriceMicros>,
    sim: Option<SimulationResult>,
) -> DecisionEvaluation {
    DecisionEvaluation { decision: AttemptDecision::Skip, reasons, sizing, price_bound_micros, sim }
}

impl SizingResult {
    fn default_zero() -> Self {
        SizingResult {
            raw_notional_micros: 0,
            target_notional_micros: 0,
            effective_rate_bps: 0,
            bankroll_clamp_applied: false,
        }
    }
}

/// The async wrapper: gathers book/config/ledger state for one group,
/// calls [`evaluate`], sleeps the realism delay, and commits.
pub struct CopyDecisionEngine<M: MarketMetadata> {
    ledger: LedgerStore,
    config: ConfigStore,
    book_cache: BookCache,
    attempts: CopyAttemptStore,
    followed_users: FollowedUserStore,
    market_metadata: M,
    initial_bankroll_micros: Micros,
}

impl<M: MarketMetadata> CopyDecisionEngine<M> {
    pub fn new(
        ledger: LedgerStore,
        config: ConfigStore,
        book_cache: BookCache,
        attempts: CopyAttemptStore,
        followed_users: FollowedUserStore,
        market_metadata: M,
        initial_bankroll_micros: Micros,
    ) -> Self {
        Self { ledger, config, book_cache, attempts, followed_users, market_metadata, initial_bankroll_micros }
    }

    fn price_lookup(&self) -> impl Fn(&str) -> Option<PriceMicros> + '_ {
        move |asset: &str| self.book_cache.get_no_wait(asset).mid
    }

    /// Runs the full hot path for one closed group and returns the
    /// persisted [`CopyAttempt`]. `asset_id`/`market_id` are the group's
    /// enriched identifiers (resolved by the caller from the
    /// contributing trade events).
    pub async fn handle_group(
        &self,
        group: &TradeGroup,
        asset_id: &str,
        market_id: Option<&str>,
        source: AttemptSource,
    ) -> Result<CopyAttempt> {
        let user = self.followed_users.get(&group.followed_user_id).await?;
        let user_enabled = user.as_ref().map(|u| u.enabled).unwrap_or(false);
        let engine_paused = self.config.is_paused().await?;
        let market_blacklisted = match market_id {
            Some(mid) => self.market_metadata.is_blacklisted(mid).await,
            None => false,
        };
        let config = self.config.effective_for(&group.followed_user_id).await?;
        let book = self.book_cache.get_fresh_or_wait(&group.token_id, 150).await;

        let lookup = self.price_lookup();
        let global = self
            .ledger
            .summary(PortfolioScope::ExecGlobal, None, self.initial_bankroll_micros, &lookup)
            .await?;
        let leader = self
            .ledger
            .summary(PortfolioScope::ExecUser, Some(&group.followed_user_id), 0, &lookup)
            .await?;
        let market_exposure = match market_id {
            Some(mid) => self.ledger.market_exposure(PortfolioScope::ExecGlobal, mid, &lookup).await?,
            None => 0,
        };
        let existing_position =
            self.ledger.position(PortfolioScope::ExecGlobal, None, asset_id).await?;

        let since_daily = Utc::now() - chrono::Duration::hours(24);
        let since_weekly = Utc::now() - chrono::Duration::days(7);
        let daily_pnl = self.ledger.realized_pnl_since(PortfolioScope::ExecGlobal, None, since_daily).await?;
        let weekly_pnl = self.ledger.realized_pnl_since(PortfolioScope::ExecGlobal, None, since_weekly).await?;
        let equity_for_dd = global.equity_micros.max(1);
        let daily_dd_bps = if daily_pnl < 0 {
            ((-daily_pnl as i128) * 10_000i128 / equity_for_dd as i128) as u32
        } else {
            0
        };
        let weekly_dd_bps = if weekly_pnl < 0 {
            ((-weekly_pnl as i128) * 10_000i128 / equity_for_dd as i128) as u32
        } else {
            0
        };

        let minutes_to_close = match market_id {
            Some(mid) => self
                .market_metadata
                .closes_at(mid)
                .await
                .map(|t| (t - Utc::now()).num_minutes()),
            None => None,
        };

        let levels: Vec<(PriceMicros, i64)> = match group.side {
            Side::Buy => book.asks.clone(),
            Side::Sell => book.bids.clone(),
        };

        let inputs = DecisionInputs {
            side: group.side,
            reference_price_micros: group.vwap_price_micros,
            their_notional_micros: group.aggregate_notional_micros,
            mid_micros: book.mid,
            best_bid_micros: book.best_bid,
            best_ask_micros: book.best_ask,
            levels,
            config,
            equity_micros: global.equity_micros,
            leader_exposure_micros: leader.exposure_micros,
            total_exposure_micros: global.exposure_micros,
            market_exposure_micros: market_exposure,
            user_exposure_micros: leader.exposure_micros,
            existing_position_micros: existing_position,
            user_enabled,
            market_blacklisted,
            engine_paused,
            minutes_to_close,
            daily_drawdown_bps: daily_dd_bps,
            weekly_drawdown_bps: weekly_dd_bps,
        };

        let evaluation = evaluate(&inputs);

        // Step 11: realism delay.
        let jitter = if inputs.config.jitter_ms_max > 0 {
            rand::thread_rng().gen_range(0..inputs.config.jitter_ms_max)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(inputs.config.decision_latency_ms + jitter)).await;

        // Step 12: commit.
        self.commit(group, asset_id, market_id, source, &evaluation).await
    }

    /// Writes a forced-SKIP attempt and its `SHADOW_USER` ledger entry
    /// without running simulation or guardrails -- the small-trade
    /// buffer's two short-circuit outcomes (§4.9: `BUFFERED` on the
    /// immediate pre-threshold check, `BUFFER_FLUSH_BELOW_MIN_EXEC` on a
    /// flush that still doesn't clear the execution floor) never reach
    /// the book, so there's nothing for steps 3-10 to evaluate. Routed
    /// through here rather than written directly by the caller so
    /// `CopyAttempt`/`LedgerEntry` keep their single-writer rule (spec
    /// §3: only C8 writes these rows).
    pub async fn record_forced_skip(
        &self,
        group: &TradeGroup,
        asset_id: &str,
        market_id: Option<&str>,
        reason: ReasonCode,
        target_notional_micros: Micros,
        source: AttemptSource,
    ) -> Result<CopyAttempt> {
        let evaluation = DecisionEvaluation {
            decision: AttemptDecision::Skip,
            reasons: vec![reason],
            sizing: SizingResult {
                raw_notional_micros: target_notional_micros,
                target_notional_micros,
                effective_rate_bps: 0,
                bankroll_clamp_applied: false,
            },
            price_bound_micros: None,
            sim: None,
        };
        self.commit(group, asset_id, market_id, source, &evaluation).await
    }

    async fn commit(
        &self,
        group: &TradeGroup,
        asset_id: &str,
        market_id: Option<&str>,
        source: AttemptSource,
        evaluation: &DecisionEvaluation,
    ) -> Result<CopyAttempt> {
        let key = group_key(group);
        let now = Utc::now();

        let shadow_ref = LedgerEntry::deterministic_ref_id(&key, PortfolioScope::ShadowUser);
        let (shadow_shares, shadow_cash) = signed_delta(group.side, group.aggregate_shares_micros, group.aggregate_notional_micros);
        let mut entries = vec![LedgerEntry {
            id: Uuid::new_v4().to_string(),
            scope: PortfolioScope::ShadowUser,
            followed_user_id: Some(group.followed_user_id.clone()),
            market_id: market_id.map(str::to_string),
            asset_id: Some(asset_id.to_string()),
            entry_type: entry_type_for(group.side),
            share_delta_micros: shadow_shares,
            cash_delta_micros: shadow_cash,
            price_micros: Some(group.vwap_price_micros),
            ref_id: shadow_ref,
            created_at: now,
        }];

        let (filled_notional, filled_ratio_bps, vwap) = match &evaluation.sim {
            Some(sim) if evaluation.decision == AttemptDecision::Execute => {
                (sim.filled_notional_micros, sim.filled_ratio_bps, sim.vwap_price_micros)
            }
            Some(sim) => (0, sim.filled_ratio_bps, None),
            None => (0, 0, None),
        };

        if evaluation.decision == AttemptDecision::Execute {
            if let Some(sim) = &evaluation.sim {
                let (exec_shares, exec_cash) = signed_delta(group.side, sim.filled_shares_micros, sim.filled_notional_micros);
                let exec_user_ref = LedgerEntry::deterministic_ref_id(&key, PortfolioScope::ExecUser);
                entries.push(LedgerEntry {
                    id: Uuid::new_v4().to_string(),
                    scope: PortfolioScope::ExecUser,
                    followed_user_id: Some(group.followed_user_id.clone()),
                    market_id: market_id.map(str::to_string),
                    asset_id: Some(asset_id.to_string()),
                    entry_type: entry_type_for(group.side),
                    share_delta_micros: exec_shares,
                    cash_delta_micros: exec_cash,
                    price_micros: sim.vwap_price_micros,
                    ref_id: exec_user_ref,
                    created_at: now,
                });
                let exec_global_ref = LedgerEntry::deterministic_ref_id(&key, PortfolioScope::ExecGlobal);
                entries.push(LedgerEntry {
                    id: Uuid::new_v4().to_string(),
                    scope: PortfolioScope::ExecGlobal,
                    followed_user_id: None,
                    market_id: market_id.map(str::to_string),
                    asset_id: Some(asset_id.to_string()),
                    entry_type: entry_type_for(group.side),
                    share_delta_micros: exec_shares,
                    cash_delta_micros: exec_cash,
                    price_micros: sim.vwap_price_micros,
                    ref_id: exec_global_ref,
                    created_at: now,
                });
            }
        }

        self.ledger.append_batch_if_absent(&entries).await?;

        let attempt = CopyAttempt {
            id: Uuid::new_v4().to_string(),
            scope: PortfolioScope::ExecGlobal,
            followed_user_id: group.followed_user_id.clone(),
            decision: evaluation.decision,
            reasons: evaluation.reasons.clone(),
            target_notional_micros: evaluation.sizing.target_notional_micros,
            filled_notional_micros: filled_notional,
            filled_ratio_bps,
            vwap_price_micros: vwap,
            reference_price_micros: group.vwap_price_micros,
            source,
            buffered_trade_count: group.contributing_event_ids.len() as u32,
            fills: evaluation.sim.as_ref().map(|s| s.fills.clone()).unwrap_or_default(),
            created_at: now,
        };
        self.attempts.insert(&attempt).await?;
        Ok(attempt)
    }
}

fn entry_type_for(side: Side) -> EntryType {
    match side {
        Side::Buy => EntryType::TradeBuy,
        Side::Sell => EntryType::TradeSell,
    }
}

/// BUY: shares +, cash -. SELL: shares -, cash +.
fn signed_delta(side: Side, shares: Micros, notional: Micros) -> (Micros, Micros) {
    match side {
        Side::Buy => (shares, -notional),
        Side::Sell => (-shares, notional),
    }
}

/// Deterministic key identifying the source group, used to derive
/// every scope's `refId` for this decision -- replaying the same group
/// (same contributing event ids) always yields the same keys, which is
/// what makes the `(scope, refId, entryType)` uniqueness invariant
/// idempotent across retries (spec §4.8 step 12, §8 "replaying...
/// produces no additional rows").
fn group_key(group: &TradeGroup) -> String {
    let mut ids = group.contributing_event_ids.clone();
    ids.sort();
    ids.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardrailConfig, SizingConfig};

    fn base_config() -> EffectiveConfig {
        EffectiveConfig::from_merged(&SizingConfig::default(), &GuardrailConfig::default())
    }

    fn base_inputs() -> DecisionInputs {
        DecisionInputs {
            side: Side::Buy,
            reference_price_micros: 600_000,
            their_notional_micros: 100_000_000,
            mid_micros: Some(600_000),
            best_bid_micros: Some(590_000),
            best_ask_micros: Some(600_000),
            levels: vec![(600_000, 1_000_000_000), (610_000, 2_000_000_000)],
            config: base_config(),
            equity_micros: 1_000_000_000,
            leader_exposure_micros: 0,
            total_exposure_micros: 0,
            market_exposure_micros: 0,
            user_exposure_micros: 0,
            existing_position_micros: 0,
            user_enabled: true,
            market_blacklisted: false,
            engine_paused: false,
            minutes_to_close: None,
            daily_drawdown_bps: 0,
            weekly_drawdown_bps: 0,
        }
    }

    #[test]
    fn paused_engine_short_circuits_to_skip() {
        let mut inputs = base_inputs();
        inputs.engine_paused = true;
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Skip);
        assert_eq!(eval.reasons, vec![ReasonCode::EnginePaused]);
    }

    #[test]
    fn disabled_user_and_blacklisted_market_both_recorded() {
        let mut inputs = base_inputs();
        inputs.user_enabled = false;
        inputs.market_blacklisted = true;
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Skip);
        assert!(eval.reasons.contains(&ReasonCode::UserDisabled));
        assert!(eval.reasons.contains(&ReasonCode::MarketBlacklisted));
    }

    #[test]
    fn healthy_book_and_config_yields_execute() {
        let inputs = base_inputs();
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Execute);
        let sim = eval.sim.unwrap();
        assert!(sim.filled_shares_micros > 0);
    }

    #[test]
    fn wide_spread_is_skipped() {
        let mut inputs = base_inputs();
        inputs.best_bid_micros = Some(100_000);
        inputs.best_ask_micros = Some(900_000);
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Skip);
        assert_eq!(eval.reasons, vec![ReasonCode::SpreadTooWide]);
    }

    #[test]
    fn sell_without_position_is_skipped() {
        let mut inputs = base_inputs();
        inputs.side = Side::Sell;
        inputs.reference_price_micros = 500_000;
        inputs.levels = vec![(500_000, 1_000_000_000)];
        inputs.existing_position_micros = 0;
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Skip);
        assert_eq!(eval.reasons, vec![ReasonCode::NotEnoughPositionToSell]);
    }

    #[test]
    fn exposure_cap_breach_is_flagged_on_buy_only() {
        let mut inputs = base_inputs();
        inputs.total_exposure_micros = 950_000_000;
        inputs.config.max_total_exposure_bps = 1_000; // 10% of 1B equity = 100M ceiling
        let eval = evaluate(&inputs);
        assert_eq!(eval.decision, AttemptDecision::Skip);
        assert!(eval.reasons.contains(&ReasonCode::RiskCapTotalExposure));
    }

    #[test]
    fn market_too_close_to_close_blocks_buy_but_not_sell() {
        let mut inputs = base_inputs();
        inputs.minutes_to_close = Some(5);
        inputs.config.no_new_opens_within_minutes_to_close = 30;
        let eval = evaluate(&inputs);
        assert!(eval.reasons.contains(&ReasonCode::MarketTooCloseToClose));

        let mut sell_inputs = base_inputs();
        sell_inputs.side = Side::Sell;
        sell_inputs.reference_price_micros = 500_000;
        sell_inputs.levels = vec![(500_000, 1_000_000_000)];
        sell_inputs.existing_position_micros = 1_000_000_000;
        sell_inputs.minutes_to_close = Some(5);
        sell_inputs.config.no_new_opens_within_minutes_to_close = 30;
        let sell_eval = evaluate(&sell_inputs);
        assert!(!sell_eval.reasons.contains(&ReasonCode::MarketTooCloseToClose));
    }
}
