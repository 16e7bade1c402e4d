//! Typed guardrail/sizing schemas. Every field is optional on a
//! per-leader override row so field-by-field fallback to the global row
//! is possible; [`EffectiveConfig`] is the fully-resolved, non-optional
//! view the decision engine actually consumes.

use crate::fixed_point::{Micros, PriceMicros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SizingMode {
    FixedRate,
    BudgetedDynamic,
}

/// Sizing knobs, each individually overridable per leader.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SizingConfig {
    pub mode: Option<SizingMode>,
    pub copy_pct_notional_bps: Option<u32>,
    pub budget_micros: Option<Micros>,
    pub rate_min_bps: Option<u32>,
    pub rate_max_bps: Option<u32>,
    pub min_trade_notional_micros: Option<Micros>,
    pub max_trade_notional_micros: Option<Micros>,
    pub max_trade_bankroll_bps: Option<u32>,
}

/// Guardrail knobs, each individually overridable per leader.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GuardrailConfig {
    pub max_worsening_vs_their_fill_micros: Option<PriceMicros>,
    pub max_over_mid_micros: Option<PriceMicros>,
    pub max_spread_micros: Option<PriceMicros>,
    pub min_depth_multiplier_bps: Option<u32>,
    pub max_buy_cost_per_share_micros: Option<PriceMicros>,
    pub max_total_exposure_bps: Option<u32>,
    pub max_exposure_per_market_bps: Option<u32>,
    pub max_exposure_per_user_bps: Option<u32>,
    pub no_new_opens_within_minutes_to_close: Option<i64>,
    pub daily_drawdown_bps: Option<u32>,
    pub weekly_drawdown_bps: Option<u32>,
    pub decision_latency_ms: Option<u64>,
    pub jitter_ms_max: Option<u64>,
    pub notional_threshold_micros: Option<Micros>,
    pub flush_min_notional_micros: Option<Micros>,
    pub max_buffer_ms: Option<u64>,
    pub buffer_quiet_ms: Option<u64>,
    pub min_exec_notional_micros: Option<Micros>,
    pub same_side_only: Option<bool>,
}

impl SizingConfig {
    /// Field-by-field fallback: `self` (per-leader) wins where set, else
    /// `global`.
    pub fn merged_with(&self, global: &SizingConfig) -> SizingConfig {
        SizingConfig {
            mode: self.mode.or(global.mode),
            copy_pct_notional_bps: self.copy_pct_notional_bps.or(global.copy_pct_notional_bps),
            budget_micros: self.budget_micros.or(global.budget_micros),
            rate_min_bps: self.rate_min_bps.or(global.rate_min_bps),
            rate_max_bps: self.rate_max_bps.or(global.rate_max_bps),
            min_trade_notional_micros: self.min_trade_notional_micros.or(global.min_trade_notional_micros),
            max_trade_notional_micros: self.max_trade_notional_micros.or(global.max_trade_notional_micros),
            max_trade_bankroll_bps: self.max_trade_bankroll_bps.or(global.max_trade_bankroll_bps),
        }
    }
}

impl GuardrailConfig {
    pub fn merged_with(&self, global: &GuardrailConfig) -> GuardrailConfig {
        GuardrailConfig {
            max_worsening_vs_their_fill_micros: self
                .max_worsening_vs_their_fill_micros
                .or(global.max_worsening_vs_their_fill_micros),
            max_over_mid_micros: self.max_over_mid_micros.or(global.max_over_mid_micros),
            max_spread_micros: self.max_spread_micros.or(global.max_spread_micros),
            min_depth_multiplier_bps: self.min_depth_multiplier_bps.or(global.min_depth_multiplier_bps),
            max_buy_cost_per_share_micros: self
                .max_buy_cost_per_share_micros
                .or(global.max_buy_cost_per_share_micros),
            max_total_exposure_bps: self.max_total_exposure_bps.or(global.max_total_exposure_bps),
            max_exposure_per_market_bps: self
                .max_exposure_per_market_bps
                .or(global.max_exposure_per_market_bps),
            max_exposure_per_user_bps: self.max_exposure_per_user_bps.or(global.max_exposure_per_user_bps),
            no_new_opens_within_minutes_to_close: self
                .no_new_opens_within_minutes_to_close
                .or(global.no_new_opens_within_minutes_to_close),
            daily_drawdown_bps: self.daily_drawdown_bps.or(global.daily_drawdown_bps),
            weekly_drawdown_bps: self.weekly_drawdown_bps.or(global.weekly_drawdown_bps),
            decision_latency_ms: self.decision_latency_ms.or(global.decision_latency_ms),
            jitter_ms_max: self.jitter_ms_max.or(global.jitter_ms_max),
            notional_threshold_micros: self.notional_threshold_micros.or(global.notional_threshold_micros),
            flush_min_notional_micros: self.flush_min_notional_micros.or(global.flush_min_notional_micros),
            max_buffer_ms: self.max_buffer_ms.or(global.max_buffer_ms),
            buffer_quiet_ms: self.buffer_quiet_ms.or(global.buffer_quiet_ms),
            min_exec_notional_micros: self.min_exec_notional_micros.or(global.min_exec_notional_micros),
            same_side_only: self.same_side_only.or(global.same_side_only),
        }
    }
}

/// Fully-resolved configuration the decision engine reads. Built by
/// [`super::store::ConfigStore::effective_for`] from the merged
/// global+per-leader rows, with hard-coded defaults for anything never
/// configured.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub sizing_mode: SizingMode,
    pub copy_pct_notional_bps: u32,
    pub budget_micros: Micros,
    pub rate_min_bps: u32,
    pub rate_max_bps: u32,
    pub min_trade_notional_micros: Micros,
    pub max_trade_notional_micros: Micros,
    pub max_trade_bankroll_bps: u32,
    pub max_worsening_vs_their_fill_micros: PriceMicros,
    pub max_over_mid_micros: PriceMicros,
    pub max_spread_micros: PriceMicros,
    pub min_depth_multiplier_bps: u32,
    pub max_buy_cost_per_share_micros: Option<PriceMicros>,
    pub max_total_exposure_bps: u32,
    pub max_exposure_per_market_bps: u32,
    pub max_exposure_per_user_bps: u32,
    pub no_new_opens_within_minutes_to_close: i64,
    pub daily_drawdown_bps: u32,
    pub weekly_drawdown_bps: u32,
    pub decision_latency_ms: u64,
    pub jitter_ms_max: u64,
    pub notional_threshold_micros: Micros,
    pub flush_min_notional_micros: Micros,
    pub max_buffer_ms: u64,
    pub buffer_quiet_ms: u64,
    pub min_exec_notional_micros: Micros,
    pub same_side_only: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            sizing_mode: SizingMode::FixedRate,
            copy_pct_notional_bps: 100,
            budget_micros: 0,
            rate_min_bps: 10,
            rate_max_bps: 500,
            min_trade_notional_micros: 1_000_000,
            max_trade_notional_micros: 500_000_000,
            max_trade_bankroll_bps: 500,
            max_worsening_vs_their_fill_micros: 20_000,
            max_over_mid_micros: 30_000,
            max_spread_micros: 50_000,
            min_depth_multiplier_bps: 8_000,
            max_buy_cost_per_share_micros: None,
            max_total_exposure_bps: 8_000,
            max_exposure_per_market_bps: 2_000,
            max_exposure_per_user_bps: 3_000,
            no_new_opens_within_minutes_to_close: 30,
            daily_drawdown_bps: 1_000,
            weekly_drawdown_bps: 2_500,
            decision_latency_ms: 150,
            jitter_ms_max: 250,
            notional_threshold_micros: 5_000_000,
            flush_min_notional_micros: 5_000_000,
            max_buffer_ms: 60_000,
            buffer_quiet_ms: 3_000,
            min_exec_notional_micros: 1_000_000,
            same_side_only: true,
        }
    }
}

impl EffectiveConfig {
    pub fn from_merged(sizing: &SizingConfig, guardrails: &GuardrailConfig) -> Self {
        let d = EffectiveConfig::default();
        EffectiveConfig {
            sizing_mode: sizing.mode.unwrap_or(d.sizing_mode),
            copy_pct_notional_bps: sizing.copy_pct_notional_bps.unwrap_or(d.copy_pct_notional_bps),
            budget_micros: sizing.budget_micros.unwrap_or(d.budget_micros),
            rate_min_bps: sizing.rate_min_bps.unwrap_or(d.rate_min_bps),
            rate_max_bps: sizing.rate_max_bps.unwrap_or(d.rate_max_bps),
            min_trade_notional_micros: sizing
                .min_trade_notional_micros
                .unwrap_or(d.min_trade_notional_micros),
            max_trade_notional_micros: sizing
                .max_trade_notional_micros
                .unwrap_or(d.max_trade_notional_micros),
            max_trade_bankroll_bps: sizing.max_trade_bankroll_bps.unwrap_or(d.max_trade_bankroll_bps),
            max_worsening_vs_their_fill_micros: guardrails
                .max_worsening_vs_their_fill_micros
                .unwrap_or(d.max_worsening_vs_their_fill_micros),
            max_over_mid_micros: guardrails.max_over_mid_micros.unwrap_or(d.max_over_mid_micros),
            max_spread_micros: guardrails.max_spread_micros.unwrap_or(d.max_spread_micros),
            min_depth_multiplier_bps: guardrails
                .min_depth_multiplier_bps
                .unwrap_or(d.min_depth_multiplier_bps),
            max_buy_cost_per_share_micros: guardrails.max_buy_cost_per_share_micros,
            max_total_exposure_bps: guardrails.max_total_exposure_bps.unwrap_or(d.max_total_exposure_bps),
            max_exposure_per_market_bps: guardrails
                .max_exposure_per_market_bps
                .unwrap_or(d.max_exposure_per_market_bps),
            max_exposure_per_user_bps: guardrails
                .max_exposure_per_user_bps
                .unwrap_or(d.max_exposure_per_user_bps),
            no_new_opens_within_minutes_to_close: guardrails
                .no_new_opens_within_minutes_to_close
                .unwrap_or(d.no_new_opens_within_minutes_to_close),
            daily_drawdown_bps: guardrails.daily_drawdown_bps.unwrap_or(d.daily_drawdown_bps),
            weekly_drawdown_bps: guardrails.weekly_drawdown_bps.unwrap_or(d.weekly_drawdown_bps),
            decision_latency_ms: guardrails.decision_latency_ms.unwrap_or(d.decision_latency_ms),
            jitter_ms_max: guardrails.jitter_ms_max.unwrap_or(d.jitter_ms_max),
            notional_threshold_micros: guardrails
                .notional_threshold_micros
                .unwrap_or(d.notional_threshold_micros),
            flush_min_notional_micros: guardrails
                .flush_min_notional_micros
                .unwrap_or(d.flush_min_notional_micros),
            max_buffer_ms: guardrails.max_buffer_ms.unwrap_or(d.max_buffer_ms),
            buffer_quiet_ms: guardrails.buffer_quiet_ms.unwrap_or(d.buffer_quiet_ms),
            min_exec_notional_micros: guardrails
                .min_exec_notional_micros
                .unwrap_or(d.min_exec_notional_micros),
            same_side_only: guardrails.same_side_only.unwrap_or(d.same_side_only),
        }
    }
}
