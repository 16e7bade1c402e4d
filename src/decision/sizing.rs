//! Sizing (spec §4.8 step 2): fixed-rate or budgeted-dynamic raw target,
//! then the three trade-level clamps applied in order.

use crate::config::{EffectiveConfig, SizingMode};
use crate::fixed_point::{apply_bps, Micros};

#[derive(Debug, Clone, Copy)]
pub struct SizingResult {
    pub raw_notional_micros: Micros,
    pub target_notional_micros: Micros,
    pub effective_rate_bps: u32,
    pub bankroll_clamp_applied: bool,
}

/// Resolve the sizing `rate` in bps for the configured [`SizingMode`].
/// Budgeted-dynamic uses the leader's *current* exposure; an exposure of
/// zero or less is treated as "fully capacity available" and uses
/// `rate_max_bps`, per spec §4.8 step 2.
fn effective_rate_bps(config: &EffectiveConfig, leader_exposure_micros: Micros) -> u32 {
    match config.sizing_mode {
        SizingMode::FixedRate => config.copy_pct_notional_bps,
        SizingMode::BudgetedDynamic => {
            if leader_exposure_micros <= 0 {
                config.rate_max_bps
            } else {
                let wide = (config.budget_micros as i128) * 10_000i128 / leader_exposure_micros as i128;
                (wide.clamp(0, u32::MAX as i128) as u32).clamp(config.rate_min_bps, config.rate_max_bps)
            }
        }
    }
}

/// Computes the raw target, then applies the three trade-level clamps
/// in the order spec §4.8 step 2 specifies: floor to `minTrade`, ceiling
/// to `maxTrade`, then ceiling to a bankroll-bps-of-equity cap; if that
/// last ceiling would force the result below the floor, use the floor
/// instead and report the bankroll clamp as *not* applied.
pub fn compute_sizing(
    their_notional_micros: Micros,
    config: &EffectiveConfig,
    leader_exposure_micros: Micros,
    equity_micros: Micros,
) -> SizingResult {
    let rate_bps = effective_rate_bps(config, leader_exposure_micros);
    let raw = apply_bps(their_notional_micros, rate_bps);

    let floored = raw.max(config.min_trade_notional_micros);
    let capped = floored.min(config.max_trade_notional_micros);

    let bankroll_ceiling = apply_bps(equity_micros.max(0), config.max_trade_bankroll_bps);
    let (target, bankroll_clamp_applied) = if bankroll_ceiling < capped {
        if bankroll_ceiling < config.min_trade_notional_micros {
            (config.min_trade_notional_micros, false)
        } else {
            (bankroll_ceiling, true)
        }
    } else {
        (capped, false)
    };

    SizingResult {
        raw_notional_micros: raw,
        target_notional_micros: target,
        effective_rate_bps: rate_bps,
        bankroll_clamp_applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardrailConfig, SizingConfig};

    fn config_with(sizing: SizingConfig) -> EffectiveConfig {
        EffectiveConfig::from_merged(&sizing, &GuardrailConfig::default())
    }

    #[test]
    fn fixed_rate_sizing_matches_spec_scenario_3() {
        let config = config_with(SizingConfig {
            mode: Some(SizingMode::FixedRate),
            copy_pct_notional_bps: Some(100),
            min_trade_notional_micros: Some(5_000_000),
            max_trade_notional_micros: Some(500_000_000),
            max_trade_bankroll_bps: Some(10_000),
            ..Default::default()
        });
        let result = compute_sizing(100_000_000, &config, 0, 1_000_000_000);
        assert_eq!(result.raw_notional_micros, 1_000_000);
        assert_eq!(result.target_notional_micros, 5_000_000);
    }

    #[test]
    fn budgeted_dynamic_sizing_matches_spec_scenario_4() {
        let config = config_with(SizingConfig {
            mode: Some(SizingMode::BudgetedDynamic),
            budget_micros: Some(40_000_000),
            rate_min_bps: Some(0),
            rate_max_bps: Some(200),
            min_trade_notional_micros: Some(0),
            max_trade_notional_micros: Some(500_000_000),
            max_trade_bankroll_bps: Some(10_000),
            ..Default::default()
        });
        let result = compute_sizing(100_000_000, &config, 4_000_000_000, 1_000_000_000);
        assert_eq!(result.effective_rate_bps, 100);
        assert_eq!(result.target_notional_micros, 1_000_000);

        let result_zero_exposure = compute_sizing(100_000_000, &config, 0, 1_000_000_000);
        assert_eq!(result_zero_exposure.effective_rate_bps, 200);
        assert_eq!(result_zero_exposure.target_notional_micros, 2_000_000);
    }

    #[test]
    fn bankroll_ceiling_below_floor_falls_back_to_floor_unflagged() {
        let config = config_with(SizingConfig {
            mode: Some(SizingMode::FixedRate),
            copy_pct_notional_bps: Some(10_000),
            min_trade_notional_micros: Some(5_000_000),
            max_trade_notional_micros: Some(500_000_000),
            max_trade_bankroll_bps: Some(10),
            ..Default::default()
        });
        // equity tiny enough that 10bps of it is below the 5 floor.
        let result = compute_sizing(100_000_000, &config, 0, 100_000_000);
        assert_eq!(result.target_notional_micros, 5_000_000);
        assert!(!result.bankroll_clamp_applied);
    }
}
