//! Book-aware fill simulation (spec §4.8 step 5): walk the sorted
//! opposite-side levels, accumulating shares until the target is filled
//! or the next level falls outside the price bound.

use crate::fixed_point::{notional_micros, ratio_bps, shares_for_notional, Micros, PriceMicros};
use crate::trades::Side;

/// One simulated per-level fill backing an EXECUTE attempt.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ExecutableFill {
    pub price_micros: PriceMicros,
    pub share_micros: Micros,
    pub notional_micros: Micros,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub fills: Vec<ExecutableFill>,
    pub filled_shares_micros: Micros,
    pub filled_notional_micros: Micros,
    pub vwap_price_micros: Option<PriceMicros>,
    pub filled_ratio_bps: u32,
    /// Total notional available across *all* levels within the price
    /// bound, not just what was consumed to reach the target -- this is
    /// what the depth-requirement check (step 6) compares against.
    pub available_notional_within_bounds: Micros,
}

/// `levels` must already be sorted best-first (asks ascending for BUY,
/// bids descending for SELL), exactly as [`crate::book::NormalizedBook`]
/// materialises them. `target_notional_micros` and `effective_price`
/// (the group's reference price, used only to convert the target
/// notional into target shares) come from the caller's sizing step.
pub fn simulate(
    levels: &[(PriceMicros, i64)],
    side: Side,
    target_notional_micros: Micros,
    effective_price: PriceMicros,
    price_bound: PriceMicros,
) -> SimulationResult {
    let target_shares = shares_for_notional(target_notional_micros, effective_price);

    let mut fills = Vec::new();
    let mut filled_shares = 0i64;
    let mut filled_notional = 0i64;
    let mut available_notional = 0i64;
    let mut remaining = target_shares;

    for &(price, size_micros) in levels {
        let within_bound = match side {
            Side::Buy => price <= price_bound,
            Side::Sell => price >= price_bound,
        };
        // Levels arrive in best-to-worst order, so the first level that
        // falls outside the bound means every subsequent level does too.
        if !within_bound {
            break;
        }
        available_notional += notional_micros(size_micros, price);
        if remaining > 0 {
            let take = remaining.min(size_micros);
            if take > 0 {
                let notional = notional_micros(take, price);
                fills.push(ExecutableFill { price_micros: price, share_micros: take, notional_micros: notional });
                filled_shares += take;
                filled_notional += notional;
                remaining -= take;
            }
        }
    }

    let vwap = if filled_shares > 0 {
        Some((((filled_notional as i128) * 1_000_000i128) / filled_shares as i128) as PriceMicros)
    } else {
        None
    };

    SimulationResult {
        fills,
        filled_shares_micros: filled_shares,
        filled_notional_micros: filled_notional,
        vwap_price_micros: vwap,
        filled_ratio_bps: ratio_bps(filled_shares, target_shares.max(1)),
        available_notional_within_bounds: available_notional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_under_bound_matches_spec_scenario_5() {
        let asks = [(600_000, 1_000_000_000), (610_000, 2_000_000_000), (650_000, 5_000_000_000)];
        // target 500 shares @ their fill price 0.60 -> target_notional = 300.
        let target_notional = crate::fixed_point::notional_micros(500_000_000, 600_000);
        let result = simulate(&asks, Side::Buy, target_notional, 600_000, 610_000);
        assert_eq!(result.filled_shares_micros, 500_000_000);
        assert_eq!(result.vwap_price_micros, Some(600_000));
        assert_eq!(result.filled_ratio_bps, 10_000);
    }

    #[test]
    fn simulation_with_bug_bound_yields_zero_fills() {
        let asks = [(600_000, 1_000_000_000), (610_000, 2_000_000_000), (650_000, 5_000_000_000)];
        let target_notional = crate::fixed_point::notional_micros(500_000_000, 600_000);
        let result = simulate(&asks, Side::Buy, target_notional, 600_000, 15_000);
        assert_eq!(result.filled_shares_micros, 0);
        assert_eq!(result.available_notional_within_bounds, 0);
        assert!(result.vwap_price_micros.is_none());
    }

    #[test]
    fn sell_side_walks_bids_descending() {
        let bids = [(500_000, 1_000_000_000), (490_000, 1_000_000_000)];
        let target_notional = crate::fixed_point::notional_micros(1_000_000_000, 500_000);
        let result = simulate(&bids, Side::Sell, target_notional, 500_000, 490_000);
        assert_eq!(result.filled_shares_micros, 1_000_000_000);
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].price_micros, 500_000);
    }
}
