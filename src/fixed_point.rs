//! Fixed-point arithmetic for money, prices and shares.
//!
//! Every quantity that crosses a decision boundary is an integer number of
//! micros (1 USD = 1_000_000 micros). Floating point never appears in
//! decision logic; this module is the only place that converts between
//! decimal text/`f64` input and the integer types the rest of the engine
//! consumes.

/// Scale factor: 1.0 == 1_000_000 micros.
pub const MICROS: i64 = 1_000_000;

/// Upper bound (exclusive) for a valid price, in micros. Prices live in
/// the open interval (0, 1_000_000), i.e. (0.00, 1.00).
pub const PRICE_MAX_MICROS: i64 = 1_000_000;

/// A price in micros, constrained to (0, 1_000_000) once validated.
pub type PriceMicros = i32;

/// A share or cash quantity in micros.
pub type Micros = i64;

/// Parse a decimal string or float-like input into price micros, clamped
/// to [0, 1_000_000]. NaN, infinite, or unparsable input maps to zero —
/// never propagated as an error, since upstream payloads routinely carry
/// malformed price strings that must simply be treated as "no price".
pub fn price_to_micros(input: &str) -> PriceMicros {
    match input.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => {
            let scaled = (v * MICROS as f64).round();
            if scaled.is_finite() {
                scaled.clamp(0.0, PRICE_MAX_MICROS as f64) as PriceMicros
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Parse a decimal string into share micros (64-bit, non-negative).
/// Same NaN/infinite/empty-string handling as [`price_to_micros`].
pub fn shares_to_micros(input: &str) -> Micros {
    match input.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => {
            let scaled = (v * MICROS as f64).round();
            if scaled.is_finite() && scaled <= i64::MAX as f64 {
                scaled as Micros
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Convert an `f64` dollar amount into micros, same clamping rules as
/// [`shares_to_micros`] but signed (cash deltas can be negative).
pub fn dollars_to_micros(value: f64) -> Micros {
    if !value.is_finite() {
        return 0;
    }
    let scaled = (value * MICROS as f64).round();
    if scaled.is_finite() {
        scaled.clamp(i64::MIN as f64, i64::MAX as f64) as Micros
    } else {
        0
    }
}

/// Render micros back to a decimal `f64`, for logging/serialization only.
/// Never used in a comparison or further arithmetic within decision logic.
pub fn micros_to_f64(value: i64) -> f64 {
    value as f64 / MICROS as f64
}

/// `notional = shares_micros * price_micros / 1_000_000`, floor division,
/// computed in 128-bit intermediate precision per DESIGN NOTES §9 to avoid
/// overflow once positions exceed tens of thousands of dollars.
pub fn notional_micros(shares_micros: Micros, price_micros: PriceMicros) -> Micros {
    let wide = (shares_micros as i128) * (price_micros as i128);
    (wide / MICROS as i128) as Micros
}

/// Inverse of [`notional_micros`]: given a target notional and a price,
/// how many share-micros does that buy? Floor division, 128-bit
/// intermediate. Returns 0 if `price_micros` is non-positive.
pub fn shares_for_notional(notional: Micros, price_micros: PriceMicros) -> Micros {
    if price_micros <= 0 {
        return 0;
    }
    let wide = (notional as i128) * (MICROS as i128);
    (wide / price_micros as i128) as Micros
}

/// Basis-point multiply: `value * bps / 10_000`, floor division, 128-bit
/// intermediate to avoid overflow for large notionals.
pub fn apply_bps(value: i64, bps: u32) -> i64 {
    let wide = (value as i128) * (bps as i128);
    (wide / 10_000i128) as i64
}

/// `numerator_bps(part, whole)` = `part * 10_000 / whole`, saturating at
/// 10_000 and returning 0 when `whole <= 0`. Used for `filledRatioBps`.
pub fn ratio_bps(part: i64, whole: i64) -> u32 {
    if whole <= 0 {
        return 0;
    }
    let wide = (part as i128) * 10_000i128 / whole as i128;
    wide.clamp(0, 10_000) as u32
}

/// Validate that a price lies in the open interval (0, 1_000_000).
pub fn is_valid_price(price_micros: PriceMicros) -> bool {
    price_micros > 0 && (price_micros as i64) < PRICE_MAX_MICROS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parsing_clamps_and_rounds() {
        assert_eq!(price_to_micros("0.50"), 500_000);
        assert_eq!(price_to_micros("1.5"), 1_000_000);
        assert_eq!(price_to_micros("-0.2"), 0);
        assert_eq!(price_to_micros("nan"), 0);
        assert_eq!(price_to_micros(""), 0);
        assert_eq!(price_to_micros("not a number"), 0);
    }

    #[test]
    fn shares_parsing_handles_garbage() {
        assert_eq!(shares_to_micros("100.123456"), 100_123_456);
        assert_eq!(shares_to_micros("-5"), 0);
        assert_eq!(shares_to_micros("inf"), 0);
    }

    #[test]
    fn notional_is_floor_division() {
        // 3 shares @ $0.333333 -> 999_999 micros, not 1_000_000.
        assert_eq!(notional_micros(3_000_000, 333_333), 999_999);
    }

    #[test]
    fn notional_handles_large_positions_without_overflow() {
        // 10,000,000 shares @ $0.99 -- would overflow i64 multiply before
        // dividing if done in 64-bit (10_000_000_000_000 * 990_000).
        let shares = 10_000_000 * MICROS;
        let price = 990_000;
        let notional = notional_micros(shares, price);
        assert_eq!(notional, 9_900_000 * MICROS);
    }

    #[test]
    fn ratio_bps_saturates() {
        assert_eq!(ratio_bps(500, 500), 10_000);
        assert_eq!(ratio_bps(600, 500), 10_000);
        assert_eq!(ratio_bps(250, 500), 5_000);
        assert_eq!(ratio_bps(1, 0), 0);
    }

    #[test]
    fn apply_bps_matches_spec_scenario() {
        // their_notional=100_000_000, copyPct=100bps -> raw=1_000_000
        assert_eq!(apply_bps(100_000_000, 100), 1_000_000);
    }
}
