//! Reason codes the decision engine (C8) accumulates instead of raising
//! -- per DESIGN NOTES §9, stages append to a vector and short-circuit by
//! returning a SKIP value, never by unwinding the stack.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReasonCode {
    EnginePaused,
    UserDisabled,
    MarketBlacklisted,
    SpreadTooWide,
    InsufficientDepth,
    PriceWorseThanTheirFill,
    PriceTooFarOverMid,
    BuyCostPerShareTooHigh,
    NoLiquidityWithinBounds,
    RiskCapTotalExposure,
    RiskCapMarketExposure,
    RiskCapUserExposure,
    MarketTooCloseToClose,
    CircuitBreakerTripped,
    Buffered,
    BufferFlushBelowMinExec,
    NotEnoughPositionToSell,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::EnginePaused => "ENGINE_PAUSED",
            ReasonCode::UserDisabled => "USER_DISABLED",
            ReasonCode::MarketBlacklisted => "MARKET_BLACKLISTED",
            ReasonCode::SpreadTooWide => "SPREAD_TOO_WIDE",
            ReasonCode::InsufficientDepth => "INSUFFICIENT_DEPTH",
            ReasonCode::PriceWorseThanTheirFill => "PRICE_WORSE_THAN_THEIR_FILL",
            ReasonCode::PriceTooFarOverMid => "PRICE_TOO_FAR_OVER_MID",
            ReasonCode::BuyCostPerShareTooHigh => "BUY_COST_PER_SHARE_TOO_HIGH",
            ReasonCode::NoLiquidityWithinBounds => "NO_LIQUIDITY_WITHIN_BOUNDS",
            ReasonCode::RiskCapTotalExposure => "RISK_CAP_TOTAL_EXPOSURE",
            ReasonCode::RiskCapMarketExposure => "RISK_CAP_MARKET_EXPOSURE",
            ReasonCode::RiskCapUserExposure => "RISK_CAP_USER_EXPOSURE",
            ReasonCode::MarketTooCloseToClose => "MARKET_TOO_CLOSE_TO_CLOSE",
            ReasonCode::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            ReasonCode::Buffered => "BUFFERED",
            ReasonCode::BufferFlushBelowMinExec => "BUFFER_FLUSH_BELOW_MIN_EXEC",
            ReasonCode::NotEnoughPositionToSell => "NOT_ENOUGH_POSITION_TO_SELL",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
