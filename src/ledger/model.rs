use chrono::{DateTime, Utc};

use crate::fixed_point::{Micros, PriceMicros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PortfolioScope {
    /// The followed trader's own notional curve, mirrored at full size.
    ShadowUser,
    /// This engine's attributed slice of the copy for one leader.
    ExecUser,
    /// The overall paper portfolio across all leaders.
    ExecGlobal,
}

impl PortfolioScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioScope::ShadowUser => "SHADOW_USER",
            PortfolioScope::ExecUser => "EXEC_USER",
            PortfolioScope::ExecGlobal => "EXEC_GLOBAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SHADOW_USER" => Some(PortfolioScope::ShadowUser),
            "EXEC_USER" => Some(PortfolioScope::ExecUser),
            "EXEC_GLOBAL" => Some(PortfolioScope::ExecGlobal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryType {
    TradeBuy,
    TradeSell,
    Merge,
    Split,
    Redeem,
    Settlement,
    Deposit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TradeBuy => "TRADE_BUY",
            EntryType::TradeSell => "TRADE_SELL",
            EntryType::Merge => "MERGE",
            EntryType::Split => "SPLIT",
            EntryType::Redeem => "REDEEM",
            EntryType::Settlement => "SETTLEMENT",
            EntryType::Deposit => "DEPOSIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TRADE_BUY" => EntryType::TradeBuy,
            "TRADE_SELL" => EntryType::TradeSell,
            "MERGE" => EntryType::Merge,
            "SPLIT" => EntryType::Split,
            "REDEEM" => EntryType::Redeem,
            "SETTLEMENT" => EntryType::Settlement,
            "DEPOSIT" => EntryType::Deposit,
            _ => return None,
        })
    }
}

/// One append-only double-entry row. Idempotent by `(scope, refId,
/// entryType)` -- at most one row exists for that triple.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub market_id: Option<String>,
    pub asset_id: Option<String>,
    pub entry_type: EntryType,
    pub share_delta_micros: Micros,
    pub cash_delta_micros: Micros,
    pub price_micros: Option<PriceMicros>,
    pub ref_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Deterministic `refId` derived from the group key, scope, and
    /// entry type, per spec §4.8 step 12 -- this is what makes the
    /// `(scope, refId, entryType)` uniqueness invariant idempotent
    /// across replays of the same group.
    pub fn deterministic_ref_id(group_key: &str, scope: PortfolioScope) -> String {
        format!("{group_key}:{}", scope.as_str())
    }
}
