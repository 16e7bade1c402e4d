//! Durable-queue payload for one copy-attempt decision, §4.13. Carries
//! everything [`super::engine::CopyDecisionEngine::handle_group`] needs
//! so the copy-attempt consumer can be a thin adapter between
//! [`crate::queue::DurableQueue`] and the engine.

use super::attempt::AttemptSource;
use crate::trades::TradeGroup;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CopyAttemptJob {
    pub group: TradeGroup,
    pub asset_id: String,
    pub market_id: Option<String>,
    pub source: AttemptSource,
}
