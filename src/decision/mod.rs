//! Copy decision engine (C8): the hot path that turns one closed
//! [`crate::trades::TradeGroup`] into an EXECUTE/SKIP [`attempt::CopyAttempt`].

pub mod attempt;
pub mod engine;
pub mod job;
pub mod reason;
pub mod router;
pub mod simulate;
pub mod sizing;

pub use attempt::{AttemptDecision, AttemptSource, CopyAttempt, CopyAttemptStore};
pub use engine::{evaluate, CopyDecisionEngine, DecisionEvaluation, DecisionInputs, MarketMetadata, NullMarketMetadata};
pub use job::CopyAttemptJob;
pub use reason::ReasonCode;
pub use router::GroupRouter;
pub use simulate::{simulate, ExecutableFill, SimulationResult};
pub use sizing::{compute_sizing, SizingResult};
