//! Config store (C14): typed, versioned guardrail/sizing schemas with
//! global + per-leader override and a distinct pause flag.

pub mod store;
pub mod types;

pub use store::ConfigStore;
pub use types::{EffectiveConfig, GuardrailConfig, SizingConfig, SizingMode};
