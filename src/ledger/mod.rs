//! Double-entry ledger (C10): append-only rows keyed for idempotency by
//! `(scope, refId, entryType)`, from which position/cash/exposure/PnL
//! are all derived queries rather than maintained state.
//!
//! Grounded on `backtest_v2/ledger.rs`'s event-ref idempotency and
//! fixed-point `Amount` design, generalized from its per-market account
//! graph to the flat `(scope, followedUserId, assetId)` row shape
//! spec §3 calls for.

pub mod model;
pub mod store;

pub use model::{EntryType, LedgerEntry, PortfolioScope};
pub use store::{LedgerStore, PortfolioSummary};
