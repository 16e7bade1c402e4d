//! Real-time copy-trade engine library.
//!
//! Exposes every module for use by the `copytrade-engine` binary and by
//! integration tests. The binary owns wiring (config, spawning loops,
//! graceful shutdown); everything here is the reusable core.

pub mod book;
pub mod buffer;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod db_common;
pub mod decision;
pub mod fixed_point;
pub mod followed_user;
pub mod health;
pub mod ledger;
pub mod queue;
pub mod settlement;
pub mod snapshot;
pub mod trades;
