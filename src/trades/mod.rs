//! Canonical trade events (C5), the reconcile safety net (C6), and the
//! event grouper (C7).

pub mod enrich;
pub mod grouper;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod writer;

pub use enrich::{
    EnrichedTokenMetadata, EnrichmentJob, HttpTokenMetadataEnricher, NullTokenMetadataEnricher,
    TokenMetadataEnricher,
};
pub use grouper::{EventGrouper, GroupCloseReason, TradeGroup};
pub use model::{EnrichmentStatus, Side, TradeEvent};
pub use store::TradeEventStore;
pub use writer::TradeWriter;
