//! Versioned, ttl-bounded record storage for one area
pub mod filter;
pub mod record;
pub mod store;
pub mod ttl;

pub use filter::{CompiledFilter, FilterOperator, KvFilter};
pub use record::{KeyVals, Publication, Record, StoreEvent, TTL_INFINITY};
pub use store::{MergeOutcome, RecordStore, StoreCounters};
pub use ttl::{TtlManager, TtlTick};
