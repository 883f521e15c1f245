//! Flooding: per-hop ttl handling, rate limiting, fan-out and the optional
//! DUAL spanning tree that restricts fan-out to tree neighbors.
pub mod dual;
pub mod engine;
pub mod rate_limit;
pub mod spt;

pub use dual::{DualMessage, DualMessageType, DualMessages, FloodTopoSetParams};
pub use engine::{FloodCounters, FloodEngine};
pub use spt::{SptInfo, SptInfos, SptManager};
