pub mod area;
pub mod commands;
pub mod coordinator;
pub mod messages;
pub mod node_id;

pub use commands::AreaCommand;
pub use coordinator::KvNode;
pub use messages::{AreaSummary, MergeSummary};
pub use node_id::NodeName;
