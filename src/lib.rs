pub mod api;
pub mod cli;
pub mod error;
pub mod flood;
pub mod kvstore;
pub mod node;
pub mod peers;
pub mod settings;
pub mod subscription;
pub mod transport;
