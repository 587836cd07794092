pub mod block;
pub mod config;
pub mod error;
pub mod flock;
pub mod index;
pub mod metrics;
pub mod persist;
pub mod recovery;
pub mod store;
pub mod txn;

#[cfg(test)]
mod tmpfs;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use metrics::MetricsSnapshot;
pub use persist::Persistable;
pub use store::Store;
pub use txn::{Handle, Kind, Transaction};
