pub mod config;
pub mod coordinator;
pub mod hasher;
pub mod logging;
pub mod merkle;
pub mod paths;
pub mod pipeline;
pub mod record;
pub mod rest;
pub mod store;
pub mod walker;

pub use config::Config;
pub use coordinator::Coordinator;
pub use hasher::{FileHasher, HashAlgorithm};
pub use merkle::{MerkleEngine, MerkleFailure, WorkItem, WorkState};
pub use record::{ChangeSet, HashRecord, LogEntry, LogLevel};
pub use rest::{RestClient, RestStore, RetryPolicy};
pub use store::{MemoryStore, SiteStore, SqliteStore, Store};

#[cfg(test)]
mod tests;
