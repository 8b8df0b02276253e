//! REST boundary: the HTTP façade over the store and the retrying client
//! the engine and coordinator use to reach it (locally or on the core).

pub mod client;
pub mod server;

pub use client::{RestClient, RestStore, RetryPolicy};
