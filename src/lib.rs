//! batchgate: a batching HTTP gateway.
//!
//! Callers send a list of independent sub-requests in one envelope. Sync
//! batches fan out immediately and return the responses in order; async
//! batches are queued, processed by a worker pool and polled for later.

pub mod backend;
pub mod batch;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod service;
pub(crate) mod utils;
pub mod worker;
