//! Implementations of the capability traits.

pub mod http;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

pub use http::ReqwestClient;
pub use memory::{MemoryQueue, MemoryResultStore, StoreJanitor};
