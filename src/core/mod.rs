//! Core abstractions and interfaces for batchgate
//!
//! This module provides the error type, the capability traits injected
//! into every component, and process-wide readiness state.

pub mod error;
pub mod status;
pub mod traits;

// Re-export commonly used types
pub use error::{BatchError, BatchResult, ErrorContext};
pub use traits::*;
