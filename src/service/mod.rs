//! HTTP applications served by pingora.

pub mod http;
pub mod status;
