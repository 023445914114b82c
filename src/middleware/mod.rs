//! Middleware module
//!
//! HTTP request logging with trace-id propagation.

pub mod logging;

pub use logging::{log_request, TraceId, REQUEST_ID_HEADER, TRACE_ID_HEADER};
