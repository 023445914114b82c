//! Error types
//!
//! `DispatchError` is the taxonomy surfaced by the dispatch layer, `BackendError`
//! is what backend collaborators report, and `ApiError` maps both onto HTTP.

mod types;

pub use types::{ApiError, BackendError, DispatchError, ExclusionReason};
