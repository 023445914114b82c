//! LLM dispatch and resilience layer
//!
//! Routes text-generation requests across pooled AI backends with circuit
//! breaking, calibrated timeouts, load balancing and failover.

// Public modules
pub mod api;
pub mod backends;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Settings;
pub use error::{ApiError, DispatchError};
pub use models::{BackendSpec, Capability, DispatchRequest};
pub use server::App;
pub use services::{Dispatcher, DispatcherBuilder};
