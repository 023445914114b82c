//! Configuration management module
//!
//! Loads and validates the dispatcher settings from configuration files,
//! environment variables and `.env` files.

pub mod settings;

pub use settings::{BackendConfig, Environment, Settings, ENV_PREFIX};
