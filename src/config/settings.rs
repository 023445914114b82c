//! Application settings and configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML/JSON file,
//! then `DISPATCH__*` environment variables (`DISPATCH__POOL__STRATEGY`,
//! `DISPATCH__PORT`, ...). A `.env` file is read first when present.

use crate::backends::BackendKind;
use crate::error::DispatchError;
use crate::models::{BackendClass, BackendSpec, Capability};
use crate::services::backend_pool::{LoadBalanceStrategy, MemberConfig, PoolConfig, PoolSpec};
use crate::services::calibrator::CalibratorConfig;
use crate::services::dispatcher::DispatchConfig;
use crate::services::health::CircuitBreakerConfig;
use crate::services::ledger::LedgerConfig;
use crate::services::router::RoutingWeights;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "DISPATCH";

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[value(alias = "dev")]
    Development,
    #[value(alias = "stage")]
    Staging,
    #[value(alias = "prod")]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!("Invalid environment: {}. Expected: development, staging, or production", s),
        }
    }
}

/// One configured backend and its pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority_hint: u32,
    pub cost_per_unit: f64,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub class: BackendClass,
    #[serde(default)]
    pub kind: BackendKind,
    /// Overrides `pool.strategy` for this backend
    #[serde(default)]
    pub strategy: Option<LoadBalanceStrategy>,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

impl BackendConfig {
    pub fn spec(&self) -> BackendSpec {
        let spec = BackendSpec::new(self.id.clone(), self.cost_per_unit)
            .with_priority(self.priority_hint)
            .with_capabilities(self.capabilities.iter().copied())
            .with_class(self.class);
        if self.enabled {
            spec
        } else {
            spec.disabled()
        }
    }

    pub fn pool_spec(&self) -> PoolSpec {
        let pool = PoolSpec::new(self.id.clone(), self.members.clone());
        match self.strategy {
            Some(strategy) => pool.with_strategy(strategy),
            None => pool,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    // App settings
    pub app_name: String,
    #[serde(skip)]
    pub app_version: String,
    pub environment: Environment,
    pub log_level: String,
    /// Rolling JSON log file; stdout only when unset
    pub log_file: Option<PathBuf>,

    // Server settings
    pub host: String,
    pub port: u16,

    // Dispatch pipeline
    pub routing: RoutingWeights,
    pub circuit_breaker: CircuitBreakerConfig,
    pub calibrator: CalibratorConfig,
    pub pool: PoolConfig,
    pub ledger: LedgerConfig,
    pub dispatch: DispatchConfig,

    pub backends: Vec<BackendConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "llm-dispatch".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Development,
            log_level: "info".to_string(),
            log_file: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            routing: RoutingWeights::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            calibrator: CalibratorConfig::default(),
            pool: PoolConfig::default(),
            ledger: LedgerConfig::default(),
            dispatch: DispatchConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Load .env file if it exists (ignored in production typically)
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate().context("Invalid configuration")?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.port == 0 {
            return Err(DispatchError::config("port cannot be 0"));
        }
        self.routing.validate()?;
        self.circuit_breaker.validate()?;
        self.calibrator.validate()?;
        self.pool.validate()?;
        self.dispatch.validate()?;
        if self.ledger.window_size == 0 {
            return Err(DispatchError::config("ledger.window_size must be > 0"));
        }

        if self.backends.is_empty() {
            return Err(DispatchError::config("at least one backend must be configured"));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(DispatchError::config(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if backend.members.is_empty() {
                return Err(DispatchError::config(format!(
                    "backend '{}' has no pool members",
                    backend.id
                )));
            }
        }

        if self.environment == Environment::Production
            && self.backends.iter().any(|b| matches!(b.kind, BackendKind::Loopback { .. }))
        {
            tracing::warn!("Running in production with loopback backends configured");
        }

        Ok(())
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_true() -> bool {
    true
}
