//! Application state container
//!
//! Shared state handed to every handler through Axum's state extraction.

use crate::config::Settings;
use crate::services::Dispatcher;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared application state
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub dispatcher: Arc<Dispatcher>,
    /// Application start time (for uptime calculation)
    pub start_time: Instant,
    /// Cancelled on shutdown; stops background tasks
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the dispatcher described by `settings`
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        tracing::debug!(backends = settings.backends.len(), "Initializing dispatcher");
        let dispatcher = Dispatcher::from_settings(&settings)?;
        Ok(Self::with_dispatcher(settings, Arc::new(dispatcher)))
    }

    pub fn with_dispatcher(settings: Settings, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            settings: Arc::new(settings),
            dispatcher,
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the application uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
