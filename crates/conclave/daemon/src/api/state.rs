//! Application state for API handlers

use std::sync::Arc;

use conclave_substrate::Substrate;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub substrate: Arc<Substrate>,

    /// Bearer token accepted by the halt endpoint.
    pub halt_token: Option<String>,

    pub version: String,

    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(substrate: Arc<Substrate>) -> Self {
        let halt_token = substrate.config().server.halt_token.clone();
        Self {
            substrate,
            halt_token,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
