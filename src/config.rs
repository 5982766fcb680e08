//! Host configuration.
//!
//! Everything here is a default: the extension supplies path/model/context
//! overrides on each request, and those always win. Values are read from
//! `FABRIC_HOST_*` environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Host-side defaults and time bounds.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Fallback fabric-ai executable, used when a request carries no path
    /// override and `$PATH` lookup fails.
    pub tool_path: Option<PathBuf>,

    /// Model passed to the tool when a request does not name one.
    pub default_model: Option<String>,

    /// Upper bound on the handshake `--version` probe, so a hung tool
    /// cannot wedge the peer in its connecting state.
    pub handshake_timeout: Duration,

    /// How long a cancelled process gets to exit after SIGTERM before it
    /// is killed.
    pub cancel_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tool_path: None,
            default_model: None,
            handshake_timeout: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl Settings {
    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `FABRIC_HOST_TOOL`, `FABRIC_HOST_MODEL`,
    /// `FABRIC_HOST_HANDSHAKE_TIMEOUT_SECONDS`, and
    /// `FABRIC_HOST_CANCEL_GRACE_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tool_path: std::env::var("FABRIC_HOST_TOOL").ok().map(PathBuf::from),
            default_model: std::env::var("FABRIC_HOST_MODEL").ok(),
            handshake_timeout: std::env::var("FABRIC_HOST_HANDSHAKE_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            cancel_grace: std::env::var("FABRIC_HOST_CANCEL_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.cancel_grace, Duration::from_millis),
        }
    }
}
