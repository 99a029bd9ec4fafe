//! Trace sink supplied by the owning bus layer.
//!
//! The connector reports restore results and background failures here in
//! free-form text. Internal diagnostics go straight to `tracing`.

use tracing::{error, info};

/// Free-form trace output.
pub trait TraceSink: Send + Sync {
    fn information(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn information(&self, message: &str) {
        info!(target: "sentinel_bus::trace", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "sentinel_bus::trace", "{}", message);
    }
}
