//! Tracing bootstrap
//!
//! Construction-time initialization only; the engine itself never installs
//! a global subscriber.

use tracing_subscriber::EnvFilter;

use crate::error::{EngineResult, WorkflowError};

/// Install a formatted subscriber honoring `RUST_LOG`, defaulting to `info`
pub fn try_init() -> EngineResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| WorkflowError::Internal(format!("tracing init failed: {}", e)))
}

/// Install the subscriber, ignoring an already-installed global
pub fn init() {
    let _ = try_init();
}
