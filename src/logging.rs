//! Tracing subscriber setup for embedders and tools.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{AssocError, Result};

/// Installs a global `fmt` subscriber filtered by `filter` (e.g. `"assocdb=debug"`).
///
/// Fails if the filter does not parse or a global subscriber is already installed.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| AssocError::InvalidOwned(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| AssocError::Invalid("logging already initialized"))
}
