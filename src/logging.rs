use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{BasaltError, Result};

/// Installs a global `fmt` subscriber filtered by `filter`
/// (for example `"info"` or `"basalt::txn=debug"`).
///
/// Fails with [`BasaltError::Invalid`] when the filter does not parse or a
/// global subscriber is already installed.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).map_err(|_| BasaltError::Invalid("invalid log filter"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| BasaltError::Invalid("logging already initialized"))
}
