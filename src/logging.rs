use tracing_subscriber::EnvFilter;

use crate::error::{Result, RpcError};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| RpcError::config(format!("invalid log level {:?}: {}", level, e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| RpcError::config(format!("logging already initialized: {}", e)))
}
