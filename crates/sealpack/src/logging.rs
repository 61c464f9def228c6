use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Environment variable holding the filter directives, e.g. `sealpack=debug`.
pub const LOG_ENV: &str = "SEALPACK_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// progress lines and command output.
pub fn init(json: bool) -> Result<()> {
    let res = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
    };
    res.map_err(|e| Error::msg(format!("failed to initialize logging: {e}")))
}
