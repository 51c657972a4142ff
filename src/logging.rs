//! Subscriber setup for the binary. Library code only emits events.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "bucketsync=info";
const VERBOSE_LOG_FILTER: &str = "bucketsync=debug";

/// Log to stderr. `RUST_LOG` wins over the built-in filter; `verbose` raises the default to debug.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { VERBOSE_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter),
        )
        .try_init()?;

    Ok(())
}
