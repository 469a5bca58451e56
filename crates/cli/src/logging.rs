//! Process-wide `tracing` subscriber. Logs go to stderr so stdout stays
//! clean for command output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "fabric=info,fabric_tools=info,fabric_state=info";
const VERBOSE_LOG_FILTER: &str = "fabric=debug,fabric_tools=debug,fabric_state=debug";

/// `RUST_LOG` wins unless `--verbose` is given.
pub(crate) fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
