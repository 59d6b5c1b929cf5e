use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::LogFormat;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "transcoder=info,transcoder_engine=info";

/// `-v` and `-q` take precedence over `RUST_LOG`.
fn filter(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("transcoder=debug,transcoder_engine=debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

pub fn init(verbose: bool, quiet: bool, format: LogFormat) {
    let registry = tracing_subscriber::registry().with(filter(verbose, quiet));
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(verbose))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
