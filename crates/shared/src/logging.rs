use std::{env, str::FromStr};

use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

const DEFAULT_LOG_FILTER: &str = "info";

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` controls the filter (defaults to `info`) and `LOG_FORMAT=json`
/// switches to structured output for log shippers.
pub fn configure_logging() -> Result<(), anyhow::Error> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_str(&filter)?)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stdout);

    let result = if is_json_format(env::var("LOG_FORMAT").ok().as_deref()) {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if let Err(e) = result {
        // tests call this once per binary, the bootstrap binary once per process
        warn!("Failed to initialize logging, a subscriber is probably already installed: {e}");
    }

    Ok(())
}

fn is_json_format(format: Option<&str>) -> bool {
    matches!(format, Some(f) if f.eq_ignore_ascii_case("json"))
}
