use crate::config::LoggingConfig;
use axum::{extract::Request, middleware::Next, response::Response};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;
use tracing_subscriber::filter::{Directive, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let default: Directive = config
        .level
        .to_ascii_lowercase()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid log level {:?}: {e}", config.level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(default)
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// 16 hex characters.
fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn format_elapsed(elapsed_us: u128) -> String {
    if elapsed_us < 1000 {
        format!("{elapsed_us}µs")
    } else if elapsed_us < 1_000_000 {
        format!("{}ms", elapsed_us / 1000)
    } else {
        format!("{:.1}s", elapsed_us as f64 / 1_000_000.0)
    }
}

/// Logs each scrape or probe. Scrapes are frequent, so success is `debug`.
pub async fn request_logging(req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = format_elapsed(start.elapsed().as_micros());
    let status = response.status();
    if status.is_server_error() {
        tracing::warn!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed = %elapsed,
            "<-- response"
        );
    } else {
        tracing::debug!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed = %elapsed,
            "<-- response"
        );
    }
    response
}
