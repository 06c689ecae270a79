use aaisp_client::{ChaosClient, HttpTransport};
use aaisp_common::metrics::MetricsSink;
use aaisp_common::shutdown;
use aaisp_exporter::app;
use aaisp_exporter::config::ExporterConfig;
use aaisp_exporter::logging;
use aaisp_exporter::scheduler::CollectionManager;
use aaisp_exporter::state::AppState;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;

const DEFAULT_CONFIG: &str = "config/exporter.toml";

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  aaisp-exporter [config.toml]    Start the exporter (default {DEFAULT_CONFIG})");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if matches!(args.get(1).map(String::as_str), Some("--help" | "-h")) {
        print_usage();
        return ExitCode::SUCCESS;
    }
    let config_path = args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG);

    // Logging is not up yet, so configuration errors go to stderr.
    let config = match ExporterConfig::load(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aaisp-exporter: {config_path}: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("aaisp-exporter: {e:#}");
        return ExitCode::from(2);
    }

    match run(config, config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "exporter stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ExporterConfig, config_path: &str) -> Result<()> {
    tracing::info!(
        version = app::VERSION,
        config = config_path,
        host = %config.server.host,
        port = config.server.port,
        "aaisp-exporter starting"
    );

    let sink = Arc::new(MetricsSink::new());
    app::register_exporter_metrics(&sink).context("failed to register exporter metrics")?;

    let (trigger, shutdown) = shutdown::channel();
    let credentials = config.auth.credentials()?;
    let settings = config.client_settings();
    let transport = HttpTransport::new(settings.timeout).context("failed to build HTTP transport")?;
    let client = Arc::new(
        ChaosClient::new(Arc::new(transport), credentials, settings, &sink, shutdown.clone())
            .context("failed to register client metrics")?,
    );

    let registry = Arc::new(
        aaisp_exporter::build_registry(&config.collectors).context("invalid collector registration")?,
    );
    registry
        .describe_metrics(&sink)
        .context("failed to describe collector metrics")?;
    tracing::info!(
        enabled = registry.len(),
        disabled = ?registry.disabled(),
        "collectors registered"
    );

    let manager = Arc::new(
        CollectionManager::new(
            Arc::clone(&registry),
            client,
            Arc::clone(&sink),
            config.schedules(),
            shutdown.clone(),
        )
        .context("failed to register scheduler metrics")?,
    );
    let state = AppState::new(Arc::clone(&sink), manager.status_board(), registry);
    let mut tiers = manager.start();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let mut server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app::build_http_app(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
    let mut server = tokio::spawn(async move { server.await });

    tracing::info!(http = %addr, "exporter started");

    let mut server_result = None;
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("shutting down gracefully");
        }
        result = &mut server => {
            server_result = Some(result);
        }
    }

    trigger.trigger();
    while let Some(joined) = tiers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "tier scheduler task failed");
        }
    }
    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    server_result
        .context("HTTP server task failed")?
        .context("HTTP server error")?;

    tracing::info!("exporter stopped");
    Ok(())
}
