//! `jobwatch` -- headless live job status monitor.
//!
//! Connects to the job status namespace of a web application for every
//! server listed in `JOBWATCH_SERVERS`, logs status notices, refresh
//! requests and dependency graph rebuilds, and shuts down cleanly on
//! Ctrl-C. See [`jobwatch_monitor::config`] for the environment
//! variables. Set `JOBWATCH_LOG_JSON=1` for JSON log lines.

use std::sync::Arc;

use jobwatch_channel::client::SocketIoTransport;
use jobwatch_monitor::config::MonitorConfig;
use jobwatch_monitor::feed::HttpDependencyFeed;
use jobwatch_monitor::headless::{log_events, LoggingHostTree, LoggingNotifier};
use jobwatch_monitor::JobMonitor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = MonitorConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        base_url = %config.base_url,
        servers = ?config.servers,
        "Starting jobwatch",
    );

    let transport = Arc::new(SocketIoTransport::new(config.socket_config()));
    let feed = Arc::new(HttpDependencyFeed::new(config.base_url.clone()));
    let monitor = JobMonitor::new(transport, feed, config.channel_settings());

    tokio::spawn(log_events(monitor.subscribe()));

    if let Err(e) = monitor.attach(Arc::new(LoggingHostTree), Arc::new(LoggingNotifier)) {
        tracing::error!(error = %e, "Failed to attach monitor");
        std::process::exit(1);
    }

    for &server_id in &config.servers {
        if let Err(e) = monitor.connect(server_id).await {
            tracing::error!(server_id, error = %e, "Failed to connect");
        }
    }

    let teardown = match monitor.teardown_token() {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Monitor not attached");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        }
        _ = teardown.cancelled() => {}
    }

    if let Err(e) = monitor.shutdown().await {
        tracing::error!(error = %e, "Shutdown failed");
    }
    tracing::info!("jobwatch stopped");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "jobwatch=info,jobwatch_monitor=info,jobwatch_channel=info".into());
    let json = std::env::var("JOBWATCH_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
