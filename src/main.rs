use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use argus::alert::{AlertSink, SmtpAlerter};
use argus::cluster::TopologyMonitor;
use argus::config::{self, Config};
use argus::driver::{Connector, MysqlConnector};
use argus::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_configuration()?;

    let default_level = if config.monitor.loglevel > 1 {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    info!(
        servers = ?config.monitor.servers,
        interval_ms = config.monitor.interval_ms,
        maxfail = config.monitor.maxfail,
        "Argus replication monitor starting"
    );

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let connector: Arc<dyn Connector> = Arc::new(MysqlConnector::new(
        &config.db.user,
        &config.db.password,
        &config.db.socket,
        Duration::from_secs(config.monitor.timeout),
    ));

    let alert_sink: Option<Arc<dyn AlertSink>> = if config.alert.mail_to.is_empty() {
        None
    } else {
        Some(Arc::new(SmtpAlerter::new(Duration::from_secs(
            config.monitor.timeout,
        ))))
    };

    let mut monitor = TopologyMonitor::new(&config, connector, alert_sink).await;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    monitor.run(shutdown).await;

    info!("Argus shutdown complete");
    Ok(())
}

/// Load config from the path given on the command line, or from the default
/// locations.
fn load_configuration() -> anyhow::Result<Config> {
    if let Some(path) = std::env::args().nth(1) {
        return config::load_config(&path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path, e));
    }

    let config_paths = ["config/argus.toml", "argus.toml"];
    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                eprintln!("Loaded configuration from {}", path);
                return Ok(config);
            }
            Err(e) => {
                // Logging is not up yet during config loading
                warn_pre_init(path, &e);
            }
        }
    }

    anyhow::bail!(
        "no usable configuration found; tried {:?}. \
         Provide a config file path as the first argument.",
        config_paths
    )
}

fn warn_pre_init(path: &str, err: &config::ConfigError) {
    eprintln!("Could not load {}: {}", path, err);
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
