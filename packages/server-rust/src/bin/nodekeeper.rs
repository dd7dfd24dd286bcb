//! `nodekeeper` binary: runs the operation engine next to a database node.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use nodekeeper_server::management::{ConnectionInfo, HttpManagementClient, ManagementTls};
use nodekeeper_server::network::{NetworkConfig, NetworkModule, ShutdownController, TlsConfig};
use nodekeeper_server::service::{
    builtin_registry, EngineConfig, ExecutorDeps, ExpirySweeper, NodePaths, Scheduler, SystemClock,
};
use nodekeeper_server::storage::StorageProviders;
use tracing::{info, warn};

/// Every flag can also be set through the `NODEKEEPER_*` variable shown in `--help`.
#[derive(Parser, Debug)]
#[command(name = "nodekeeper", version, about = "Administrative operation engine for a database node")]
struct Cli {
    /// Control surface bind address.
    #[arg(long, env = "NODEKEEPER_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "NODEKEEPER_PORT", default_value_t = 8090)]
    port: u16,

    /// PEM certificate served by the control surface; requires `--tls-key`.
    #[arg(long, env = "NODEKEEPER_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "NODEKEEPER_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long, env = "NODEKEEPER_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Base URL of the node's management API.
    #[arg(long, env = "NODEKEEPER_MANAGEMENT_ADDRESS", default_value = "http://127.0.0.1:8080/api/v0/ops")]
    management_address: String,

    #[arg(long, env = "NODEKEEPER_MANAGEMENT_USER")]
    management_user: Option<String>,

    #[arg(long, env = "NODEKEEPER_MANAGEMENT_PASSWORD", hide_env_values = true)]
    management_password: Option<String>,

    /// CA certificate for mutual TLS with the management API.
    #[arg(
        long,
        env = "NODEKEEPER_MANAGEMENT_CA_CERT",
        requires_all = ["management_client_cert", "management_client_key"]
    )]
    management_ca_cert: Option<PathBuf>,

    #[arg(long, env = "NODEKEEPER_MANAGEMENT_CLIENT_CERT", requires = "management_ca_cert")]
    management_client_cert: Option<PathBuf>,

    #[arg(long, env = "NODEKEEPER_MANAGEMENT_CLIENT_KEY", requires = "management_ca_cert")]
    management_client_key: Option<PathBuf>,

    #[arg(long, env = "NODEKEEPER_MANAGEMENT_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    management_connect_timeout_secs: u64,

    /// Node data directories, comma separated.
    #[arg(long, env = "NODEKEEPER_DATA_DIRS", value_delimiter = ',')]
    data_dirs: Vec<PathBuf>,

    /// Root for files staged by `IMPORT` restores.
    #[arg(long, env = "NODEKEEPER_RESTORE_STAGING_DIR")]
    restore_staging_dir: Option<PathBuf>,

    /// Node commit log directory.
    #[arg(long, env = "NODEKEEPER_COMMITLOG_DIR")]
    commitlog_dir: Option<PathBuf>,

    /// Directory the node archives finished commit log segments into.
    #[arg(long, env = "NODEKEEPER_COMMITLOG_ARCHIVE_DIR")]
    commitlog_archive_dir: Option<PathBuf>,

    /// Operations executing at once.
    #[arg(long, env = "NODEKEEPER_MAX_WORKERS", default_value_t = 4)]
    max_workers: usize,

    /// How long finished operations stay queryable.
    #[arg(long, env = "NODEKEEPER_RETENTION_SECS", default_value_t = 3600)]
    retention_secs: u64,

    #[arg(long, env = "NODEKEEPER_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Makes the `truncate` operation type submittable.
    #[arg(long, env = "NODEKEEPER_ENABLE_TRUNCATE")]
    enable_truncate: bool,

    /// How long shutdown waits for running operations to stop.
    #[arg(long, env = "NODEKEEPER_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "NODEKEEPER_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "NODEKEEPER_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_workers: self.max_workers,
            retention_ms: self.retention_secs.saturating_mul(1000),
            sweep_interval_ms: self.sweep_interval_secs.saturating_mul(1000),
            enable_truncate: self.enable_truncate,
            shutdown_grace_ms: self.shutdown_grace_secs.saturating_mul(1000),
        }
    }

    fn network_config(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors_origins.clone(),
            ..NetworkConfig::default()
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        let tls = match (
            &self.management_ca_cert,
            &self.management_client_cert,
            &self.management_client_key,
        ) {
            (Some(ca_cert), Some(client_cert), Some(client_key)) => Some(ManagementTls {
                ca_cert: ca_cert.clone(),
                client_cert: client_cert.clone(),
                client_key: client_key.clone(),
            }),
            _ => None,
        };
        ConnectionInfo {
            address: self.management_address.clone(),
            username: self.management_user.clone(),
            password: self.management_password.clone(),
            tls,
            connect_timeout: Duration::from_secs(self.management_connect_timeout_secs),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        tracing_subscriber::fmt()
            .with_ansi(ansi)
            .with_env_filter(filter)
            .init();
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Some(port) = cli.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("installing Prometheus exporter")?;
        info!(port, "serving metrics");
    }
    nodekeeper_server::service::metrics::describe();

    let management = HttpManagementClient::new(&cli.connection_info())
        .context("building management client")?;
    let deps = ExecutorDeps::new(
        Arc::new(management),
        StorageProviders::with_local(),
        NodePaths {
            data_dirs: cli.data_dirs.clone(),
            staging_dir: cli.restore_staging_dir.clone(),
            commitlog_dir: cli.commitlog_dir.clone(),
            commitlog_archive_dir: cli.commitlog_archive_dir.clone(),
        },
    );

    let engine = cli.engine_config();
    let grace = Duration::from_millis(engine.shutdown_grace_ms);
    let registry = builtin_registry(&deps, engine.enable_truncate)
        .context("building operation registry")?;
    let scheduler = Scheduler::new(Arc::new(registry), engine, Arc::new(SystemClock));
    let types: Vec<_> = scheduler.types().into_iter().map(|t| t.name).collect();

    let shutdown = Arc::new(ShutdownController::new(scheduler.clone()));
    let mut sweeper = ExpirySweeper::spawn(scheduler.clone());

    let mut network = NetworkModule::new(cli.network_config(), scheduler, Arc::clone(&shutdown));
    let port = network.start().await?;
    info!(port, ?types, "nodekeeper started");

    let trigger = Arc::clone(&shutdown);
    network
        .serve(async move {
            shutdown_signal().await;
            trigger.trigger_shutdown();
        })
        .await?;

    // Covers a server that stopped on its own.
    shutdown.trigger_shutdown();
    let outcome = shutdown.drain(grace).await;
    if outcome.is_complete() {
        info!("all operations stopped");
    } else {
        warn!(
            requests_drained = outcome.requests_drained,
            operations_drained = outcome.operations_drained,
            grace_secs = grace.as_secs(),
            "shutdown grace period expired; abandoning remaining work"
        );
    }
    sweeper.stop().await;
    Ok(())
}
