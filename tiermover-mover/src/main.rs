//! TierMover
//!
//! Moves block replicas to the storage types their policy requires and
//! exits with the run's status code.

use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tiermover_mover::{
    resolve_namespace_paths, run_with_shutdown, ExitStatus, MoverConfig, NamespaceConnector,
    NamespaceId, NamespacePaths, SimulatedCluster,
};

#[derive(Parser)]
#[command(name = "tiermover")]
#[command(about = "Move block replicas to the storage types required by their storage policy")]
struct Cli {
    /// Files or directories to migrate; `ns://<namespace>/<path>` when several namespaces are given
    #[arg(short = 'p', long = "path", num_args = 1..)]
    paths: Vec<String>,

    /// Namespace description (TOML), one per namespace
    #[arg(long = "cluster", env = "TIERMOVER_CLUSTER", value_delimiter = ',', required = true)]
    clusters: Vec<PathBuf>,

    /// Attempts per move before it is given up
    #[arg(long)]
    max_retry_attempts: Option<u32>,

    /// Iterations without progress before giving up
    #[arg(long)]
    max_no_progress_iterations: Option<u32>,

    /// Concurrent moves per node
    #[arg(long)]
    max_moves_per_node: Option<usize>,

    /// Concurrent moves per namespace
    #[arg(long)]
    max_concurrent_moves: Option<usize>,

    /// Pause between iterations in milliseconds
    #[arg(long)]
    iteration_interval_ms: Option<u64>,

    /// Upper bound on iterations (0 = unbounded)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Print the final status as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

impl Cli {
    /// Environment configuration with command line overrides
    fn config(&self) -> Result<MoverConfig, ExitStatus> {
        let mut config =
            MoverConfig::from_env().map_err(|e| ExitStatus::IllegalArguments(e.to_string()))?;

        if let Some(v) = self.max_retry_attempts {
            config.max_retry_attempts = v;
        }
        if let Some(v) = self.max_no_progress_iterations {
            config.max_no_progress_iterations = v;
        }
        if let Some(v) = self.max_moves_per_node {
            config.max_moves_per_node = v;
        }
        if let Some(v) = self.max_concurrent_moves {
            config.max_concurrent_moves = v;
        }
        if let Some(v) = self.iteration_interval_ms {
            config.iteration_interval_ms = v;
        }
        if let Some(v) = self.max_iterations {
            config.max_iterations = v;
        }

        config
            .validate()
            .map_err(|e| ExitStatus::IllegalArguments(e.to_string()))?;
        Ok(config)
    }
}

fn load_clusters(
    files: &[PathBuf],
) -> anyhow::Result<HashMap<NamespaceId, Arc<dyn NamespaceConnector>>> {
    let mut connectors: HashMap<NamespaceId, Arc<dyn NamespaceConnector>> = HashMap::new();
    for file in files {
        let cluster = SimulatedCluster::load(file)
            .with_context(|| format!("failed to load cluster {}", file.display()))?;
        let namespace = cluster.namespace().clone();
        if connectors.contains_key(&namespace) {
            anyhow::bail!("namespace {} defined twice", namespace);
        }
        info!(namespace = %namespace, file = %file.display(), "Loaded namespace");
        connectors.insert(namespace, Arc::new(cluster));
    }
    Ok(connectors)
}

fn prepare(
    cli: &Cli,
) -> Result<
    (
        NamespacePaths,
        HashMap<NamespaceId, Arc<dyn NamespaceConnector>>,
        MoverConfig,
    ),
    ExitStatus,
> {
    let config = cli.config()?;
    let connectors =
        load_clusters(&cli.clusters).map_err(|e| ExitStatus::IoException(format!("{:#}", e)))?;

    let mut namespaces: Vec<NamespaceId> = connectors.keys().cloned().collect();
    namespaces.sort();
    let namespace_paths = resolve_namespace_paths(&namespaces, &cli.paths)
        .map_err(|e| ExitStatus::IllegalArguments(e.to_string()))?;

    Ok((namespace_paths, connectors, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!(
        paths = ?cli.paths,
        clusters = cli.clusters.len(),
        "Starting tiermover"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let status = match prepare(&cli) {
        Ok((namespace_paths, connectors, config)) => {
            run_with_shutdown(namespace_paths, connectors, &config, shutdown_rx).await
        }
        Err(status) => status,
    };

    if cli.json {
        let summary = serde_json::json!({
            "status": status.name(),
            "code": status.code(),
            "reason": status.reason(),
        });
        println!("{}", summary);
    } else {
        println!("{}", status);
    }
    std::process::exit(status.code());
}
