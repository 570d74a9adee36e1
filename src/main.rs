//! Stash Kubernetes Operator
//!
//! Main entry point. `run` starts the controllers; `recover` and `check` run
//! inside the jobs the operator launches; `launch-check` is called by the
//! backup container to start a repository check.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stash_operator::{
    adapters::{ClusterApi, KubeCluster, KubeEventPublisher},
    config::OperatorConfig,
    controllers::{self, Context},
    metrics,
    reconcilers::{launch_check_job, rbac::sidecar_cluster_role},
    restic::ResticCli,
    runner::JobRunner,
    Error,
};

/// Stash - restic backups for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "stash-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(OperatorConfig),

    /// Restore the paths of a Recovery (runs inside the recovery job)
    Recover(RecoverArgs),

    /// Check a Restic repository (runs inside the check job)
    Check(CheckArgs),

    /// Create the check job of a Restic
    LaunchCheck(LaunchCheckArgs),
}

/// Options shared by the commands that run inside pods
#[derive(Args, Debug)]
struct PodArgs {
    /// Namespace of the triggering object; defaults to the pod's namespace
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long, default_value = "restic")]
    restic_binary: PathBuf,

    /// Writable directory for the restic cache and credential files
    #[arg(long, default_value = "/tmp")]
    scratch_dir: PathBuf,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_analytics: bool,
}

#[derive(Args, Debug)]
struct RecoverArgs {
    #[arg(long)]
    recovery_name: String,

    #[command(flatten)]
    pod: PodArgs,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    restic_name: String,

    #[arg(long)]
    host_name: String,

    #[arg(long)]
    smart_prefix: String,

    #[command(flatten)]
    pod: PodArgs,
}

#[derive(Args, Debug)]
struct LaunchCheckArgs {
    #[arg(long)]
    restic_name: String,

    #[arg(long)]
    host_name: String,

    #[arg(long)]
    smart_prefix: String,

    #[arg(long)]
    namespace: Option<String>,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    match Cli::parse().command {
        Commands::Run(config) => run(config).await,
        Commands::Recover(args) => recover(args).await,
        Commands::Check(args) => check(args).await,
        Commands::LaunchCheck(args) => launch_check(args).await,
    }
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    info!("Starting Stash operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let context = Arc::new(Context::new(client, config));

    if context.config.enable_rbac {
        context
            .cluster
            .apply_cluster_role(&sidecar_cluster_role())
            .await?;
        info!("Applied sidecar cluster role");
    }

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(context.config.ops_address));

    let shutdown = CancellationToken::new();
    let recovery_controller =
        controllers::run_recovery_controller(context.clone(), shutdown.clone());
    let restic_controller = controllers::run_restic_controller(context.clone(), shutdown.clone());
    let mut running = tokio::spawn(async move {
        tokio::join!(recovery_controller, restic_controller);
    });

    // Handle graceful shutdown
    let signalled = tokio::select! {
        _ = &mut running => {
            error!("Controllers exited unexpectedly");
            false
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
            false
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
            true
        }
    };

    shutdown.cancel();
    if signalled {
        if let Err(e) = running.await {
            error!(error = %e, "Controllers did not stop cleanly");
        }
    }

    info!("Stash operator stopped");
    Ok(())
}

async fn recover(args: RecoverArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let namespace = namespace_or_default(args.pod.namespace, &client);
    debug!(enable_analytics = args.pod.enable_analytics, "Starting recovery");

    let runner = job_runner(client);
    let PodArgs {
        restic_binary,
        scratch_dir,
        ..
    } = args.pod;
    let phase = runner
        .recover(&namespace, &args.recovery_name, move |backend, secret, prefix| async move {
            ResticCli::setup(restic_binary, scratch_dir, &backend, &secret, &prefix).await
        })
        .await?;

    info!(recovery = %args.recovery_name, phase = %phase, "Recovery finished");
    Ok(())
}

async fn check(args: CheckArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let namespace = namespace_or_default(args.pod.namespace, &client);
    debug!(
        enable_analytics = args.pod.enable_analytics,
        host = %args.host_name,
        "Starting repository check"
    );

    let runner = job_runner(client);
    let PodArgs {
        restic_binary,
        scratch_dir,
        ..
    } = args.pod;
    runner
        .check(&namespace, &args.restic_name, &args.smart_prefix, move |backend, secret, prefix| async move {
            ResticCli::setup(restic_binary, scratch_dir, &backend, &secret, &prefix).await
        })
        .await?;
    Ok(())
}

async fn launch_check(args: LaunchCheckArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let namespace = namespace_or_default(args.namespace, &client);
    let cluster = KubeCluster::new(client.clone());
    let events = KubeEventPublisher::new(client, None);

    let restic = cluster
        .get_restic(&namespace, &args.restic_name)
        .await?
        .ok_or_else(|| Error::validation(format!("restic {}/{} not found", namespace, args.restic_name)))?;
    let applied = launch_check_job(
        &cluster,
        &events,
        &args.config,
        &restic,
        &args.host_name,
        &args.smart_prefix,
    )
    .await?;

    info!(restic = %args.restic_name, ?applied, "Check job launched");
    Ok(())
}

fn job_runner(client: Client) -> JobRunner {
    JobRunner::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, None)),
    )
}

fn namespace_or_default(namespace: Option<String>, client: &Client) -> String {
    namespace.unwrap_or_else(|| client.default_namespace().to_string())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
