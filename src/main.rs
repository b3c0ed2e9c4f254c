//! lifecycle-sentinel
//!
//! Node-termination lifecycle controller.
//!
//! ## Usage
//!
//! ```bash
//! # Watch a queue and drain terminating nodes
//! lifecycle-sentinel serve --region us-west-2 --queue-name lifecycle-hooks
//!
//! # Local development against a kubeconfig
//! lifecycle-sentinel serve --region us-west-2 --queue-name lifecycle-hooks \
//!     --local-mode ~/.kube/config --with-deregister false
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use lifecycle_sentinel::{
    AutoScalingGroups, ClassicBalancerService, KubeClusterNodes, KubectlRunner, Manager, Services,
    Settings, SqsQueue, TargetGroupService,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lifecycle-sentinel")]
#[command(about = "Node-termination lifecycle controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watching lifecycle events for a given queue
    Serve {
        /// Absolute path to a kubeconfig, uses in-cluster auth when unset
        #[arg(long)]
        local_mode: Option<String>,

        /// AWS region to operate in
        #[arg(long)]
        region: String,

        /// Name of the queue to consume lifecycle hooks from
        #[arg(long)]
        queue_name: String,

        /// Path to the kubectl binary
        #[arg(long, default_value = "/usr/local/bin/kubectl")]
        kubectl_path: String,

        /// Logging level (info, warn, debug)
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Hard time limit in seconds for a node drain
        #[arg(long, default_value_t = 300)]
        drain_timeout: i64,

        /// Interval in seconds between drain retries
        #[arg(long, default_value_t = 30)]
        drain_interval: i64,

        /// Interval in seconds for queue long polling
        #[arg(long, default_value_t = 10)]
        polling_interval: i64,

        /// Deregister terminating instances from load balancer pools
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        with_deregister: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            local_mode,
            region,
            queue_name,
            kubectl_path,
            log_level,
            drain_timeout,
            drain_interval,
            polling_interval,
            with_deregister,
        } => {
            serve(
                local_mode,
                region,
                queue_name,
                kubectl_path,
                log_level,
                drain_timeout,
                drain_interval,
                polling_interval,
                with_deregister,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    local_mode: Option<String>,
    region: String,
    queue_name: String,
    kubectl_path: String,
    log_level: String,
    drain_timeout: i64,
    drain_interval: i64,
    polling_interval: i64,
    with_deregister: bool,
) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "lifecycle_sentinel={log_level},{log_level}"
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !Path::new(&kubectl_path).exists() {
        anyhow::bail!("provided kubectl path does not exist: {kubectl_path}");
    }
    if let Some(ref kubeconfig) = local_mode {
        if !Path::new(kubeconfig).exists() {
            anyhow::bail!("provided kubeconfig path does not exist: {kubeconfig}");
        }
    }

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.clone()))
        .load()
        .await;

    let kube_client = match local_mode {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("cannot load kubernetes config from '{path}'"))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("cannot build kubernetes config")?;
            kube::Client::try_from(config).context("cannot create kubernetes client")?
        }
        None => kube::Client::try_default()
            .await
            .context("cannot load kubernetes config from in-cluster environment")?,
    };

    let services = Services {
        scaling: Arc::new(AutoScalingGroups::new(aws_sdk_autoscaling::Client::new(
            &aws_config,
        ))),
        queue: Arc::new(SqsQueue::new(aws_sdk_sqs::Client::new(&aws_config))),
        target_groups: Arc::new(TargetGroupService::new(
            aws_sdk_elasticloadbalancingv2::Client::new(&aws_config),
        )),
        classic_balancers: Arc::new(ClassicBalancerService::new(
            aws_sdk_elasticloadbalancing::Client::new(&aws_config),
        )),
        cluster: Arc::new(KubeClusterNodes::new(kube_client)),
        drainer: Arc::new(KubectlRunner::new(kubectl_path.clone())),
    };

    let settings = Settings {
        region,
        queue_name,
        kubectl_path,
        drain_timeout_seconds: drain_timeout,
        drain_retry_interval_seconds: drain_interval,
        polling_interval_seconds: polling_interval,
        with_deregister,
        ..Settings::default()
    };

    let manager = Arc::new(Manager::new(services, settings));
    manager
        .start()
        .await
        .context("lifecycle-sentinel service failed")
}
