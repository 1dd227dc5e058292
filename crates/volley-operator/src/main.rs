//! volley operator: runs distributed k6 load tests for one location

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use volley_client::{default_registry, ClientConfig, Pinger, RemoteClient, WatchOptions};
use volley_common::kube_utils::create_client;
use volley_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use volley_common::telemetry::{init_telemetry, TelemetryConfig};
use volley_job::{
    run_controller, IgniterIndex, JobContext, KubeWorkloadClient, RunnerConfig, Settings,
    WorkerControl,
};
use volley_operator::health::{start_health_server, Readiness};
use volley_operator::shutdown::install_shutdown_handler;
use volley_operator::{Cli, OperatorConfig, Sources};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let sources = Sources::from_env(&cli.secrets_dir);
    let config = OperatorConfig::resolve(cli, &sources)?;

    init_telemetry(TelemetryConfig::controller(
        config.region.clone(),
        config.namespace.clone(),
    ))?;

    run(config).await
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    info!(
        region = %config.region,
        namespace = %config.namespace,
        endpoint = %config.api_endpoint,
        leader_elect = config.leader_elect,
        sinks = config.outputs.len(),
        "starting volley operator"
    );

    let root = CancellationToken::new();
    install_shutdown_handler(root.clone());

    let readiness = Readiness::default();
    let health = tokio::spawn(start_health_server(
        config.health_addr,
        readiness.clone(),
        root.clone(),
    ));

    let kube = create_client(config.kubeconfig.as_deref()).await?;

    let mut client_config =
        ClientConfig::new(config.region.clone()).with_endpoint(config.api_endpoint.clone());
    if let (Some(user), Some(password)) = (&config.api_user, &config.api_password) {
        client_config = client_config.with_credentials(user.clone(), password.clone());
    } else {
        warn!("no tracking API credentials configured");
    }
    let remote = RemoteClient::new(client_config, Arc::new(default_registry()))?;

    let pinger = tokio::spawn(Pinger::new(remote.clone()).run(root.clone()));

    let mut guard = if config.leader_elect {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("volley-operator-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            kube.clone(),
            LEADER_LEASE_NAME,
            &config.namespace,
            &identity,
        ));
        tokio::select! {
            _ = root.cancelled() => None,
            acquired = elector.acquire() => Some(acquired?),
        }
    } else {
        None
    };

    let mut lost_leadership = false;
    if !root.is_cancelled() {
        let controllers = root.child_token();
        let workloads = Arc::new(KubeWorkloadClient::new(kube.clone()));
        let control: Arc<dyn WorkerControl> = workloads.clone();
        let igniters = Arc::new(IgniterIndex::new(
            control,
            config.namespace.clone(),
            controllers.clone(),
        ));
        let settings = Settings::new(config.namespace.clone(), config.region.clone())
            .with_stability_window(config.stability_window)
            .with_outputs(config.outputs.clone());
        let ctx = Arc::new(JobContext::new(
            Arc::new(remote.clone()),
            workloads,
            igniters,
            settings,
        ));
        let runner = RunnerConfig {
            workers: config.workers,
            watch: WatchOptions {
                interval: config.poll_interval,
                ..Default::default()
            },
            ..Default::default()
        };

        let controller = run_controller(ctx, remote, Some(kube), runner, controllers.clone());
        tokio::pin!(controller);
        readiness.set(true);

        let leadership_lost = async {
            match guard.as_mut() {
                Some(g) => g.lost().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = &mut controller => result?,
            _ = leadership_lost => {
                error!("leadership lost, stopping controllers");
                lost_leadership = true;
                controllers.cancel();
                controller.await?;
            }
        }
        readiness.set(false);
    }

    if let Some(guard) = guard.take() {
        if !lost_leadership {
            if let Err(e) = guard.release_leadership().await {
                warn!(error = %e, "failed to release leadership");
            }
        }
    }

    root.cancel();
    let _ = pinger.await;
    let _ = health.await;

    if lost_leadership {
        anyhow::bail!("leadership lost");
    }
    info!("volley operator stopped");
    Ok(())
}
