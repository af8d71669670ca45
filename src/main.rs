//! trainkube controller - distributed model training on Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trainkube::cache::{ObjectCache, ReflectorCache};
use trainkube::cluster::KubeClusterApi;
use trainkube::config::ControllerConfig;
use trainkube::controller::{self, Context};
use trainkube::crd::{PullPolicy, TrainingRequest};
use trainkube::resources::{PipelineImages, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use trainkube::retry::{retry_with_backoff, RetryConfig};
use trainkube::FIELD_MANAGER;

/// trainkube - runs TrainingRequests as Kubernetes Jobs
#[derive(Parser, Debug)]
#[command(name = "trainkube", version, about, long_about = None)]
struct Cli {
    /// Print the TrainingRequest CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "TRAINKUBE_NAMESPACE")]
    namespace: Option<String>,

    /// Number of requests reconciled concurrently
    #[arg(long, env = "TRAINKUBE_WORKERS", default_value = "4")]
    workers: u16,

    /// Image of the dataset split Job
    #[arg(long, env = "TRAINKUBE_SPLIT_IMAGE", default_value = "splitjob:latest")]
    split_image: String,

    /// Image of the model update Job
    #[arg(
        long,
        env = "TRAINKUBE_UPDATE_IMAGE",
        default_value = "modelupdatejob:latest"
    )]
    update_image: String,

    /// Pull policy of the split and update images
    #[arg(long, env = "TRAINKUBE_PULL_POLICY", default_value = "IfNotPresent")]
    pull_policy: PullPolicy,

    /// Seconds a Job may run before the training run fails
    #[arg(long, env = "TRAINKUBE_JOB_TIMEOUT_SECS", default_value = "3600")]
    job_timeout_secs: u64,

    /// Seconds to wait for a deleted Job to disappear
    #[arg(long, env = "TRAINKUBE_DELETION_TIMEOUT_SECS", default_value = "120")]
    deletion_timeout_secs: u64,

    /// Seconds a single API call may take
    #[arg(long, env = "TRAINKUBE_API_TIMEOUT_SECS", default_value = "30")]
    api_timeout_secs: u64,

    /// Seconds to wait for the watch caches at startup
    #[arg(long, env = "TRAINKUBE_SYNC_TIMEOUT_SECS", default_value = "120")]
    sync_timeout_secs: u64,

    /// Reconcile attempts per request for transient errors
    #[arg(long, env = "TRAINKUBE_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            max_attempts: self.max_attempts,
            images: PipelineImages {
                split: self.split_image.clone(),
                update: self.update_image.clone(),
                pull_policy: self.pull_policy,
            },
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            deletion_timeout: Duration::from_secs(self.deletion_timeout_secs),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TrainingRequest::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.controller_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    run_controller(&cli, config).await
}

async fn client(kubeconfig: Option<&PathBuf>) -> anyhow::Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to load kubeconfig: {}", e))?;
            Client::try_from(config)
                .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
        }
        None => Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e)),
    }
}

/// Install the TrainingRequest CRD with server-side apply
///
/// Keeps the installed schema in step with the controller version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing TrainingRequest CRD...");
    crds.patch(
        "trainingrequests.trainink8s.dev",
        &params,
        &Patch::Apply(&TrainingRequest::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TrainingRequest CRD: {}", e))?;

    tracing::info!("TrainingRequest CRD installed/updated");
    Ok(())
}

fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Cancel `token` on SIGINT or SIGTERM
fn cancel_on_signal(token: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
        token.cancel();
    });
    Ok(())
}

async fn run_controller(cli: &Cli, config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!("trainkube controller starting...");

    let client = client(cli.kubeconfig.as_ref()).await?;

    // The API server may still be coming up when the controller starts
    let install_retry = RetryConfig {
        max_attempts: 5,
        ..RetryConfig::bounded(Duration::from_secs(1), Duration::from_secs(30))
    };
    retry_with_backoff(&install_retry, "install TrainingRequest CRD", || {
        ensure_crd_installed(&client)
    })
    .await?;

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;

    let namespace = config.namespace.as_deref();
    let managed = watcher::Config::default()
        .labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE));

    let config_maps: Arc<dyn ObjectCache<ConfigMap>> = ReflectorCache::<ConfigMap>::spawn(
        "ConfigMap",
        namespaced_api(&client, namespace),
        managed.clone(),
        shutdown.child_token(),
    );
    let jobs: Arc<dyn ObjectCache<Job>> = ReflectorCache::<Job>::spawn(
        "Job",
        namespaced_api(&client, namespace),
        managed,
        shutdown.child_token(),
    );

    let requests = namespaced_api::<TrainingRequest>(&client, namespace);
    let cluster = Arc::new(KubeClusterApi::new(client, config.api_timeout));
    let ctx = Arc::new(Context::new(config, cluster, config_maps, jobs, &shutdown));

    controller::run(requests, ctx, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Controller failed: {}", e))?;

    tracing::info!("trainkube controller shut down");
    Ok(())
}
