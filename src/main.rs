use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cloud_lb_controller::{
    config::{CloudConfig, LogFormat, ReconcileOptions, RunArgs},
    controller::{self, needs_load_balancer, EventRecorder, KubeEventRecorder},
    provider::{memory::MemoryCloud, CloudProvider},
};
use k8s_openapi::api::core::v1::Service;
use kube::{Api, ResourceExt};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const COMPONENT: &str = "lb-controller";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// List load balancer Services and their published addresses
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Limit the listing to one namespace
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Cloud LB Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let api: Api<Service> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let services = api.list(&Default::default()).await?;

    let managed: Vec<&Service> = services
        .items
        .iter()
        .filter(|svc| needs_load_balancer(svc))
        .collect();
    println!("Managed load balancer Services: {}", managed.len());
    for svc in managed {
        let address = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .unwrap_or_else(|| "<pending>".to_string());
        println!(
            "  {}/{}  {}",
            svc.namespace().unwrap_or_default(),
            svc.name_any(),
            address
        );
    }
    Ok(())
}

async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    info!(
        "Starting Cloud LB Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cloud = match &args.cloud_config {
        Some(path) => CloudConfig::load(path)?,
        None => CloudConfig::default(),
    };
    let opts = Arc::new(ReconcileOptions::from_sources(&args, &cloud)?);
    info!(
        cluster_id = %opts.cluster_id,
        vpc_id = %opts.vpc_id,
        region = %opts.region,
        backend_type = ?opts.default_backend_type,
        "Loaded configuration"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    if !args.dry_run {
        bail!("no cloud SDK provider is built into this binary, run with --dry-run");
    }
    warn!("Dry-run mode: load balancers are reconciled against an in-memory cloud");
    let provider: Arc<dyn CloudProvider> = Arc::new(MemoryCloud::new());
    let recorder: Arc<dyn EventRecorder> =
        Arc::new(KubeEventRecorder::new(client.clone(), COMPONENT));

    let state = Arc::new(controller::ControllerState {
        client,
        provider,
        recorder,
        opts,
        concurrency: args.concurrent_service_syncs,
    });

    controller::run_controller(state).await?;
    info!("Controller stopped");
    Ok(())
}
