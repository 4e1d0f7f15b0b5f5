//! Controller configuration
//!
//! Settings come from three places, later ones winning:
//! 1. built-in defaults
//! 2. the YAML cloud config file (`--cloud-config`)
//! 3. command line flags / environment variables
//!
//! The result is folded into a [`ReconcileOptions`] value that is passed
//! explicitly to every stage of the pipeline.

use std::path::Path;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::BackendType;
use crate::retry::RetryConfig;

pub const DEFAULT_SERVER_GROUP_CONCURRENCY: usize = 5;
pub const DEFAULT_CONCURRENT_SERVICE_SYNCS: u16 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flags for the `run` subcommand
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the YAML cloud config file
    #[arg(long, env = "CLOUD_CONFIG")]
    pub cloud_config: Option<String>,

    /// Cluster id, stamped into every resource name the controller creates
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// VPC the cluster runs in
    #[arg(long, env = "VPC_ID")]
    pub vpc_id: Option<String>,

    /// Cloud region
    #[arg(long, env = "REGION_ID")]
    pub region: Option<String>,

    /// Maximum number of Services reconciled in parallel
    #[arg(long, env = "CONCURRENT_SERVICE_SYNCS", default_value_t = DEFAULT_CONCURRENT_SERVICE_SYNCS)]
    pub concurrent_service_syncs: u16,

    /// Worker pool size for server group actions inside one reconcile
    #[arg(long, env = "SERVER_GROUP_CONCURRENCY", default_value_t = DEFAULT_SERVER_GROUP_CONCURRENCY)]
    pub server_group_concurrency: usize,

    /// Read backends from EndpointSlices instead of Endpoints
    #[arg(long, env = "ENDPOINT_SLICE")]
    pub endpoint_slice: bool,

    /// Include IPv6 endpoint addresses
    #[arg(long, env = "DUAL_STACK")]
    pub dual_stack: bool,

    /// Reconcile against an in-memory cloud instead of the real one
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Root of the YAML cloud config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default)]
    pub global: GlobalConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub region: Option<String>,
    pub vpc_id: Option<String>,
    pub cluster_id: Option<String>,
    pub zone_id: Option<String>,
    pub vswitch_id: Option<String>,
    /// `eni` routes every Service straight to pods
    pub service_backend_type: Option<String>,
}

impl CloudConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read cloud config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }
}

/// Everything a single reconcile needs to know about its environment
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub cluster_id: String,
    pub vpc_id: String,
    pub region: String,
    pub zone_id: Option<String>,
    pub vswitch_id: Option<String>,
    pub endpoint_slice_enabled: bool,
    pub dual_stack_enabled: bool,
    /// Cluster-wide default when a Service carries no backend-type annotation
    pub default_backend_type: BackendType,
    pub server_group_concurrency: usize,
    /// Requeue delay when some targets are potentially ready
    pub requeue_delay: Duration,
    pub reconcile_timeout: Duration,
    pub job_poll_interval: Duration,
    pub job_timeout: Duration,
    pub conflict_retry: RetryConfig,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            cluster_id: "default-cluster".to_string(),
            vpc_id: String::new(),
            region: String::new(),
            zone_id: None,
            vswitch_id: None,
            endpoint_slice_enabled: false,
            dual_stack_enabled: false,
            default_backend_type: BackendType::Ecs,
            server_group_concurrency: DEFAULT_SERVER_GROUP_CONCURRENCY,
            requeue_delay: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(300),
            job_poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            conflict_retry: RetryConfig::default(),
        }
    }
}

impl ReconcileOptions {
    /// Merge the cloud config file and command line flags
    pub fn from_sources(args: &RunArgs, cloud: &CloudConfig) -> Result<Self> {
        let global = &cloud.global;
        let mut opts = ReconcileOptions::default();

        opts.cluster_id = args
            .cluster_id
            .clone()
            .or_else(|| global.cluster_id.clone())
            .ok_or_else(|| Error::ConfigError("cluster id is required".to_string()))?;
        opts.vpc_id = args
            .vpc_id
            .clone()
            .or_else(|| global.vpc_id.clone())
            .unwrap_or_default();
        opts.region = args
            .region
            .clone()
            .or_else(|| global.region.clone())
            .unwrap_or_default();
        opts.zone_id = global.zone_id.clone();
        opts.vswitch_id = global.vswitch_id.clone();
        opts.endpoint_slice_enabled = args.endpoint_slice;
        opts.dual_stack_enabled = args.dual_stack;

        if let Some(kind) = global.service_backend_type.as_deref() {
            opts.default_backend_type = kind.parse()?;
        }

        if args.server_group_concurrency == 0 {
            return Err(Error::ConfigError(
                "server group concurrency must be at least 1".to_string(),
            ));
        }
        opts.server_group_concurrency = args.server_group_concurrency;

        if opts.cluster_id.trim().is_empty() {
            return Err(Error::ConfigError("cluster id must not be empty".to_string()));
        }

        Ok(opts)
    }
}
