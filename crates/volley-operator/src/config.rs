//! Command line and environment configuration
//!
//! Every flag can also come from an environment variable. Connection
//! settings left empty fall back to files mounted under `/run/secrets`, and
//! the namespace finally falls back to the pod's own namespace.
//!
//! Named metrics sinks are a JSON object mapping sink name to InfluxDB
//! settings, read from `--outputs-file` or the `OUTPUTS` secret file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use volley_client::client::DEFAULT_ENDPOINT;
use volley_common::api::codec::parse_duration;
use volley_common::api::OutputCatalog;

/// Directory holding mounted secret files
pub const SECRETS_DIR: &str = "/run/secrets";
/// Namespace file of the pod's service account
pub const SERVICE_ACCOUNT_NAMESPACE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
/// Namespace used when nothing else names one
pub const DEFAULT_NAMESPACE: &str = "default";

/// volley operator: runs distributed k6 load tests for one location
#[derive(Parser, Debug, Clone)]
#[command(name = "volley-operator", version, about, long_about = None)]
pub struct Cli {
    /// Location slug this operator serves
    #[arg(long, env = "VOLLEY_REGION")]
    pub region: Option<String>,

    /// Namespace workers run in
    #[arg(long, env = "VOLLEY_NAMESPACE")]
    pub namespace: Option<String>,

    /// Base URL of the tracking API
    #[arg(long, env = "VOLLEY_API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    /// Tracking API user
    #[arg(long, env = "VOLLEY_API_USER")]
    pub api_user: Option<String>,

    /// Tracking API password
    #[arg(long, env = "VOLLEY_API_PASSWORD", hide_env_values = true)]
    pub api_password: Option<String>,

    /// Address for the /healthz and /readyz endpoints
    #[arg(long, default_value = ":8081", value_parser = parse_bind_address)]
    pub health_probe_bind_address: SocketAddr,

    /// Run controllers only while holding the leader lease
    #[arg(long)]
    pub leader_elect: bool,

    /// Time between polls of the tracking API
    #[arg(long, default_value = "5s", value_parser = parse_duration_arg)]
    pub poll_interval: Duration,

    /// How long a worker must have been ready before it counts as online
    #[arg(long, default_value = "1s", value_parser = parse_duration_arg)]
    pub stability_window: Duration,

    /// Concurrent reconcile workers
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Path to a kubeconfig; in-cluster configuration when absent
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Directory of fallback secret files
    #[arg(long, default_value = SECRETS_DIR)]
    pub secrets_dir: PathBuf,

    /// JSON file of named metrics sinks
    #[arg(long, env = "VOLLEY_OUTPUTS_FILE")]
    pub outputs_file: Option<PathBuf>,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// Parse `host:port`, or `:port` meaning every interface
pub fn parse_bind_address(s: &str) -> Result<SocketAddr, String> {
    let full = match s.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => s.to_string(),
    };
    full.parse()
        .map_err(|e| format!("invalid bind address '{}': {}", s, e))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No flag, env var, or secret file names the location
    #[error("no region configured: pass --region, set VOLLEY_REGION, or mount {0}/REGION")]
    MissingRegion(String),

    /// The metrics sink file can't be read
    #[error("failed to read metrics sinks from {path}: {source}")]
    OutputsUnreadable {
        /// File that was read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The metrics sink file isn't a JSON object of sink settings
    #[error("invalid metrics sinks in {path}: {source}")]
    OutputsInvalid {
        /// File that was parsed
        path: String,
        /// Underlying decode error
        source: serde_json::Error,
    },
}

/// Where fallback values come from
#[derive(Clone, Debug)]
pub struct Sources {
    /// Directory of secret files
    pub secrets_dir: PathBuf,
    /// `POD_NAMESPACE`, when set
    pub pod_namespace: Option<String>,
    /// Service account namespace file
    pub service_account_namespace: PathBuf,
}

impl Sources {
    /// Sources for a process running in a pod
    pub fn from_env(secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            pod_namespace: std::env::var("POD_NAMESPACE").ok(),
            service_account_namespace: PathBuf::from(SERVICE_ACCOUNT_NAMESPACE),
        }
    }

    fn secret(&self, name: &str) -> Option<String> {
        read_trimmed(&self.secrets_dir.join(name))
    }
}

/// Load named sinks from `explicit`, else from the `OUTPUTS` secret file
///
/// An explicit file must exist; a missing secret file means no named sinks.
fn load_outputs(explicit: Option<&Path>, sources: &Sources) -> Result<OutputCatalog, ConfigError> {
    let fallback = sources.secrets_dir.join("OUTPUTS");
    let path = match explicit {
        Some(path) => path,
        None if fallback.is_file() => fallback.as_path(),
        None => return Ok(OutputCatalog::new()),
    };
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::OutputsUnreadable {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::OutputsInvalid {
        path: path.display().to_string(),
        source,
    })
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Fully resolved operator settings
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Location slug
    pub region: String,
    /// Namespace for workloads, the leader lease, and pod lookups
    pub namespace: String,
    /// Tracking API base URL
    pub api_endpoint: String,
    /// Tracking API user
    pub api_user: Option<String>,
    /// Tracking API password
    pub api_password: Option<String>,
    /// Probe server address
    pub health_addr: SocketAddr,
    /// Whether to take part in leader election
    pub leader_elect: bool,
    /// Tracking API poll interval
    pub poll_interval: Duration,
    /// Worker readiness stability window
    pub stability_window: Duration,
    /// Concurrent reconcile workers, at least one
    pub workers: usize,
    /// Explicit kubeconfig
    pub kubeconfig: Option<PathBuf>,
    /// Named metrics sinks
    pub outputs: OutputCatalog,
}

impl OperatorConfig {
    /// Resolve flags against the fallbacks in `sources`
    pub fn resolve(cli: Cli, sources: &Sources) -> Result<Self, ConfigError> {
        let region = non_empty(cli.region)
            .or_else(|| sources.secret("REGION"))
            .ok_or_else(|| ConfigError::MissingRegion(sources.secrets_dir.display().to_string()))?;

        let namespace = non_empty(cli.namespace)
            .or_else(|| sources.secret("JOBS_NAMESPACE"))
            .or_else(|| non_empty(sources.pod_namespace.clone()))
            .or_else(|| read_trimmed(&sources.service_account_namespace))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let api_endpoint = non_empty(cli.api_endpoint)
            .or_else(|| sources.secret("API_ENDPOINT"))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let outputs = load_outputs(cli.outputs_file.as_deref(), sources)?;

        Ok(Self {
            region,
            namespace,
            api_endpoint,
            api_user: non_empty(cli.api_user).or_else(|| sources.secret("API_USER")),
            api_password: non_empty(cli.api_password).or_else(|| sources.secret("API_PASSWORD")),
            health_addr: cli.health_probe_bind_address,
            leader_elect: cli.leader_elect,
            poll_interval: cli.poll_interval,
            stability_window: cli.stability_window,
            workers: cli.workers.max(1),
            kubeconfig: cli.kubeconfig,
            outputs,
        })
    }
}
