//! Cluster connection bootstrap from kubeconfig, in-cluster config or an explicit host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kman_core::EngineConfig;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::DynamicClient;
use crate::cluster::KubeBackend;
use crate::mapping::RestMapper;

/// How to reach the API server. Credentials themselves stay in the kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Overrides the server URL from whatever config was loaded.
    pub host: Option<String>,
    pub insecure: bool,
    pub config_path: Option<String>,
    pub context: Option<String>,
    pub cluster: Option<String>,
    pub user: Option<String>,
    /// When false, skip kubeconfig files entirely.
    pub load_config_file: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self { host: None, insecure: false, config_path: None, context: None, cluster: None, user: None, load_config_file: true }
    }
}

fn env_nonempty(key: &str) -> Option<String> { std::env::var(key).ok().filter(|v| !v.is_empty()) }

fn env_flag(key: &str, default: bool) -> bool {
    match env_nonempty(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl ConnectionParams {
    /// `KUBE_HOST`, `KUBE_INSECURE`, `KUBE_CONFIG` (else first `KUBECONFIG` entry),
    /// `KUBE_CTX`, `KUBE_CTX_CLUSTER`, `KUBE_CTX_AUTH_INFO`, `KUBE_LOAD_CONFIG_FILE`.
    pub fn from_env() -> Self {
        let config_path = env_nonempty("KUBE_CONFIG").or_else(|| {
            std::env::var_os("KUBECONFIG")
                .and_then(|v| std::env::split_paths(&v).next())
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
        });
        Self {
            host: env_nonempty("KUBE_HOST"),
            insecure: env_flag("KUBE_INSECURE", false),
            config_path,
            context: env_nonempty("KUBE_CTX"),
            cluster: env_nonempty("KUBE_CTX_CLUSTER"),
            user: env_nonempty("KUBE_CTX_AUTH_INFO"),
            load_config_file: env_flag("KUBE_LOAD_CONFIG_FILE", true),
        }
    }

    fn kubeconfig_options(&self) -> KubeConfigOptions {
        KubeConfigOptions { context: self.context.clone(), cluster: self.cluster.clone(), user: self.user.clone() }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| if path == "~" { Some("") } else { None }) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

async fn load_config(params: &ConnectionParams) -> Result<Config> {
    if params.load_config_file {
        let opts = params.kubeconfig_options();
        match params.config_path.as_deref() {
            Some(raw) => {
                let path = expand_home(raw);
                if path.exists() {
                    let kc = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                    let cfg = Config::from_custom_kubeconfig(kc, &opts)
                        .await
                        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
                    debug!(path = %path.display(), "kubeconfig loaded");
                    return Ok(cfg);
                }
                info!(path = %path.display(), "kubeconfig not found; trying other sources");
            }
            None => match Config::from_kubeconfig(&opts).await {
                Ok(cfg) => return Ok(cfg),
                Err(e) => debug!(error = %e, "no default kubeconfig"),
            },
        }
    }
    if params.host.is_none() {
        match Config::incluster() {
            Ok(cfg) => {
                debug!("using in-cluster config");
                return Ok(cfg);
            }
            Err(e) => debug!(error = %e, "not running in cluster"),
        }
    }
    let host = params.host.as_deref().ok_or_else(|| anyhow!("no kubeconfig, not in a cluster, and no host configured"))?;
    Ok(Config::new(host.parse().with_context(|| format!("parsing host {:?}", host))?))
}

/// Build a kube client for `params`.
pub async fn connect(params: &ConnectionParams) -> Result<Client> {
    let mut config = load_config(params).await?;
    if let Some(host) = params.host.as_deref() {
        config.cluster_url = host.parse().with_context(|| format!("parsing host {:?}", host))?;
    }
    if params.insecure {
        config.accept_invalid_certs = true;
    }
    info!(url = %config.cluster_url, default_ns = %config.default_namespace, insecure = params.insecure, "kube client configured");
    Client::try_from(config).context("building kube client")
}

impl DynamicClient {
    /// Connect and wire a mapper and backend over one shared kube client.
    pub async fn connect(params: &ConnectionParams, cfg: EngineConfig) -> Result<Self> {
        let backend = Arc::new(KubeBackend::new(connect(params).await?));
        let mapper = Arc::new(RestMapper::new(backend.clone(), &cfg));
        Ok(DynamicClient::new(mapper, backend, cfg))
    }
}
