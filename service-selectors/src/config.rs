//! Exporter configuration options.
//!
//! We use `serde` to parse these options from the TOML config file,
//! and to write the default configuration to the TOML config file,
//! therefore the structs derive [`serde::Deserialize`] and [`serde::Serialize`].

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    collector::FetchSettings,
    k8s::{IN_CLUSTER_CA_PATH, TokenRetrievalConfig},
};

pub const DEFAULT_PORT: u16 = 30091;
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Where `kubectl proxy` listens by default.
const KUBECTL_PROXY_URL: &str = "http://127.0.0.1:8001";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to listen to.
    pub host: String,
    /// Port of the `/metrics` endpoint.
    pub port: u16,
    /// Namespaces to watch. Services of all the namespaces are listed if empty.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Timeout of each request to the K8S API.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum number of services returned by each request to the K8S API.
    pub page_size: u32,
    /// URL of the K8S API.
    ///
    /// If not set, the in-cluster address is used when running in a pod,
    /// and the address of `kubectl proxy` otherwise.
    pub k8s_api_url: Option<String>,
    /// CA certificate (PEM) of the K8S API.
    ///
    /// If not set, the in-cluster CA is used if it exists, otherwise the certificate
    /// of the API is not verified.
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub token_retrieval: TokenRetrievalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: DEFAULT_PORT,
            namespaces: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            k8s_api_url: None,
            ca_cert: None,
            token_retrieval: TokenRetrievalConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config file.
    ///
    /// If the file does not exist and `write_default` is true, the default config is
    /// written to `path` and returned.
    pub fn load(path: &Path, write_default: bool) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).with_context(|| format!("invalid config file {path:?}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && write_default => {
                let config = Config::default();
                config.write(path)?;
                log::info!("Default configuration file written to: {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("could not read config file {path:?}")),
        }
    }

    /// Writes the config to a TOML file, overwriting it if it exists.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("failed to write config file {path:?}"))
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("invalid host:port configuration")
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            namespaces: self.namespaces.clone(),
            page_size: self.page_size,
            timeout: self.timeout,
        }
    }

    /// Returns the URL of the K8S API, see [`Config::k8s_api_url`].
    pub fn api_url(&self) -> String {
        if let Some(url) = &self.k8s_api_url {
            return url.clone();
        }
        in_cluster_api_url(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
        )
        .unwrap_or_else(|| String::from(KUBECTL_PROXY_URL))
    }

    /// Returns the CA certificate to trust, see [`Config::ca_cert`].
    pub fn ca_cert(&self) -> Option<PathBuf> {
        self.ca_cert.clone().or_else(|| {
            let in_cluster = Path::new(IN_CLUSTER_CA_PATH);
            in_cluster.exists().then(|| in_cluster.to_path_buf())
        })
    }
}

fn in_cluster_api_url(host: Option<String>, port: Option<String>) -> Option<String> {
    let host = host.filter(|h| !h.is_empty())?;
    let port = port.filter(|p| !p.is_empty()).unwrap_or_else(|| String::from("443"));
    if host.contains(':') {
        // IPv6
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}

/// Parses a comma-separated list of namespaces, ignoring blanks.
pub fn parse_namespaces(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
