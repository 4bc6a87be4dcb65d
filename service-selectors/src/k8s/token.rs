use std::{
    path::PathBuf,
    process::Command,
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, anyhow};
use base64::{DecodeError, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_SERVICE_ACCOUNT: &str = "kube-service-selectors";
const DEFAULT_NAMESPACE: &str = "monitoring";

/// How to obtain the bearer token, as written in the config file.
///
/// # Examples
/// ```toml
/// # in-cluster token file if it exists, 'kubectl create token' otherwise
/// token_retrieval = "auto"
///
/// # no authentication, for instance behind 'kubectl proxy'
/// token_retrieval = "none"
///
/// # custom file
/// token_retrieval.file = "/path/to/token"
///
/// # custom kubectl
/// token_retrieval.kubectl = { service_account = "reader", namespace = "monitoring" }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRetrievalConfig {
    Kubectl {
        #[serde(default = "default_sa")]
        service_account: String,
        #[serde(default = "default_ns")]
        namespace: String,
    },
    File(String),
    #[serde(untagged)]
    Simple(SimpleRetrievalMethod),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleRetrievalMethod {
    Auto,
    File,
    Kubectl,
    None,
}

impl Default for TokenRetrievalConfig {
    fn default() -> Self {
        Self::Simple(SimpleRetrievalMethod::Auto)
    }
}

fn default_sa() -> String {
    DEFAULT_SERVICE_ACCOUNT.to_string()
}

fn default_ns() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// A way of obtaining a token, with every default resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenRetrieval {
    Kubectl { service_account: String, namespace: String },
    File(PathBuf),
    Anonymous,
}

impl From<TokenRetrievalConfig> for TokenRetrieval {
    fn from(value: TokenRetrievalConfig) -> Self {
        match value {
            TokenRetrievalConfig::Kubectl {
                service_account,
                namespace,
            } => Self::Kubectl {
                service_account,
                namespace,
            },
            TokenRetrievalConfig::File(path) => Self::File(PathBuf::from(path)),
            TokenRetrievalConfig::Simple(SimpleRetrievalMethod::File) => Self::File(PathBuf::from(IN_CLUSTER_TOKEN_PATH)),
            TokenRetrievalConfig::Simple(SimpleRetrievalMethod::Kubectl) => Self::Kubectl {
                service_account: default_sa(),
                namespace: default_ns(),
            },
            TokenRetrievalConfig::Simple(SimpleRetrievalMethod::None) => Self::Anonymous,
            TokenRetrievalConfig::Simple(SimpleRetrievalMethod::Auto) => {
                if let Ok(true) = std::fs::exists(IN_CLUSTER_TOKEN_PATH) {
                    Self::File(PathBuf::from(IN_CLUSTER_TOKEN_PATH))
                } else {
                    Self::from(TokenRetrievalConfig::Simple(SimpleRetrievalMethod::Kubectl))
                }
            }
        }
    }
}

impl TokenRetrieval {
    /// Obtains a fresh token. Returns `None` for anonymous access.
    fn read(&self) -> anyhow::Result<Option<String>> {
        match self {
            TokenRetrieval::Anonymous => Ok(None),
            TokenRetrieval::File(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read token from file {path:?}"))?;
                Ok(Some(content.trim().to_owned()))
            }
            TokenRetrieval::Kubectl {
                service_account,
                namespace,
            } => {
                log::debug!("running: kubectl create token {service_account} -n {namespace}");
                let output = Command::new("kubectl")
                    .args(["create", "token", service_account, "-n", namespace])
                    .output()
                    .context("failed to run kubectl command")?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(match output.status.code() {
                        Some(code) => anyhow!("kubectl exited with status {code}\n{stderr}"),
                        None => anyhow!("kubectl terminated by signal\n{stderr}"),
                    });
                }
                let content = String::from_utf8(output.stdout).context("invalid kubectl output")?;
                Ok(Some(content.trim().to_owned()))
            }
        }
    }
}

/// Bearer token for the Kubernetes API, cached until it expires.
///
/// Clones share the same cache.
#[derive(Debug, Clone)]
pub struct Token {
    retrieval: TokenRetrieval,
    cached: Arc<RwLock<Option<CachedToken>>>,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    /// `exp` claim of the JWT, in POSIX seconds.
    expires_at: Option<u64>,
}

impl CachedToken {
    fn is_alive(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(deadline) => now_secs() < deadline,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum TokenParseError {
    #[error("invalid token format: expected 3 dot-separated parts")]
    InvalidFormat,
    #[error("base64 decoding of the payload failed")]
    Decoding(#[from] DecodeError),
    #[error("json parsing of the payload failed")]
    Parsing(#[from] serde_json::Error),
    #[error("exp field is invalid: expected a u64, got {0}")]
    ExpirationTime(serde_json::Value),
}

/// Extracts the expiration deadline (`exp` claim) of a JWT, if it has one.
///
/// The signature is not checked: the API server does that.
pub fn expiration_time(jwt: &str) -> Result<Option<u64>, TokenParseError> {
    let parts: Vec<&str> = jwt.split('.').collect();
    let [_header, payload, _signature] = parts[..] else {
        return Err(TokenParseError::InvalidFormat);
    };
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload)?;
    let claims: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&payload)?;
    match claims.get("exp") {
        Some(exp) => exp
            .as_u64()
            .map(Some)
            .ok_or_else(|| TokenParseError::ExpirationTime(exp.to_owned())),
        None => Ok(None),
    }
}

impl Token {
    pub fn new(retrieval: TokenRetrieval) -> Self {
        Self {
            retrieval,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(TokenRetrieval::Anonymous)
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self::new(TokenRetrieval::File(path.into()))
    }

    /// Returns the cached token if it is still alive, or a refreshed one.
    ///
    /// Returns `None` for anonymous access.
    pub fn get_value(&self) -> anyhow::Result<Option<String>> {
        {
            let cached = self.cached.read().map_err(|_| anyhow!("token cache poisoned"))?;
            if let Some(token) = cached.as_ref().filter(|t| t.is_alive()) {
                return Ok(Some(token.value.clone()));
            }
        } // unlock

        self.refresh()
    }

    fn refresh(&self) -> anyhow::Result<Option<String>> {
        let Some(value) = self.retrieval.read().context("failed to read token")? else {
            return Ok(None);
        };
        let expires_at = expiration_time(&value).context("failed to parse token")?;
        let mut cached = self.cached.write().map_err(|_| anyhow!("token cache poisoned"))?;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(Some(value))
    }
}
