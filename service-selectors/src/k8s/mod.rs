//! Kubernetes API client (limited capabilities, just what we need).

use std::{path::Path, time::Duration};

use anyhow::Context;

use crate::inventory::{FetchError, Service, ServicePage, ServiceSource};
pub use token::{Token, TokenRetrieval, TokenRetrievalConfig};

pub mod token;

/// CA bundle mounted in every pod that has a service account.
pub const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Lists services with the Kubernetes API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::blocking::Client,
    auth_token: Token,
    api_url: String,
}

/// Encoding/decoding of the K8S API responses.
/// Fields that we don't need are not included, serde will skip them.
mod api {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    #[derive(Deserialize)]
    pub struct ServiceList {
        #[serde(default)]
        pub items: Vec<Service>,
        #[serde(default)]
        pub metadata: ListMeta,
    }

    #[derive(Deserialize, Default)]
    pub struct ListMeta {
        #[serde(rename = "continue")]
        pub continue_token: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct Service {
        pub metadata: ObjectMeta,
        #[serde(default)]
        pub spec: ServiceSpec,
    }

    #[derive(Deserialize)]
    pub struct ObjectMeta {
        pub name: Option<String>,
        pub namespace: Option<String>,
        pub uid: Option<String>,
    }

    #[derive(Deserialize, Default)]
    pub struct ServiceSpec {
        /// `null` or absent for services without selector (e.g. `ExternalName`).
        pub selector: Option<BTreeMap<String, String>>,
    }
}

impl TryFrom<api::Service> for Service {
    type Error = FetchError;

    fn try_from(service: api::Service) -> Result<Self, Self::Error> {
        let meta = service.metadata;
        Ok(Service {
            name: meta.name.ok_or(FetchError::MissingField("metadata.name"))?,
            namespace: meta.namespace.ok_or(FetchError::MissingField("metadata.namespace"))?,
            uid: meta.uid.ok_or(FetchError::MissingField("metadata.uid"))?,
            selector: service.spec.selector.unwrap_or_default(),
        })
    }
}

impl ApiClient {
    /// Creates a client for the API at `k8s_api_url`.
    ///
    /// If `ca_cert` is `None`, the certificate of the API server is not verified.
    pub fn new(k8s_api_url: &str, auth_token: Token, ca_cert: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = reqwest::blocking::Client::builder();
        match ca_cert {
            Some(path) => {
                let pem = std::fs::read(path).with_context(|| format!("failed to read CA certificate {path:?}"))?;
                let cert = reqwest::Certificate::from_pem(&pem).context("invalid CA certificate")?;
                builder = builder.add_root_certificate(cert);
            }
            None => {
                log::warn!("No CA certificate configured, the certificate of the K8S API will not be verified.");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        let client = builder.build().context("failed to build http client")?;

        Ok(Self {
            client,
            auth_token,
            api_url: k8s_api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn services_route(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}/api/v1/namespaces/{ns}/services", self.api_url),
            None => format!("{}/api/v1/services", self.api_url),
        }
    }
}

impl ServiceSource for ApiClient {
    fn list_services(
        &self,
        namespace: Option<&str>,
        page_size: u32,
        timeout: Duration,
        cursor: Option<&str>,
    ) -> Result<ServicePage, FetchError> {
        // get the auth token, refreshed if needed
        let token = self.auth_token.get_value().map_err(FetchError::Token)?;

        // prepare the request
        let mut req = self
            .client
            .get(self.services_route(namespace))
            .timeout(timeout)
            .query(&[("limit", page_size.to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("continue", cursor)]);
        }
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        // send and parse response
        let body = req.send()?.error_for_status()?.bytes()?;
        let list: api::ServiceList = serde_json::from_slice(&body).map_err(FetchError::Decode)?;

        let items = list
            .items
            .into_iter()
            .map(Service::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ServicePage {
            items,
            next_cursor: list.metadata.continue_token,
        })
    }
}
