//! Prometheus exporter of the selectors of Kubernetes services.
//!
//! Each scrape lists the services of the cluster (or of some namespaces) and exposes
//! one `kube_service_selectors` sample per service, whose labels are the selector of
//! the service plus its identity (`service`, `namespace`, `uid`).
//! The outcome of each collection is counted in `kube_service_selectors_total`.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use prometheus_client::registry::Registry;
//! use service_selectors::{
//!     collector::{Outcomes, SelectorsCollector},
//!     config::Config,
//!     k8s::{ApiClient, Token},
//! };
//!
//! let config = Config::default();
//! let token = Token::new(config.token_retrieval.clone().into());
//! let client = ApiClient::new(&config.api_url(), token, config.ca_cert().as_deref()).unwrap();
//! let collector = SelectorsCollector::new(client, config.fetch_settings(), Arc::new(Outcomes::default()));
//!
//! let mut registry = Registry::default();
//! registry.register_collector(Box::new(collector));
//! ```

pub mod collector;
pub mod config;
pub mod inventory;
pub mod k8s;
pub mod labels;
pub mod server;
