//! Paginated retrieval of the services of the cluster.

use std::{collections::BTreeMap, time::Duration};

use thiserror::Error;

/// A Kubernetes service, reduced to what the exporter needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// The `spec.selector` of the service, ordered by key.
    pub selector: BTreeMap<String, String>,
}

/// One page of a service listing.
#[derive(Debug, Default)]
pub struct ServicePage {
    pub items: Vec<Service>,
    /// Token to pass to the next request, `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Something that can list services, one page at a time.
///
/// [`crate::k8s::ApiClient`] implements it with the Kubernetes API.
pub trait ServiceSource {
    /// Lists the services of `namespace`, or of every namespace if `None`.
    ///
    /// Returns at most `page_size` services, starting at `cursor`.
    fn list_services(
        &self,
        namespace: Option<&str>,
        page_size: u32,
        timeout: Duration,
        cursor: Option<&str>,
    ) -> Result<ServicePage, FetchError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("invalid response")]
    Decode(#[source] serde_json::Error),
    #[error("service without {0}")]
    MissingField(&'static str),
    #[error("failed to get the API token")]
    Token(#[source] anyhow::Error),
}

/// Lists every service of the given namespaces, or of the whole cluster if
/// `namespaces` is empty.
///
/// All the pages are fetched before returning. The first error stops everything:
/// no partial list is ever returned.
pub fn fetch_all<S: ServiceSource + ?Sized>(
    source: &S,
    namespaces: &[String],
    page_size: u32,
    timeout: Duration,
) -> Result<Vec<Service>, ScopedFetchError> {
    if namespaces.is_empty() {
        return fetch_pages(source, None, page_size, timeout);
    }
    let mut services = Vec::new();
    for ns in namespaces {
        services.extend(fetch_pages(source, Some(ns.as_str()), page_size, timeout)?);
    }
    Ok(services)
}

fn fetch_pages<S: ServiceSource + ?Sized>(
    source: &S,
    namespace: Option<&str>,
    page_size: u32,
    timeout: Duration,
) -> Result<Vec<Service>, ScopedFetchError> {
    let scoped = |error: FetchError| ScopedFetchError {
        namespace: namespace.map(ToOwned::to_owned),
        error,
    };

    let mut services = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = source
            .list_services(namespace, page_size, timeout, cursor.as_deref())
            .map_err(scoped)?;
        log::debug!(
            "got {} services from {} (continue: {:?})",
            page.items.len(),
            namespace.unwrap_or("all namespaces"),
            page.next_cursor
        );
        services.extend(page.items);

        // the API may send an empty token instead of no token at all
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(services)
}

/// A [`FetchError`] and the namespace that was being listed.
#[derive(Debug, Error)]
#[error("failed to list services in {}", .namespace.as_deref().unwrap_or("all namespaces"))]
pub struct ScopedFetchError {
    pub namespace: Option<String>,
    #[source]
    pub error: FetchError,
}
