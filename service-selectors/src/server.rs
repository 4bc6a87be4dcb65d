//! HTTP endpoint for Prometheus.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Context;
use hyper::{
    Body, Request, Response, Server, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
    service::{make_service_fn, service_fn},
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tokio::task::JoinHandle;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves the metrics of `registry` on `http://{addr}/metrics`, until `shutdown` completes.
///
/// Returns the actual address of the server (useful when the port is 0) and the task
/// that runs it. Must be called from a Tokio runtime.
pub fn start(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(handle(req, registry).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind the metrics server to {addr}"))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    log::info!("Prometheus metrics available on http://{local_addr}/metrics");

    let graceful = server.with_graceful_shutdown(shutdown);
    let task = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            log::error!("Prometheus server error: {e}");
        }
        log::info!("Prometheus server stopped gracefully.");
    });
    Ok((local_addr, task))
}

async fn handle(req: Request<Body>, registry: Arc<Registry>) -> Response<Body> {
    if req.uri().path() != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }

    // The collector lists the services with a blocking client.
    let encoded = tokio::task::spawn_blocking(move || {
        let mut buf = String::new();
        encode(&mut buf, &registry).map(|_| buf)
    })
    .await;

    match encoded {
        Ok(Ok(buf)) => {
            let mut response = Response::new(Body::from(buf));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE));
            response
        }
        Ok(Err(e)) => {
            log::error!("Failed to encode metrics: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        Err(e) => {
            log::error!("Metrics encoding task failed: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
