//! HTTP plumbing shared by the analyzer and storage services.

pub mod analyzer;
pub mod storage;

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Serialize;
use tracing::{info, warn};

/// Serve `handler` on `addr` until `shutdown` resolves. In-flight requests
/// are allowed to complete.
pub async fn serve<H, F>(
    addr: SocketAddr,
    handler: H,
    shutdown: impl Future<Output = ()>,
) -> hyper::Result<()>
where
    H: Fn(Request<Body>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<Body>> + Send + 'static,
{
    let make_service = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let response = handler(req);
                async move {
                    let response = response.await;
                    info!(%method, %path, status = response.status().as_u16(), "request");
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    info!(addr = %server.local_addr(), "listening");
    server.with_graceful_shutdown(shutdown).await
}

/// Resolves on ctrl-c.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Decoded `application/x-www-form-urlencoded` pairs. Later keys win.
pub fn parse_form(data: &[u8]) -> HashMap<String, String> {
    form_urlencoded::parse(data).into_owned().collect()
}

pub fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| parse_form(q.as_bytes()))
        .unwrap_or_default()
}

/// Non-empty value of `key`.
pub fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

pub fn text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(data) => {
            let mut response = Response::new(Body::from(data));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}"),
        ),
    }
}

pub fn not_found() -> Response<Body> {
    text(StatusCode::NOT_FOUND, "not found")
}

pub fn method_not_allowed() -> Response<Body> {
    text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}
