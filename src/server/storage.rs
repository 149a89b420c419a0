//! History API: CRUD over stored image histories.

use std::collections::HashMap;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::error;

use super::{json, method_not_allowed, not_found, param, query_params, text};
use crate::error::{Error, Result};
use crate::history::{HistoryStore, ImageHistory};

pub async fn handle(req: Request<Body>, store: Arc<HistoryStore>) -> Response<Body> {
    if req.uri().path() != "/" {
        return not_found();
    }

    let method = req.method().clone();
    match method {
        Method::GET => read(query_params(&req), store).await,
        Method::PUT => write(req, store, HistoryStore::create).await,
        Method::POST => write(req, store, HistoryStore::update).await,
        Method::DELETE => delete(query_params(&req), store).await,
        _ => method_not_allowed(),
    }
}

/// Run a store operation off the async runtime.
async fn blocking<T, F>(store: Arc<HistoryStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&HistoryStore) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

fn status_of(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Ambiguous { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Response<Body> {
    match result {
        Ok(value) => json(StatusCode::OK, &value),
        Err(e) => {
            let status = status_of(&e);
            if status.is_server_error() {
                error!(error = %e, "storage request failed");
            }
            text(status, e.to_string())
        }
    }
}

/// `GET /?id=` or `GET /?name=`; without either every image is listed.
async fn read(params: HashMap<String, String>, store: Arc<HistoryStore>) -> Response<Body> {
    match (param(&params, "id"), param(&params, "name")) {
        (Some(_), Some(_)) => text(
            StatusCode::BAD_REQUEST,
            "Expected exactly one of id or name",
        ),
        (Some(id), None) => match id.parse::<i64>() {
            Ok(id) => respond(blocking(store, move |s| s.read_by_id(id)).await),
            Err(e) => text(StatusCode::BAD_REQUEST, format!("Invalid id {id:?}: {e}")),
        },
        (None, Some(name)) => {
            let name = name.to_string();
            let label = name.clone();
            match blocking(store, move |s| s.read_by_name(&name)).await {
                Ok(images) if images.is_empty() => {
                    text(StatusCode::NOT_FOUND, format!("No image named {label:?}"))
                }
                result => respond(result),
            }
        }
        (None, None) => respond(blocking(store, |s| s.read_all()).await),
    }
}

/// `PUT /` creates and `POST /` updates, both from a JSON body.
async fn write(
    req: Request<Body>,
    store: Arc<HistoryStore>,
    op: fn(&HistoryStore, &ImageHistory) -> Result<ImageHistory>,
) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")),
    };
    let history: ImageHistory = match serde_json::from_slice(&body) {
        Ok(history) => history,
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("Invalid image history: {e}")),
    };

    respond(blocking(store, move |s| op(s, &history)).await)
}

/// `DELETE /?name=`
async fn delete(params: HashMap<String, String>, store: Arc<HistoryStore>) -> Response<Body> {
    let Some(name) = param(&params, "name") else {
        return text(StatusCode::BAD_REQUEST, "No name provided");
    };
    let name = name.to_string();

    match blocking(store, move |s| s.delete_by_name(&name)).await {
        Ok(()) => text(StatusCode::OK, ""),
        Err(e) => respond::<()>(Err(e)),
    }
}
