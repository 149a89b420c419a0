//! Task API: submit images for analysis, poll their progress and fetch the
//! measured layers.

use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{error, info, warn};

use super::{json, method_not_allowed, not_found, param, parse_form, query_params, text};
use crate::error::Error;
use crate::task::queue::{JobSender, TaskQueue};

#[derive(Clone)]
pub struct AnalyzerState {
    queue: Arc<TaskQueue>,
    jobs: JobSender,
}

impl AnalyzerState {
    pub fn new(queue: Arc<TaskQueue>, jobs: JobSender) -> Self {
        Self { queue, jobs }
    }
}

pub async fn handle(req: Request<Body>, state: AnalyzerState) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/task") => create_task(req, &state).await,
        (Method::GET, "/task") => get_task(&req, &state),
        (Method::DELETE, "/task") => delete_task(&req, &state),
        (Method::GET, "/data") => get_data(&req, &state),
        (_, "/task" | "/data") => method_not_allowed(),
        _ => not_found(),
    }
}

/// `POST /task` with an `image` form or query value. Responds with the new
/// task id.
async fn create_task(req: Request<Body>, state: &AnalyzerState) -> Response<Body> {
    let mut params = query_params(&req);
    match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => params.extend(parse_form(&body)),
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")),
    }

    let Some(image) = param(&params, "image") else {
        return text(StatusCode::BAD_REQUEST, "No image provided");
    };

    let task = match state.queue.add(image) {
        Ok(task) => task,
        Err(e) => {
            warn!(image, error = %e, "rejected task");
            return text(StatusCode::BAD_REQUEST, format!("Error creating task: {e}"));
        }
    };

    if let Err(e) = state.jobs.submit(task.clone()) {
        let status = match e {
            Error::QueueFull => {
                warn!(task = task.id(), "task queue is full");
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => {
                error!(task = task.id(), error = %e, "failed to enqueue task");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if let Err(e) = state.queue.remove(task.id()) {
            warn!(task = task.id(), error = %e, "failed to remove unqueued task");
        }
        return text(status, e.to_string());
    }

    info!(task = task.id(), image, "task queued");
    text(StatusCode::OK, task.id())
}

fn get_task(req: &Request<Body>, state: &AnalyzerState) -> Response<Body> {
    let params = query_params(req);
    let Some(id) = param(&params, "id") else {
        return text(StatusCode::BAD_REQUEST, "No task id provided");
    };

    match state.queue.get(id) {
        Ok(task) => json(StatusCode::OK, &task.snapshot()),
        Err(e) => text(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn delete_task(req: &Request<Body>, state: &AnalyzerState) -> Response<Body> {
    let params = query_params(req);
    let Some(id) = param(&params, "id") else {
        return text(StatusCode::BAD_REQUEST, "No task id provided");
    };

    match state.queue.remove(id) {
        Ok(()) => text(StatusCode::OK, ""),
        Err(e @ Error::NotFound(_)) => text(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!(task = id, error = %e, "failed to remove task");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `GET /data?id=` returns the layer sizes of a finished task. The task is
/// removed once its data has been handed out.
fn get_data(req: &Request<Body>, state: &AnalyzerState) -> Response<Body> {
    let params = query_params(req);
    let Some(id) = param(&params, "id") else {
        return text(StatusCode::BAD_REQUEST, "No task id provided");
    };

    let task = match state.queue.get(id) {
        Ok(task) => task,
        Err(e) => return text(StatusCode::NOT_FOUND, e.to_string()),
    };
    let layers = match task.result() {
        Ok(layers) => layers,
        Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let response = json(StatusCode::OK, &layers);
    if let Err(e) = state.queue.remove(id) {
        warn!(task = id, error = %e, "failed to remove task after sending data");
    }
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::server::testing::{body_json, body_string, request};
    use crate::task::queue::WorkerPool;
    use crate::task::{Collaborators, TaskState};
    use crate::testutil::{self, MediaTypes};

    struct Harness {
        _tmp: tempfile::TempDir,
        image: String,
        state: AnalyzerState,
        pool: WorkerPool,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("source");
        testutil::write_layout(
            &dir,
            "1.0",
            &[(&[("usr/bin/cat", 16), ("usr/lib64/dl", 48), ("etc/hosts", 5)], "ADD rootfs.tar /")],
            MediaTypes::OCI,
        );
        let queue = Arc::new(TaskQueue::new(tmp.path().join("scratch"), Duration::from_secs(60)));
        let collaborators = Arc::new(Collaborators::layout(tmp.path().join("store")));
        let (jobs, pool) = WorkerPool::spawn(1, collaborators);

        Harness {
            image: format!("oci:{}:1.0", dir.display()),
            state: AnalyzerState::new(queue, jobs),
            pool,
            _tmp: tmp,
        }
    }

    async fn wait_for(state: &AnalyzerState, id: &str, wanted: TaskState) {
        for _ in 0..500 {
            if state.queue.get(id).unwrap().state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {wanted:?}");
    }

    #[tokio::test]
    async fn full_task_lifecycle() {
        let h = harness();

        let response = handle(
            request(
                Method::POST,
                "/task",
                format!("image={}", form_urlencoded::byte_serialize(h.image.as_bytes()).collect::<String>()),
            ),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_string(response).await;
        assert!(!id.is_empty());

        wait_for(&h.state, &id, TaskState::Finished).await;

        let response = handle(
            request(Method::GET, &format!("/task?id={id}"), Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = body_json(response).await;
        assert_eq!(snapshot["state"], "finished");
        assert_eq!(snapshot["description"], "Task is finished");
        assert_eq!(snapshot["error"], "");

        let response = handle(
            request(Method::GET, &format!("/data?id={id}"), Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let layers = body_json(response).await;
        let layer = layers.as_object().unwrap().values().next().unwrap();
        assert_eq!(layer["total_size"], 69);
        assert_eq!(layer["directories"]["usr"]["total_size"], 64);
        assert_eq!(layer["created_by"], "ADD rootfs.tar /");

        // Data is handed out once
        assert!(h.state.queue.is_empty());
        let response = handle(
            request(Method::GET, &format!("/data?id={id}"), Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        drop(h.state);
        h.pool.join().await;
    }

    #[tokio::test]
    async fn image_in_query_string_is_accepted() {
        let h = harness();
        let uri = format!(
            "/task?image={}",
            form_urlencoded::byte_serialize(h.image.as_bytes()).collect::<String>()
        );

        let response = handle(request(Method::POST, &uri, Body::empty()), h.state.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.state.queue.len(), 1);
    }

    #[tokio::test]
    async fn missing_or_invalid_image_is_a_bad_request() {
        let h = harness();

        let response = handle(request(Method::POST, "/task", Body::empty()), h.state.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "No image provided");

        let response = handle(
            request(Method::POST, "/task", "image=UPPER%20case"),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.starts_with("Error creating task"));
        assert!(h.state.queue.is_empty());
    }

    #[tokio::test]
    async fn task_endpoints_require_an_id() {
        let h = harness();

        for (method, path) in [
            (Method::GET, "/task"),
            (Method::DELETE, "/task"),
            (Method::GET, "/data"),
        ] {
            let response = handle(request(method, path, Body::empty()), h.state.clone()).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn unknown_task_ids() {
        let h = harness();

        let response = handle(
            request(Method::GET, "/task?id=nope", Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle(
            request(Method::DELETE, "/task?id=nope", Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_backlog_is_service_unavailable() {
        let h = harness();
        let (jobs, _rx) = JobSender::detached(1);
        let state = AnalyzerState::new(h.state.queue.clone(), jobs);
        let body = format!(
            "image={}",
            form_urlencoded::byte_serialize(h.image.as_bytes()).collect::<String>()
        );

        let response = handle(request(Method::POST, "/task", body.clone()), state.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle(request(Method::POST, "/task", body), state.clone()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        // Only the queued task stays registered
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn data_of_unfinished_task_is_an_error() {
        let h = harness();
        // Registered but never submitted, so it stays new
        let task = h.state.queue.add(&h.image).unwrap();

        let response = handle(
            request(Method::GET, &format!("/data?id={}", task.id()), Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.contains("Task is new"));
        assert_eq!(h.state.queue.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_task() {
        let h = harness();
        let task = h.state.queue.add(&h.image).unwrap();

        let response = handle(
            request(Method::DELETE, &format!("/task?id={}", task.id()), Body::empty()),
            h.state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.state.queue.is_empty());
        assert!(!task.scratch_dir().exists());
    }

    #[tokio::test]
    async fn routing() {
        let h = harness();

        let response = handle(request(Method::PUT, "/task", Body::empty()), h.state.clone()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle(request(Method::GET, "/other", Body::empty()), h.state.clone()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
