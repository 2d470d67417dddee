//! HTTP intake for the inference queue
//!
//! One route: `POST /` with a multipart body carrying a single file part named
//! `image`. The handler validates the upload, enqueues it, and suspends until
//! the worker replies.

use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::inference::{JobQueue, QueueError, Response};

/// JSON body of every reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Latex { latex: String },
    Error { error: String },
}

/// Reasons a request never produced a recognition result
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("no file part named 'image' in the upload")]
    MissingImage,
    #[error("too many files in the upload (at most 1)")]
    TooManyFiles,
    #[error("too many form fields in the upload (at most {0})")]
    TooManyFields(usize),
    #[error("malformed multipart body: {0}")]
    Malformed(String),
    #[error("{0}")]
    Busy(QueueError),
    #[error("{0}")]
    Unavailable(String),
}

impl IntakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            IntakeError::MissingImage
            | IntakeError::TooManyFiles
            | IntakeError::TooManyFields(_)
            | IntakeError::Malformed(_) => StatusCode::BAD_REQUEST,
            IntakeError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            IntakeError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for IntakeError {
    fn from(e: MultipartError) -> Self {
        IntakeError::Malformed(e.body_text())
    }
}

impl From<QueueError> for IntakeError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full(_) => IntakeError::Busy(e),
            QueueError::Closed => IntakeError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> HttpResponse {
        let status = self.status();
        (status, Json(ReplyBody::Error { error: self.to_string() })).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    queue: JobQueue,
    max_fields: usize,
}

/// Build the router around an existing queue
pub fn router(queue: JobQueue, config: &ServerConfig) -> Router {
    let state = AppState {
        queue,
        max_fields: config.max_fields,
    };
    Router::new()
        .route("/", post(recognize))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state)
}

/// Pull the single `image` file out of the form, enforcing part limits
async fn read_image(mut multipart: Multipart, max_fields: usize) -> Result<Vec<u8>, IntakeError> {
    let mut files = 0usize;
    let mut fields = 0usize;
    let mut image = None;

    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_some() {
            files += 1;
            if files > 1 {
                return Err(IntakeError::TooManyFiles);
            }
            if field.name() == Some("image") {
                debug!(
                    "Receiving image {:?} ({:?})",
                    field.file_name().unwrap_or_default(),
                    field.content_type()
                );
                image = Some(field.bytes().await?.to_vec());
            }
        } else {
            fields += 1;
            if fields > max_fields {
                return Err(IntakeError::TooManyFields(max_fields));
            }
        }
    }

    image.ok_or(IntakeError::MissingImage)
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<HttpResponse, IntakeError> {
    let multipart = multipart.map_err(|e| IntakeError::Malformed(e.body_text()))?;
    let payload = read_image(multipart, state.max_fields).await.inspect_err(|e| {
        debug!("Rejected upload: {}", e);
    })?;

    let reply = state.queue.submit(payload).inspect_err(|e| warn!("Not accepting job: {}", e))?;
    let response = reply
        .await
        .map_err(|_| IntakeError::Unavailable("inference worker dropped the job".to_string()))?;

    Ok(match response {
        Response::Recognized(latex) => (StatusCode::OK, Json(ReplyBody::Latex { latex })).into_response(),
        Response::Failed(error) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ReplyBody::Error { error })).into_response()
        }
    })
}

/// Serve until Ctrl-C
pub async fn serve(queue: JobQueue, config: &ServerConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(queue, config))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{png_bytes, spawn_fake, FAIL_WIDTH};
    use crate::inference::WorkerOptions;
    use reqwest::multipart::{Form, Part};
    use std::time::Duration;

    async fn start(queue: JobQueue, config: ServerConfig) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(queue, &config);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn image_part(bytes: Vec<u8>, name: &str) -> Part {
        Part::bytes(bytes).file_name(name.to_string()).mime_str("image/png").unwrap()
    }

    async fn post(url: &str, form: Form) -> (StatusCode, ReplyBody) {
        let resp = reqwest::Client::new().post(url).multipart(form).send().await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_returns_latex() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let url = start(pipeline.queue.clone(), ServerConfig::default()).await;

        let form = Form::new().part("image", image_part(png_bytes(9, 4), "eq.png"));
        let (status, body) = post(&url, form).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ReplyBody::Latex { latex: "x_{9}".to_string() });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_image_is_rejected_before_queueing() {
        let (queue, _rx) = JobQueue::new(None);
        let url = start(queue.clone(), ServerConfig::default()).await;

        let form = Form::new().text("note", "no file here");
        let (status, body) = post(&url, form).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(body, ReplyBody::Error { .. }));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_too_many_files_is_rejected() {
        let (queue, _rx) = JobQueue::new(None);
        let url = start(queue.clone(), ServerConfig::default()).await;

        let form = Form::new()
            .part("image", image_part(png_bytes(2, 2), "a.png"))
            .part("other", image_part(png_bytes(2, 2), "b.png"));
        let (status, _) = post(&url, form).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_too_many_fields_is_rejected() {
        let (queue, _rx) = JobQueue::new(None);
        let url = start(queue.clone(), ServerConfig::default()).await;

        let form = Form::new()
            .part("image", image_part(png_bytes(2, 2), "a.png"))
            .text("a", "1")
            .text("b", "2")
            .text("c", "3");
        let (status, _) = post(&url, form).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_multipart_body_is_rejected() {
        let (queue, _rx) = JobQueue::new(None);
        let url = start(queue.clone(), ServerConfig::default()).await;

        let resp = reqwest::Client::new()
            .post(&url)
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status().as_u16(), 400);
        let body: ReplyBody = resp.json().await.unwrap();
        assert!(matches!(body, ReplyBody::Error { .. }));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inference_failure_is_500() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let url = start(pipeline.queue.clone(), ServerConfig::default()).await;

        let form = Form::new().part("image", image_part(png_bytes(FAIL_WIDTH, 2), "eq.png"));
        let (status, body) = post(&url, form).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(matches!(body, ReplyBody::Error { error } if error.contains("injected failure")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_queue_is_503() {
        let (queue, _rx) = JobQueue::new(Some(1));
        queue.submit(vec![0]).unwrap();
        let url = start(queue.clone(), ServerConfig::default()).await;

        let form = Form::new().part("image", image_part(png_bytes(2, 2), "eq.png"));
        let (status, body) = post(&url, form).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(body, ReplyBody::Error { .. }));
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_requests_each_get_their_own_answer() {
        let pipeline = spawn_fake(Duration::from_millis(5), WorkerOptions::default());
        let url = start(pipeline.queue.clone(), ServerConfig::default()).await;

        let tasks: Vec<_> = (30..40u32)
            .map(|w| {
                let url = url.clone();
                tokio::spawn(async move {
                    let form = Form::new().part("image", image_part(png_bytes(w, 3), "eq.png"));
                    (w, post(&url, form).await)
                })
            })
            .collect();

        for task in tasks {
            let (w, (status, body)) = task.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, ReplyBody::Latex { latex: format!("x_{{{}}}", w) });
        }
        assert_eq!(
            pipeline.probe.max_active.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
