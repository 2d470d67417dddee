//! HTTP client for the recognition service

use reqwest::multipart::{Form, Part};
use std::time::Duration;
use thiserror::Error;

use crate::inference::Response;
use crate::server::ReplyBody;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status} without a usable body")]
    UnexpectedStatus { status: u16 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Client for a running `snap2latex serve`
#[derive(Debug, Clone)]
pub struct ServiceClient {
    url: String,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("snap2latex/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { url: url.into(), http })
    }

    /// Upload an image and wait for the recognition outcome
    pub async fn recognize(&self, image: Vec<u8>, filename: &str) -> Result<Response, TransportError> {
        let part = Part::bytes(image).file_name(filename.to_string());
        let form = Form::new().part("image", part);

        let resp = self.http.post(&self.url).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        match serde_json::from_str::<ReplyBody>(&text) {
            Ok(ReplyBody::Error { error }) => Ok(Response::Failed(error)),
            Ok(ReplyBody::Latex { latex }) if status.is_success() => Ok(Response::Recognized(latex)),
            Err(e) if status.is_success() => Err(TransportError::InvalidResponse(e.to_string())),
            _ => Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }

    /// Blocking wrapper for threads outside any runtime
    pub fn recognize_blocking(&self, image: Vec<u8>, filename: &str) -> Result<Response, TransportError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::InvalidResponse(format!("failed to start runtime: {}", e)))?;
        rt.block_on(self.recognize(image, filename))
    }
}
