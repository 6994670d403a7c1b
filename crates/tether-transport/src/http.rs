//! Minimal HTTP client seam used by the Comet transport.
//!
//! The transport only needs to issue GET and POST requests and read response
//! bodies incrementally. Keeping that behind [`HttpClient`] lets tests drive
//! the Comet transport without a network.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use std::fmt;
use std::time::Duration;
use tether_protocol::ErrorInfo;
use thiserror::Error;
use url::Url;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request as the Comet transport builds it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Bound on the whole exchange, body included.
    pub timeout: Duration,
}

/// Transport-level failure; the request never produced a status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),
}

impl HttpError {
    /// Disconnect reason reported once retries are exhausted.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            HttpError::Timeout => ErrorInfo::timeout("HTTP request"),
            HttpError::Network(msg) => {
                ErrorInfo::new(tether_protocol::codes::DISCONNECTED, 0, msg.clone())
            }
        }
    }
}

/// Response with a streamed body.
pub struct HttpResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, HttpError>>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Response with a body delivered as the given chunks.
    #[must_use]
    pub fn from_chunks(status: u16, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            body: futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by the body stream.
    pub async fn bytes(mut self) -> Result<Bytes, HttpError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Service error carried by a non-success response body.
///
/// Accepts `{"error": {...}}` or a bare error object; falls back to a
/// generic error with the response status.
#[must_use]
pub fn error_from_body(status: u16, body: &[u8]) -> ErrorInfo {
    #[derive(serde::Deserialize)]
    struct Wrapped {
        error: ErrorInfo,
    }
    if let Ok(Wrapped { error }) = serde_json::from_slice::<Wrapped>(body) {
        return error;
    }
    match serde_json::from_slice::<ErrorInfo>(body) {
        Ok(error) if error.code != 0 => error,
        _ => ErrorInfo::new(status as u32 * 100, status, format!("HTTP error {status}")),
    }
}

/// Issues HTTP requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute a request, resolving once the status line is known.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[cfg(feature = "comet")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

#[cfg(feature = "comet")]
impl ReqwestHttpClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing client, e.g. one with a proxy configured.
    #[must_use]
    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[cfg(feature = "comet")]
fn map_reqwest(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Network(err.to_string())
    }
}

#[cfg(feature = "comet")]
#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = match request.method {
            Method::Get => self.inner.get(request.url),
            Method::Post => self.inner.post(request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status().as_u16();
        let body = response.bytes_stream().map(|r| r.map_err(map_reqwest)).boxed();
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_chunks() {
        let response = HttpResponse::from_chunks(
            200,
            vec![Bytes::from_static(b"[{\"ac"), Bytes::from_static(b"tion\":0}]")],
        );
        assert!(response.is_success());
        assert_eq!(&response.bytes().await.unwrap()[..], b"[{\"action\":0}]");
    }

    #[test]
    fn test_error_from_body() {
        let wrapped = br#"{"error":{"code":40142,"statusCode":401,"message":"Token expired"}}"#;
        assert_eq!(error_from_body(401, wrapped).code, 40142);

        let bare = br#"{"code":80017,"statusCode":400,"message":"Connection closed"}"#;
        assert_eq!(error_from_body(400, bare).code, 80017);

        let garbage = error_from_body(503, b"<html>");
        assert_eq!(garbage.status_code, 503);
        assert_eq!(garbage.code, 50300);
    }
}
