use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::Result;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to a module fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error while reading a response body
    #[error("Body error: {0}")]
    BodyError(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// A fully buffered response, used for small control exchanges.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// HttpClient defines the port (interface) for making HTTP requests to modules
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to a module backend and stream the response back
    ///
    /// # Arguments
    /// * `req` - The fully rewritten request
    ///
    /// # Returns
    /// A future that resolves to the backend's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// POST a small JSON body and buffer the whole reply
    ///
    /// # Arguments
    /// * `url` - Absolute URL of the endpoint
    /// * `body` - Encoded request body
    /// * `timeout` - Upper bound for the whole exchange
    async fn post_bytes(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> HttpClientResult<RawResponse>;
}
