use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult, RawResponse},
    tracing_setup::create_backend_span,
};

/// HTTP client adapter using Hyper with Rustls.
///
/// Used both for proxied traffic and for control messages. Proxied requests are sent
/// as they were rewritten by the dispatcher: no default headers are injected, so a
/// client that sent no User-Agent reaches the module without one.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        // modules are plain http unless they registered with https
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::debug!("Created module HTTP client");
        Ok(Self { client })
    }

    /// Point the Host header at the outgoing authority.
    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;

        let backend = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let span = create_backend_span(&backend, req.method().as_str(), req.uri().path());

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        span.in_scope(|| tracing::debug!("Forwarding {} {}", parts.method, parts.uri));

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self
            .client
            .request(Request::from_parts(parts, body))
            .instrument(span.clone())
            .await
        {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, body) = response.into_parts();
                // axum re-frames the streamed body
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                span.record("http.status_code", 599u16);
                span.in_scope(|| {
                    tracing::error!("Error forwarding {} {} to {}: {}", method, uri, backend, e)
                });
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn post_bytes(
        &self,
        url: &str,
        body: Bytes,
        limit: Duration,
    ) -> HttpClientResult<RawResponse> {
        let mut request = Request::builder()
            .method("POST")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(body))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        Self::set_host_header(&mut request)?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| HttpClientError::ConnectionError(format!("POST {url}: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| HttpClientError::BodyError(e.to_string()))?
                .to_bytes();
            Ok::<_, HttpClientError>(RawResponse { status, body })
        };

        match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Control request to {} timed out after {:?}", url, limit);
                Err(HttpClientError::Timeout(limit))
            }
        }
    }
}
