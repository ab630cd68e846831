use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body as AxumBody,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tokio::time::timeout;

use crate::{
    adapters::FileSystemAdapter,
    core::{Hub, ModuleRecord, ModuleState, RouteMatch},
    ports::{credentials::CredentialChecker, file_system::FileSystem, http_client::HttpClient},
};

/// Body of the 503 answer while a module is still coming up
pub const LOADING_PAGE: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
<meta http-equiv=\"refresh\" content=\"3\"><title>Loading</title></head>\
<body><h1>Module is loading</h1><p>This page refreshes automatically.</p></body></html>\n";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What to do with a request for a resolved module, decided from its state alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Serve the bind module's root file
    ServeRoot(String),
    Forward,
    Loading,
    Stopped,
    Error,
    Unavailable,
}

pub fn decide(record: &ModuleRecord) -> Dispatch {
    match record.state() {
        ModuleState::Online => match (&record.binding.root, record.types) {
            (Some(root), types) if types.bind => Dispatch::ServeRoot(root.clone()),
            (_, types) if types.web => Dispatch::Forward,
            _ => Dispatch::Unavailable,
        },
        ModuleState::Loading | ModuleState::Downloaded => Dispatch::Loading,
        ModuleState::Stopped => Dispatch::Stopped,
        ModuleState::Error => Dispatch::Error,
        ModuleState::Unknown => Dispatch::Unavailable,
    }
}

/// Join the route's own query and the client's query with `&`.
pub fn merge_query(target: Option<&str>, incoming: Option<&str>) -> Option<String> {
    match (
        target.filter(|q| !q.is_empty()),
        incoming.filter(|q| !q.is_empty()),
    ) {
        (Some(t), Some(i)) => Some(format!("{t}&{i}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// Absolute URI of the module backend for a matched route.
pub fn backend_uri(
    record: &ModuleRecord,
    backend_path: &str,
    incoming_query: Option<&str>,
) -> Result<Uri> {
    let (path, target_query) = match backend_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (backend_path, None),
    };
    let mut uri = record.endpoint(if path.is_empty() { "/" } else { path });
    if let Some(query) = merge_query(target_query, incoming_query) {
        uri.push('?');
        uri.push_str(&query);
    }
    uri.parse::<Uri>()
        .wrap_err_with(|| format!("Failed to parse backend URI {uri}"))
}

fn text_response(status: StatusCode, body: &'static str) -> Result<Response<AxumBody>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(AxumBody::from(body))
        .wrap_err("Failed to build response")
}

/// Reverse proxy dispatcher for module routes
pub struct HttpHandler {
    hub: Arc<Hub>,
    http_client: Arc<dyn HttpClient>,
    file_system: Arc<FileSystemAdapter>,
    credentials: Option<Arc<dyn CredentialChecker>>,
    proxy_timeout: Duration,
}

impl HttpHandler {
    pub fn new(
        hub: Arc<Hub>,
        http_client: Arc<dyn HttpClient>,
        file_system: Arc<FileSystemAdapter>,
        credentials: Option<Arc<dyn CredentialChecker>>,
    ) -> Self {
        let proxy_timeout = Duration::from_millis(hub.config().protocol.proxy_timeout_ms);
        Self {
            hub,
            http_client,
            file_system,
            credentials,
            proxy_timeout,
        }
    }

    /// Resolve the route, apply the auth gate and dispatch on the module's state.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        let Some(matched) = self.hub.routes().resolve(req.method(), req.uri().path()) else {
            tracing::debug!("No route for {} {}", req.method(), req.uri().path());
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        };

        // lock-free snapshot, stable for the rest of this request
        let Some(record) = self.hub.registry().get(&matched.module).await else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Module Unavailable");
        };

        if record.auth.enabled && !self.authorized(req.headers()) {
            return self.challenge();
        }

        let dispatch = decide(&record);
        tracing::debug!(
            module = %record.name,
            state = %record.state(),
            "Dispatching {} {} as {:?}",
            req.method(),
            req.uri().path(),
            dispatch
        );

        match dispatch {
            Dispatch::ServeRoot(root) => match self.file_system.serve_file(&root, req).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    tracing::warn!("Failed to serve root file of '{}': {}", record.name, e);
                    text_response(StatusCode::NOT_FOUND, "File not found")
                }
            },
            Dispatch::Forward => self.forward(&record, &matched, req, client_addr).await,
            Dispatch::Loading => Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header(header::RETRY_AFTER, "3")
                .body(AxumBody::from(LOADING_PAGE))
                .wrap_err("Failed to build loading response"),
            Dispatch::Stopped => text_response(StatusCode::GATEWAY_TIMEOUT, "Module Stopped"),
            Dispatch::Error => text_response(StatusCode::GATEWAY_TIMEOUT, "Error"),
            Dispatch::Unavailable => {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Module Unavailable")
            }
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        // no configured checker means nobody gets through
        self.credentials
            .as_ref()
            .is_some_and(|checker| checker.check(headers))
    }

    fn challenge(&self) -> Result<Response<AxumBody>> {
        let realm = &self.hub.config().auth.realm;
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{realm}\", charset=\"UTF-8\""),
            )
            .body(AxumBody::from("Unauthorized"))
            .wrap_err("Failed to build challenge response")
    }

    /// Rewrite the request onto the module backend and stream the answer back.
    async fn forward(
        &self,
        record: &ModuleRecord,
        matched: &RouteMatch,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        let (mut parts, body) = req.into_parts();
        let original_host = parts.headers.get(header::HOST).cloned();

        parts.uri = backend_uri(record, &matched.backend_path, parts.uri.query())?;
        for name in HOP_BY_HOP {
            parts.headers.remove(name);
        }

        if let Some(addr) = client_addr {
            let forwarded_for = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(chain) => format!("{chain}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                parts.headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = original_host {
            parts.headers.insert("x-forwarded-host", host);
        }
        parts
            .headers
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));

        let request = Request::from_parts(parts, body);
        match timeout(self.proxy_timeout, self.http_client.send_request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::error!("Backend request to '{}' failed: {}", record.name, e);
                text_response(StatusCode::BAD_GATEWAY, "Backend request failed")
            }
            Err(_) => {
                tracing::warn!(
                    "Backend request to '{}' timed out after {:?}",
                    record.name,
                    self.proxy_timeout
                );
                text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
        }
    }
}

impl Clone for HttpHandler {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            http_client: self.http_client.clone(),
            file_system: self.file_system.clone(),
            credentials: self.credentials.clone(),
            proxy_timeout: self.proxy_timeout,
        }
    }
}
