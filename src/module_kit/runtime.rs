//! Module runtime: registers with the hub, then serves the module's own router next
//! to the command endpoint until a Shutdown command or a signal arrives.
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use eyre::{Result, WrapErr, eyre};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::{
    adapters::HttpClientAdapter,
    config::models::ProtocolConfig,
    module_kit::commands::{CommandDispatcher, CommandHandler, CommandTable, ModuleContext},
    protocol::{ControlClient, HandshakeRequest, SecretToken, secret::load_secret},
    utils::GracefulShutdown,
};

enum SecretSource {
    File(PathBuf),
    Token(SecretToken),
}

/// Builder for [`ModuleRuntime`]
pub struct ModuleRuntimeBuilder {
    name: String,
    address: String,
    port: Option<u16>,
    hub_url: String,
    secret: SecretSource,
    protocol: ProtocolConfig,
    commands: CommandTable,
    resources: Option<PathBuf>,
}

impl ModuleRuntimeBuilder {
    /// Address the module listens on
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Port to ask the hub for; the hub may assign another one
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Full URL of the hub's registration endpoint
    pub fn hub_url(mut self, url: impl Into<String>) -> Self {
        self.hub_url = url.into();
        self
    }

    pub fn secret_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret = SecretSource::File(path.into());
        self
    }

    pub fn secret_token(mut self, token: SecretToken) -> Self {
        self.secret = SecretSource::Token(token);
        self
    }

    pub fn command_path(mut self, path: impl Into<String>) -> Self {
        self.protocol.command_path = path.into();
        self
    }

    /// Delay between the Shutdown reply and the listener closing
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.protocol.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.protocol.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn command(mut self, name: impl Into<String>, handler: impl CommandHandler) -> Self {
        self.commands.register(name, handler);
        self
    }

    /// Serve files of `dir` under `/resources`
    pub fn resources(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resources = Some(dir.into());
        self
    }

    /// Resolve the secret and assemble the runtime.
    pub async fn build(self) -> Result<ModuleRuntime> {
        let secret = match self.secret {
            SecretSource::Token(token) => token,
            SecretSource::File(path) => load_secret(&path)
                .await
                .wrap_err_with(|| format!("Failed to load module secret {}", path.display()))?,
        };
        let http = Arc::new(HttpClientAdapter::new()?);
        let control = ControlClient::new(http, secret.clone(), &self.protocol);
        let shutdown = Arc::new(GracefulShutdown::new());
        let context = ModuleContext::new(self.name.clone(), shutdown.clone());
        let names = self.commands.names();
        let dispatcher = CommandDispatcher::new(
            context,
            secret.clone(),
            self.commands,
            Duration::from_millis(self.protocol.shutdown_grace_ms),
        );

        Ok(ModuleRuntime {
            name: self.name,
            address: self.address,
            port: self.port,
            hub_url: self.hub_url,
            secret,
            command_path: self.protocol.command_path,
            command_names: names,
            resources: self.resources,
            control,
            dispatcher: Arc::new(dispatcher),
            shutdown,
        })
    }
}

/// A module process as seen from the inside
pub struct ModuleRuntime {
    name: String,
    address: String,
    port: Option<u16>,
    hub_url: String,
    secret: SecretToken,
    command_path: String,
    command_names: Vec<String>,
    resources: Option<PathBuf>,
    control: ControlClient,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: Arc<GracefulShutdown>,
}

impl ModuleRuntime {
    pub fn builder(name: impl Into<String>) -> ModuleRuntimeBuilder {
        ModuleRuntimeBuilder {
            name: name.into(),
            address: "127.0.0.1".to_string(),
            port: None,
            hub_url: "http://127.0.0.1:2000/register".to_string(),
            secret: SecretSource::File(PathBuf::from(".secret")),
            protocol: ProtocolConfig::default(),
            commands: CommandTable::new(),
            resources: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle that stops [`serve`](Self::serve) when triggered
    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    /// Register with the hub and return the port to listen on.
    pub async fn connect_to_hub(&self) -> Result<u16> {
        let request = HandshakeRequest {
            commands: self.command_names.clone(),
            name: self.name.clone(),
            port: self.port.map(|p| p.to_string()).unwrap_or_default(),
            pid: std::process::id(),
            hash: self.secret.as_str().to_string(),
        };
        let response = self
            .control
            .handshake(&self.hub_url, &request)
            .await
            .wrap_err_with(|| format!("Handshake with {} failed", self.hub_url))?;
        let port = response
            .port_number()
            .ok_or_else(|| eyre!("Hub answered without a usable port: {:?}", response.port))?;
        tracing::info!(module = %self.name, port, "Registered with hub");
        Ok(port)
    }

    /// Router with the command endpoint and, if configured, the resource directory.
    pub fn command_router(&self) -> Router {
        let mut router = Router::new()
            .route(&self.command_path, post(command_endpoint))
            .with_state(self.dispatcher.clone());
        if let Some(dir) = &self.resources {
            router = router.nest_service("/resources", ServeDir::new(dir));
        }
        router
    }

    /// Handshake, bind the assigned port and serve `app` until shutdown.
    pub async fn serve(self, app: Router) -> Result<()> {
        let port = self.connect_to_hub().await?;
        let addr: SocketAddr = format!("{}:{}", self.address, port)
            .parse()
            .wrap_err("Invalid module listen address")?;
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {addr}"))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });

        self.serve_on(listener, app).await
    }

    /// Serve on an already bound listener without contacting the hub.
    pub async fn serve_on(self, listener: TcpListener, app: Router) -> Result<()> {
        let local = listener.local_addr()?;
        let router = app.merge(self.command_router());
        let mut token = self.shutdown.shutdown_token();

        tracing::info!(module = %self.name, "Module listening on {}", local);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let reason = token.wait_for_shutdown().await;
                tracing::info!("Module listener closing: {:?}", reason);
            })
            .await
            .wrap_err("Module server error")
    }

    pub fn resources_dir(&self) -> Option<&Path> {
        self.resources.as_deref()
    }
}

async fn command_endpoint(
    State(dispatcher): State<Arc<CommandDispatcher>>,
    body: Bytes,
) -> Response {
    let reply = dispatcher.dispatch(&body).await;
    tracing::debug!(module = %dispatcher.name(), "Command answered with {}", reply.status);
    (reply.status, reply.body).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, extract::Request, http::StatusCode, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::protocol::CommandRequest;

    async fn runtime(resources: Option<&Path>) -> ModuleRuntime {
        let mut builder = ModuleRuntime::builder("alpha").secret_token(SecretToken::derive(b"s"));
        if let Some(dir) = resources {
            builder = builder.resources(dir);
        }
        builder.build().await.unwrap()
    }

    #[tokio::test]
    async fn test_command_router_answers_ping() {
        let runtime = runtime(None).await;
        let secret = SecretToken::derive(b"s");
        let identity = secret.identity_for("alpha");
        let body = CommandRequest::signed(&secret, "alpha", identity.as_str(), "Ping")
            .unwrap()
            .encode()
            .unwrap();

        let response = runtime
            .command_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cmd")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"alpha ALIVE");
    }

    #[tokio::test]
    async fn test_resources_are_served() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("app.css"), "body{}").await.unwrap();
        let runtime = runtime(Some(dir.path())).await;

        let app = Router::new()
            .route("/", get(|| async { "home" }))
            .merge(runtime.command_router());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/resources/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_secret_file_fails_build() {
        let result = ModuleRuntime::builder("alpha")
            .secret_file("/definitely/not/here/.secret")
            .build()
            .await;
        assert!(result.is_err());
    }
}
