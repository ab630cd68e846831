//! Module side of the command protocol: the handler table and the dispatcher behind
//! the `/cmd` endpoint.
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::Result;
use http::StatusCode;

use crate::{
    protocol::{
        CommandRequest, EnvelopeHeader, IdentityToken, MessageKind, SecretToken,
        messages::{PING, REJECTION_TEXT, SHUTDOWN},
    },
    utils::{GracefulShutdown, ShutdownReason},
};

/// What a command handler gets to see of the running module
#[derive(Clone)]
pub struct ModuleContext {
    pub name: String,
    shutdown: Arc<GracefulShutdown>,
}

impl ModuleContext {
    pub fn new(name: impl Into<String>, shutdown: Arc<GracefulShutdown>) -> Self {
        Self {
            name: name.into(),
            shutdown,
        }
    }

    /// Stop the module's listener after `delay`.
    pub fn shutdown_after(&self, delay: Duration) {
        self.shutdown.trigger_after(delay, ShutdownReason::Command);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown_initiated()
    }
}

/// A custom command. The returned text is sent back as the reply body.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &ModuleContext) -> Result<String>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn handle(&self, ctx: &ModuleContext) -> Result<String> {
        (self)(ctx.clone()).await
    }
}

/// Custom commands by name. Ping and Shutdown are built in and cannot be replaced.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`; returns false for reserved names.
    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler) -> bool {
        let name = name.into();
        if name == PING || name == SHUTDOWN || name.is_empty() {
            tracing::warn!("Refusing to register reserved command name '{}'", name);
            return false;
        }
        self.handlers.insert(name, Arc::new(handler));
        true
    }

    /// Names announced to the hub at handshake
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Reply of the command endpoint before it becomes an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub status: StatusCode,
    pub body: String,
}

impl Dispatched {
    fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    fn rejected() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, REJECTION_TEXT)
    }
}

/// Authenticates and executes incoming commands for one module.
pub struct CommandDispatcher {
    context: ModuleContext,
    secret: SecretToken,
    identity: IdentityToken,
    table: CommandTable,
    grace: Duration,
}

impl CommandDispatcher {
    pub fn new(
        context: ModuleContext,
        secret: SecretToken,
        table: CommandTable,
        grace: Duration,
    ) -> Self {
        let identity = secret.identity_for(&context.name);
        Self {
            context,
            secret,
            identity,
            table,
            grace,
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Decode, authenticate and run one command message.
    ///
    /// The identity is checked on the envelope header before the payload is looked
    /// at; a wrong identity or signature always gets the same generic rejection.
    pub async fn dispatch(&self, body: &[u8]) -> Dispatched {
        let header = match EnvelopeHeader::decode(body) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Malformed command message: {}", e);
                return Dispatched::new(StatusCode::BAD_REQUEST, "Malformed command");
            }
        };
        if !self.identity.matches(&header.hash) {
            tracing::warn!("Command rejected: identity mismatch");
            return Dispatched::rejected();
        }
        if header.expect(MessageKind::Command).is_err() {
            return Dispatched::new(StatusCode::BAD_REQUEST, "Malformed command");
        }

        let request = match CommandRequest::decode(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Malformed command payload: {}", e);
                return Dispatched::new(StatusCode::BAD_REQUEST, "Malformed command");
            }
        };
        if request.name != self.context.name
            || !self
                .secret
                .verify(&request.name, &request.command, &request.signature)
        {
            tracing::warn!(command = %request.command, "Command rejected: bad signature");
            return Dispatched::rejected();
        }

        let name = &self.context.name;
        match request.command.as_str() {
            PING => Dispatched::new(StatusCode::OK, format!("{name} ALIVE")),
            SHUTDOWN => {
                tracing::info!("Shutdown requested, stopping in {:?}", self.grace);
                self.context.shutdown_after(self.grace);
                Dispatched::new(StatusCode::OK, format!("SHUTTING DOWN {name}"))
            }
            other => match self.table.get(other) {
                Some(handler) => match handler.handle(&self.context).await {
                    Ok(message) => Dispatched::new(StatusCode::OK, message),
                    Err(e) => {
                        tracing::error!("Command '{}' failed: {:#}", other, e);
                        Dispatched::new(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Command {other} failed: {e}"),
                        )
                    }
                },
                None => Dispatched::new(StatusCode::NOT_FOUND, format!("Unknown command {other}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(table: CommandTable) -> (CommandDispatcher, Arc<GracefulShutdown>) {
        let shutdown = Arc::new(GracefulShutdown::new());
        let context = ModuleContext::new("alpha", shutdown.clone());
        let dispatcher = CommandDispatcher::new(
            context,
            SecretToken::derive(b"shared"),
            table,
            Duration::from_millis(20),
        );
        (dispatcher, shutdown)
    }

    fn command(secret: &[u8], name: &str, command: &str) -> Vec<u8> {
        let secret = SecretToken::derive(secret);
        let identity = secret.identity_for(name);
        CommandRequest::signed(&secret, name, identity.as_str(), command)
            .unwrap()
            .encode()
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_ping_and_unknown() {
        let (dispatcher, _) = dispatcher(CommandTable::new());

        let reply = dispatcher.dispatch(&command(b"shared", "alpha", PING)).await;
        assert_eq!(reply, Dispatched::new(StatusCode::OK, "alpha ALIVE"));

        let reply = dispatcher.dispatch(&command(b"shared", "alpha", "Reload")).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.body, "Unknown command Reload");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let (dispatcher, shutdown) = dispatcher(CommandTable::new());

        let reply = dispatcher
            .dispatch(&command(b"other", "alpha", SHUTDOWN))
            .await;
        assert_eq!(reply, Dispatched::rejected());
        assert!(!shutdown.is_shutdown_initiated());

        // right identity, signature for another command
        let mut request = CommandRequest::decode(&command(b"shared", "alpha", PING)).unwrap();
        request.command = SHUTDOWN.to_string();
        let reply = dispatcher.dispatch(&request.encode().unwrap()).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (dispatcher, _) = dispatcher(CommandTable::new());
        let reply = dispatcher.dispatch(b"{\"type\":").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shutdown_is_delayed() {
        let (dispatcher, shutdown) = dispatcher(CommandTable::new());
        let mut token = shutdown.shutdown_token();

        let reply = dispatcher
            .dispatch(&command(b"shared", "alpha", SHUTDOWN))
            .await;
        assert_eq!(reply.body, "SHUTTING DOWN alpha");
        assert!(!shutdown.is_shutdown_initiated());

        let reason = tokio::time::timeout(Duration::from_secs(2), token.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Command);
    }

    #[tokio::test]
    async fn test_custom_commands() {
        let mut table = CommandTable::new();
        assert!(table.register("Reindex", |ctx: ModuleContext| async move {
            Ok(format!("{} reindexed", ctx.name))
        }));
        assert!(table.register("Explode", |_ctx: ModuleContext| async move {
            Err::<String, _>(eyre::eyre!("disk full"))
        }));
        assert!(!table.register(PING, |_ctx: ModuleContext| async move {
            Ok(String::new())
        }));
        assert_eq!(table.names(), vec!["Explode".to_string(), "Reindex".to_string()]);

        let (dispatcher, _) = dispatcher(table);
        let reply = dispatcher.dispatch(&command(b"shared", "alpha", "Reindex")).await;
        assert_eq!(reply, Dispatched::new(StatusCode::OK, "alpha reindexed"));

        let reply = dispatcher.dispatch(&command(b"shared", "alpha", "Explode")).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(reply.body.contains("disk full"));
    }
}
