use std::{sync::Arc, time::Duration};

use http::StatusCode;

use crate::{
    config::models::ProtocolConfig,
    core::module::ModuleRecord,
    ports::http_client::HttpClient,
    protocol::{
        error::ProtocolError,
        messages::{CommandReply, CommandRequest, HandshakeRequest, HandshakeResponse, PING, SHUTDOWN},
        secret::SecretToken,
    },
};

/// Sends control messages over an [`HttpClient`], every call bounded by `timeout`.
pub struct ControlClient {
    http: Arc<dyn HttpClient>,
    secret: SecretToken,
    command_path: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(http: Arc<dyn HttpClient>, secret: SecretToken, config: &ProtocolConfig) -> Self {
        Self {
            http,
            secret,
            command_path: config.command_path.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `command` to the module described by `record`.
    pub async fn send_command(
        &self,
        record: &ModuleRecord,
        command: &str,
    ) -> Result<CommandReply, ProtocolError> {
        let identity = match record.secret_hash() {
            Some(hash) => hash.to_string(),
            None => self.secret.identity_for(&record.name).into_string(),
        };
        let request = CommandRequest::signed(&self.secret, &record.name, &identity, command)?;
        let url = record.endpoint(&self.command_path);

        tracing::debug!(module = %record.name, command, %url, "Sending control command");
        let response = self
            .http
            .post_bytes(&url, request.encode()?, self.timeout)
            .await?;
        Ok(CommandReply::from_wire(response.status, &response.body))
    }

    pub async fn ping(&self, record: &ModuleRecord) -> Result<CommandReply, ProtocolError> {
        self.send_command(record, PING).await
    }

    pub async fn shutdown(&self, record: &ModuleRecord) -> Result<CommandReply, ProtocolError> {
        self.send_command(record, SHUTDOWN).await
    }

    /// Module side: register with the hub at `url`.
    pub async fn handshake(
        &self,
        url: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, ProtocolError> {
        let response = self
            .http
            .post_bytes(url, request.encode()?, self.timeout)
            .await?;

        let reply = HandshakeResponse::decode(&response.body);
        match (response.status, reply) {
            (StatusCode::UNAUTHORIZED, _) => Err(ProtocolError::AuthMismatch),
            (status, Ok(reply)) if status.is_success() && reply.success => Ok(reply),
            (status, _) => Err(ProtocolError::Rejected(status.as_u16())),
        }
    }
}
