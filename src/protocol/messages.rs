//! Wire messages.
//!
//! Every control message travels in an envelope:
//! `{"type": "Handshake" | "Command", "hash": <token>, "payload": {...}}`.
//! Receivers decode an [`EnvelopeHeader`] first, which skips the payload, check the
//! token, and only then decode the typed payload.
use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::protocol::{error::ProtocolError, secret::SecretToken};

pub const PING: &str = "Ping";
pub const SHUTDOWN: &str = "Shutdown";

/// Text a module answers with when the caller's token does not match.
pub const REJECTION_TEXT: &str = "Error reading module Hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Handshake,
    Command,
}

/// First decoding stage: discriminator and token only.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub hash: String,
}

impl EnvelopeHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn expect(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedKind {
                expected: kind,
                actual: self.kind,
            })
        }
    }
}

#[derive(Serialize)]
struct Envelope<P> {
    #[serde(rename = "type")]
    kind: MessageKind,
    hash: String,
    payload: P,
}

/// Second decoding stage: the typed payload only.
#[derive(Deserialize)]
struct PayloadOf<P> {
    payload: P,
}

fn encode_envelope<P: Serialize>(
    kind: MessageKind,
    hash: &str,
    payload: P,
) -> Result<Bytes, ProtocolError> {
    let envelope = Envelope {
        kind,
        hash: hash.to_string(),
        payload,
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Check the discriminator before the payload is parsed.
fn decode_envelope<P: DeserializeOwned>(
    kind: MessageKind,
    bytes: &[u8],
) -> Result<(String, P), ProtocolError> {
    let header = EnvelopeHeader::decode(bytes)?;
    header.expect(kind)?;
    let body: PayloadOf<P> = serde_json::from_slice(bytes)?;
    Ok((header.hash, body.payload))
}

/// Module → hub registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub commands: Vec<String>,
    pub name: String,
    /// Requested port; empty or "0" lets the hub choose
    pub port: String,
    pub pid: u32,
    /// Secret token
    pub hash: String,
}

#[derive(Serialize, Deserialize)]
struct HandshakePayload {
    #[serde(default)]
    commands: Vec<String>,
    name: String,
    #[serde(default)]
    port: String,
    #[serde(default)]
    pid: u32,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_envelope(
            MessageKind::Handshake,
            &self.hash,
            HandshakePayload {
                commands: self.commands.clone(),
                name: self.name.clone(),
                port: self.port.clone(),
                pid: self.pid,
            },
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (hash, payload): (String, HandshakePayload) =
            decode_envelope(MessageKind::Handshake, bytes)?;
        Ok(Self {
            commands: payload.commands,
            name: payload.name,
            port: payload.port,
            pid: payload.pid,
            hash,
        })
    }

    /// Requested port, if the module asked for a specific one.
    pub fn requested_port(&self) -> Option<u16> {
        self.port.trim().parse::<u16>().ok().filter(|p| *p != 0)
    }
}

/// Hub → module registration answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    pub port: String,
}

impl HandshakeResponse {
    pub fn accepted(port: u16) -> Self {
        Self {
            success: true,
            port: port.to_string(),
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            port: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn port_number(&self) -> Option<u16> {
        self.port.parse().ok()
    }
}

/// Control command addressed to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    /// Identity token of the target module
    pub hash: String,
    pub name: String,
    pub signature: String,
}

#[derive(Serialize, Deserialize)]
struct CommandPayload {
    command: String,
    name: String,
    #[serde(default)]
    signature: String,
}

impl CommandRequest {
    /// Build a command for `name`, signed with the hub's token.
    pub fn signed(
        secret: &SecretToken,
        name: &str,
        identity: &str,
        command: &str,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            command: command.to_string(),
            hash: identity.to_string(),
            name: name.to_string(),
            signature: secret.sign(name, command)?,
        })
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_envelope(
            MessageKind::Command,
            &self.hash,
            CommandPayload {
                command: self.command.clone(),
                name: self.name.clone(),
                signature: self.signature.clone(),
            },
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (hash, payload): (String, CommandPayload) =
            decode_envelope(MessageKind::Command, bytes)?;
        Ok(Self {
            command: payload.command,
            hash,
            name: payload.name,
            signature: payload.signature,
        })
    }
}

/// A command answer lifted from the plain text wire reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub success: bool,
    pub code: u16,
    pub message: String,
}

impl CommandReply {
    pub fn from_wire(status: StatusCode, body: &[u8]) -> Self {
        Self {
            success: status.is_success(),
            code: status.as_u16(),
            message: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Whether this is a liveness confirmation from `module`
    pub fn confirms_alive(&self, module: &str) -> bool {
        self.success && self.message.contains(&format!("{module} ALIVE"))
    }
}
