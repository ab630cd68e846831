//! Hub/module control protocol: secret tokens, wire messages and the client side.
pub mod client;
pub mod error;
pub mod messages;
pub mod secret;

pub use client::ControlClient;
pub use error::{ProtocolError, SecretError};
pub use messages::{
    CommandReply, CommandRequest, EnvelopeHeader, HandshakeRequest, HandshakeResponse,
    MessageKind,
};
pub use secret::{IdentityToken, SecretToken};
