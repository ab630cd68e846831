//! Shared-secret tokens.
//!
//! The raw secret never leaves the machine. Hub and modules both derive:
//! * the secret token: URL-safe base64 of SHA-256 over the secret file bytes,
//! * a module identity: URL-safe base64 of SHA-256 over `token:name`,
//! * a command signature: HMAC-SHA256 keyed by the token over `name:command`.
use std::{fmt, path::Path};

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::protocol::error::{ProtocolError, SecretError};

type HmacSha256 = Hmac<Sha256>;

/// Size of a generated secret in bytes
pub const SECRET_LEN: usize = 32;

/// Compare two byte strings in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    /// Derive the token from raw secret bytes.
    pub fn derive(secret: &[u8]) -> Self {
        Self(URL_SAFE.encode(Sha256::digest(secret)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }

    /// Identity token of `module`, stored as the record's secret hash.
    pub fn identity_for(&self, module: &str) -> IdentityToken {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(b":");
        hasher.update(module.as_bytes());
        IdentityToken(URL_SAFE.encode(hasher.finalize()))
    }

    fn mac(&self, module: &str, command: &str) -> Result<HmacSha256, ProtocolError> {
        let mut mac = HmacSha256::new_from_slice(self.0.as_bytes())
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        mac.update(module.as_bytes());
        mac.update(b":");
        mac.update(command.as_bytes());
        Ok(mac)
    }

    /// Signing value for `command` addressed to `module`.
    pub fn sign(&self, module: &str, command: &str) -> Result<String, ProtocolError> {
        Ok(URL_SAFE.encode(self.mac(module, command)?.finalize().into_bytes()))
    }

    pub fn verify(&self, module: &str, command: &str, signature: &str) -> bool {
        let Ok(expected) = URL_SAFE.decode(signature) else {
            return false;
        };
        self.mac(module, command)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(..)")
    }
}

/// Per-module identity issued at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for IdentityToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Read the secret file and derive its token.
pub async fn load_secret(path: impl AsRef<Path>) -> Result<SecretToken, SecretError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|source| SecretError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(SecretError::Empty(path.to_path_buf()));
    }
    Ok(SecretToken::derive(&bytes))
}

/// Write a fresh random secret to `path`, replacing any existing file.
pub async fn generate_secret(path: impl AsRef<Path>) -> Result<(), SecretError> {
    let path = path.as_ref();
    let mut secret = [0u8; SECRET_LEN];
    rand::rng().fill(&mut secret);

    let io_err = |source| SecretError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, secret).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }

    tracing::info!("Generated new shared secret at {}", path.display());
    Ok(())
}

/// Load the secret, generating it first when missing and `generate` is set.
pub async fn ensure_secret(
    path: impl AsRef<Path>,
    generate: bool,
) -> Result<SecretToken, SecretError> {
    let path = path.as_ref();
    if generate && !tokio::fs::try_exists(path).await.unwrap_or(false) {
        generate_secret(path).await?;
    }
    load_secret(path).await
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_token_is_url_safe_and_deterministic() {
        let a = SecretToken::derive(b"shared secret");
        let b = SecretToken::derive(b"shared secret");
        assert_eq!(a, b);
        assert!(!a.as_str().contains('+') && !a.as_str().contains('/'));
        assert_ne!(a, SecretToken::derive(b"other secret"));
    }

    #[test]
    fn test_identity_differs_per_module() {
        let token = SecretToken::derive(b"s");
        assert_eq!(token.identity_for("alpha"), token.identity_for("alpha"));
        assert_ne!(token.identity_for("alpha"), token.identity_for("beta"));
        assert!(token.identity_for("alpha").matches(token.identity_for("alpha").as_str()));
    }

    #[test]
    fn test_signature_round_trip() {
        let token = SecretToken::derive(b"s");
        let sig = token.sign("alpha", "Ping").unwrap();
        assert!(token.verify("alpha", "Ping", &sig));
        assert!(!token.verify("alpha", "Shutdown", &sig));
        assert!(!token.verify("beta", "Ping", &sig));
        assert!(!SecretToken::derive(b"x").verify("alpha", "Ping", &sig));
        assert!(!token.verify("alpha", "Ping", "not base64!"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_debug_does_not_leak() {
        let token = SecretToken::derive(b"s");
        assert!(!format!("{token:?}").contains(token.as_str()));
    }

    #[tokio::test]
    async fn test_ensure_secret_generates_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys/.secret");

        let first = ensure_secret(&path, true).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), SECRET_LEN);
        let second = ensure_secret(&path, true).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_load_missing_secret_fails() {
        let dir = TempDir::new().unwrap();
        let err = ensure_secret(dir.path().join("absent"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::Io { .. }));
    }
}
