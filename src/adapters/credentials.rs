use std::{collections::HashMap, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use eyre::{Result, WrapErr};
use http::{HeaderMap, header};
use sha1::{Digest, Sha1};

use crate::{ports::credentials::CredentialChecker, protocol::secret::constant_time_eq};

#[derive(Debug, Clone)]
enum StoredPassword {
    /// `{SHA}` followed by base64 of the SHA-1 digest
    Sha1(String),
    Plain(String),
}

impl StoredPassword {
    fn verify(&self, password: &str) -> bool {
        match self {
            StoredPassword::Sha1(expected) => {
                let digest = STANDARD.encode(Sha1::digest(password.as_bytes()));
                constant_time_eq(digest.as_bytes(), expected.as_bytes())
            }
            StoredPassword::Plain(expected) => {
                constant_time_eq(password.as_bytes(), expected.as_bytes())
            }
        }
    }
}

/// Basic-auth checker backed by an htpasswd-style `user:password` file.
#[derive(Debug, Clone, Default)]
pub struct HtpasswdCredentials {
    users: HashMap<String, StoredPassword>,
}

impl HtpasswdCredentials {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Failed to read credentials file {}", path.display()))?;
        let credentials = Self::parse(&content);
        tracing::info!(
            "Loaded {} credential(s) from {}",
            credentials.users.len(),
            path.display()
        );
        Ok(credentials)
    }

    /// Parse htpasswd lines. Comments and blank lines are ignored; hash formats
    /// other than `{SHA}` and plain text are skipped with a warning.
    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, stored)) = line.split_once(':') else {
                tracing::warn!("Ignoring malformed credentials line {}", lineno + 1);
                continue;
            };
            let stored = if let Some(hash) = stored.strip_prefix("{SHA}") {
                StoredPassword::Sha1(hash.to_string())
            } else if stored.starts_with('$') {
                tracing::warn!(
                    "Unsupported password hash for user '{}' on line {}",
                    user,
                    lineno + 1
                );
                continue;
            } else {
                StoredPassword::Plain(stored.to_string())
            };
            users.insert(user.to_string(), stored);
        }
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|stored| stored.verify(password))
    }
}

/// Decode `Authorization: Basic <base64(user:password)>`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

impl CredentialChecker for HtpasswdCredentials {
    fn check(&self, headers: &HeaderMap) -> bool {
        basic_credentials(headers).is_some_and(|(user, password)| self.verify(&user, &password))
    }
}
