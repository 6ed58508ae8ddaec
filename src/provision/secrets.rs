//! Queue-store credentials.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::ProvisionError;

/// Environment variable holding the username for [`EnvSecretStore`].
pub const USERNAME_ENV: &str = "QUEUE_DB_USERNAME";
/// Environment variable holding the password for [`EnvSecretStore`].
pub const PASSWORD_ENV: &str = "QUEUE_DB_PASSWORD";

/// Username and password for the queue store.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A source of named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the credentials stored under `name`.
    async fn credentials(&self, name: &str) -> Result<Credentials, ProvisionError>;
}

/// Reads credentials from process environment variables.
///
/// The secret name is ignored; there is only one set per process.
#[derive(Debug, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn credentials(&self, name: &str) -> Result<Credentials, ProvisionError> {
        let username = std::env::var(USERNAME_ENV)
            .map_err(|_| ProvisionError::SecretNotFound(name.to_string()))?;
        let password = std::env::var(PASSWORD_ENV).map_err(|_| ProvisionError::MalformedSecret {
            name: name.to_string(),
            reason: format!("{PASSWORD_ENV} is not set"),
        })?;
        Ok(Credentials { username, password })
    }
}

/// Reads credentials from `{dir}/{name}.json`.
///
/// This is the layout produced by mounting a secret volume: one JSON object
/// per secret with `username` and `password` fields.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn credentials(&self, name: &str) -> Result<Credentials, ProvisionError> {
        let path = self.path_for(name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProvisionError::SecretNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let credentials: Credentials =
            serde_json::from_str(&raw).map_err(|e| ProvisionError::MalformedSecret {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(secret = %name, path = %path.display(), "Loaded credentials");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials {
            username: "reporter".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("reporter"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_file_store_reads_named_secret() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("prod-queue-credentials.json"),
            r#"{"username":"svc","password":"pw","host":"ignored"}"#,
        )
        .unwrap();

        let store = FileSecretStore::new(dir.path());
        let creds = store.credentials("prod-queue-credentials").await.unwrap();
        assert_eq!(creds.username, "svc");
        assert_eq!(creds.password, "pw");
    }

    #[tokio::test]
    async fn test_file_store_missing_secret() {
        let dir = TempDir::new().unwrap();
        let store = FileSecretStore::new(dir.path());
        let err = store.credentials("absent").await.unwrap_err();
        assert!(matches!(err, ProvisionError::SecretNotFound(name) if name == "absent"));
    }

    #[tokio::test]
    async fn test_file_store_malformed_secret() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), r#"{"username":"svc"}"#).unwrap();

        let store = FileSecretStore::new(dir.path());
        let err = store.credentials("bad").await.unwrap_err();
        assert!(matches!(err, ProvisionError::MalformedSecret { .. }));
    }
}
