//! Credential and certificate provisioning for workers.
//!
//! A worker fetches two things before it touches the queue:
//!
//! - queue-store credentials from a [`SecretStore`]
//! - mutual-TLS material from a [`CertificateSource`], materialized into a
//!   private temporary directory that is removed when the worker exits
//!
//! Any failure here is fatal to worker startup.

pub mod certs;
pub mod secrets;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::error::ProvisionError;

pub use certs::{
    CertificateBundle, CertificateSource, DirCertificateSource, HttpCertificateSource,
    TlsMaterial, CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE,
};
pub use secrets::{Credentials, EnvSecretStore, FileSecretStore, SecretStore};

/// Where queue-store credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Use whatever the database URL carries.
    None,
    /// Read `QUEUE_DB_USERNAME` and `QUEUE_DB_PASSWORD`.
    Env,
    /// Read `{dir}/{secret-name}.json`.
    Dir(PathBuf),
}

impl SecretSource {
    /// Builds the store for this source, or `None` when no secret is needed.
    pub fn store(&self) -> Option<Box<dyn SecretStore>> {
        match self {
            Self::None => None,
            Self::Env => Some(Box::new(EnvSecretStore::new())),
            Self::Dir(dir) => Some(Box::new(FileSecretStore::new(dir.clone()))),
        }
    }
}

impl FromStr for SecretSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "env" => Ok(Self::Env),
            other => match other.strip_prefix("dir:") {
                Some(path) if !path.is_empty() => Ok(Self::Dir(PathBuf::from(path))),
                _ => Err(format!(
                    "unknown secret source '{other}' (expected none, env or dir:<path>)"
                )),
            },
        }
    }
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Env => f.write_str("env"),
            Self::Dir(dir) => write!(f, "dir:{}", dir.display()),
        }
    }
}

/// Where mutual-TLS material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    /// No client certificate; the endpoint is called over plain TLS.
    None,
    /// Read objects from a local directory.
    Dir(PathBuf),
    /// Fetch objects over HTTP(S) from a base URL.
    Http(String),
}

impl CertSource {
    /// Builds the source, or `None` when mutual TLS is disabled.
    pub fn source(&self) -> Result<Option<Box<dyn CertificateSource>>, ProvisionError> {
        match self {
            Self::None => Ok(None),
            Self::Dir(dir) => Ok(Some(Box::new(DirCertificateSource::new(dir.clone())))),
            Self::Http(base) => Ok(Some(Box::new(HttpCertificateSource::new(base.clone())?))),
        }
    }
}

impl FromStr for CertSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" || s.is_empty() {
            return Ok(Self::None);
        }
        if let Some(path) = s.strip_prefix("dir:") {
            if !path.is_empty() {
                return Ok(Self::Dir(PathBuf::from(path)));
            }
        }
        if let Some(url) = s.strip_prefix("http:") {
            // `http:https://certs.internal` and `http:http://…` both work.
            if url.starts_with("http://") || url.starts_with("https://") {
                return Ok(Self::Http(url.to_string()));
            }
        }
        Err(format!(
            "unknown certificate source '{s}' (expected none, dir:<path> or http:<url>)"
        ))
    }
}

impl fmt::Display for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Dir(dir) => write!(f, "dir:{}", dir.display()),
            Self::Http(url) => write!(f, "http:{url}"),
        }
    }
}

/// Everything a worker needs provisioned before it connects.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Prefix for certificate objects and the default secret name.
    pub environment: String,
    pub secret_source: SecretSource,
    /// Defaults to `{environment}-queue-credentials`.
    pub secret_name: Option<String>,
    pub cert_source: CertSource,
    /// Fail instead of running without TLS material.
    pub require_client_cert: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            secret_source: SecretSource::None,
            secret_name: None,
            cert_source: CertSource::None,
            require_client_cert: false,
        }
    }
}

impl ProvisionConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn with_secret_source(mut self, source: SecretSource) -> Self {
        self.secret_source = source;
        self
    }

    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self
    }

    pub fn with_cert_source(mut self, source: CertSource) -> Self {
        self.cert_source = source;
        self
    }

    pub fn with_client_cert_required(mut self, required: bool) -> Self {
        self.require_client_cert = required;
        self
    }

    /// The credentials secret to look up.
    pub fn secret_name(&self) -> String {
        self.secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-queue-credentials", self.environment))
    }

    /// Fetches credentials and certificates.
    ///
    /// Either part is skipped when its source is `none`. The returned
    /// [`Provisioned`] owns the on-disk TLS material; dropping it removes the
    /// files.
    pub async fn provision(&self) -> Result<Provisioned, ProvisionError> {
        if self.require_client_cert && self.cert_source == CertSource::None {
            return Err(ProvisionError::ClientCertificateRequired);
        }

        let credentials = match self.secret_source.store() {
            Some(store) => {
                let name = self.secret_name();
                let credentials = store.credentials(&name).await?;
                info!(secret = %name, source = %self.secret_source, "Retrieved queue credentials");
                Some(credentials)
            }
            None => None,
        };

        let tls = match self.cert_source.source()? {
            Some(source) => {
                let bundle = CertificateBundle::fetch(source.as_ref(), &self.environment).await?;
                Some(TlsMaterial::write(&bundle)?)
            }
            None => None,
        };

        Ok(Provisioned { credentials, tls })
    }
}

/// Result of [`ProvisionConfig::provision`].
#[derive(Debug, Default)]
pub struct Provisioned {
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsMaterial>,
}
