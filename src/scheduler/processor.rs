//! External processing of a single queue entry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::{ProcessError, ProvisionError};
use crate::provision::TlsMaterial;
use crate::storage::ClaimedEntry;

/// Body posted to the external endpoint for one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRequest {
    pub entry_id: i64,
    pub data: serde_json::Value,
    pub owner: String,
    /// RFC 3339 time the request was built.
    pub timestamp: String,
}

impl ProcessRequest {
    /// Builds the request for `entry`, parsing its payload.
    pub fn from_entry(entry: &ClaimedEntry, owner: &str) -> Result<Self, ProcessError> {
        let data = entry
            .payload_json()
            .map_err(|e| ProcessError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            entry_id: entry.id,
            data,
            owner: owner.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        })
    }
}

/// Processes one entry. `Ok` means the entry is done; any error marks it failed.
#[async_trait]
pub trait EntryProcessor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<serde_json::Value, ProcessError>;
}

/// Posts entries to an HTTPS endpoint, optionally with a client certificate.
#[derive(Debug, Clone)]
pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProcessor {
    /// Creates a processor for `endpoint` with a per-call `timeout`.
    ///
    /// When `tls` is given, the client presents its identity and trusts its
    /// CA in addition to the system roots.
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, ProvisionError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(tls) = tls {
            builder = builder
                .identity(tls.identity()?)
                .add_root_certificate(tls.ca_certificate()?);
        }

        let client = builder
            .build()
            .map_err(|e| ProvisionError::InvalidTls(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn map_transport(e: reqwest::Error) -> ProcessError {
    if e.is_timeout() {
        ProcessError::Timeout
    } else {
        ProcessError::Transport(e.to_string())
    }
}

#[async_trait]
impl EntryProcessor for HttpProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<serde_json::Value, ProcessError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProcessError::Status(status.as_u16()));
        }

        let body: serde_json::Value = response.json().await.map_err(map_transport)?;
        debug!(entry_id = request.entry_id, "External service accepted entry");
        Ok(body)
    }
}
