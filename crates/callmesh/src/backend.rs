//! Message log backend
//!
//! Every sent text and every file delivered over a data channel produces
//! one [`TransferRecord`]. Recording is best-effort: transports hand the
//! record to [`spawn_record`] and never wait on, or fail because of, the
//! backend.

use crate::config::MeshConfig;
use crate::session::ConnectionId;
use crate::transport::frame::FileMetadata;
use crate::transport::text::TextMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Path appended to the backend base URL
pub const MESSAGES_PATH: &str = "/api/messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

/// Type-specific part of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeDetail {
    Text {
        text: String,
    },
    File {
        name: String,
        #[serde(rename = "type")]
        mime_type: String,
        size: u64,
    },
}

/// One logged message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub type_detail: TypeDetail,
    pub time: DateTime<Utc>,
    pub connection_id: ConnectionId,
}

impl TransferRecord {
    pub fn file(metadata: &FileMetadata, connection_id: ConnectionId) -> Self {
        Self {
            message_type: MessageType::File,
            type_detail: TypeDetail::File {
                name: metadata.name.clone(),
                mime_type: metadata.mime_type.clone(),
                size: metadata.size,
            },
            time: metadata.time,
            connection_id,
        }
    }

    pub fn text(message: &TextMessage, connection_id: ConnectionId) -> Self {
        Self {
            message_type: MessageType::Text,
            type_detail: TypeDetail::Text {
                text: message.text.clone(),
            },
            time: message.time,
            connection_id,
        }
    }
}

/// Sink for transfer records
#[async_trait]
pub trait TransferLog: Send + Sync + 'static {
    async fn record(&self, record: TransferRecord) -> Result<()>;
}

/// Discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransferLog;

#[async_trait]
impl TransferLog for NoopTransferLog {
    async fn record(&self, _record: TransferRecord) -> Result<()> {
        Ok(())
    }
}

/// POSTs records as JSON to `{base_url}/api/messages`
pub struct HttpTransferLog {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpTransferLog {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::BackendError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), MESSAGES_PATH),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TransferLog for HttpTransferLog {
    async fn record(&self, record: TransferRecord) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(&record);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to post record: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::BackendError(format!(
                "Record rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Pick the log configured in `config`
pub fn transfer_log_from_config(config: &MeshConfig) -> Result<Arc<dyn TransferLog>> {
    match &config.backend_url {
        Some(url) => Ok(Arc::new(HttpTransferLog::new(
            url,
            config.backend_token.clone(),
            Duration::from_secs(config.backend_timeout_secs),
        )?)),
        None => Ok(Arc::new(NoopTransferLog)),
    }
}

/// Record in the background; failures are logged and dropped
pub fn spawn_record(log: &Arc<dyn TransferLog>, record: TransferRecord) {
    let log = Arc::clone(log);
    tokio::spawn(async move {
        let kind = record.message_type;
        match log.record(record).await {
            Ok(()) => debug!("Logged {:?} transfer", kind),
            Err(e) => warn!("Failed to log {:?} transfer: {}", kind, e),
        }
    });
}
