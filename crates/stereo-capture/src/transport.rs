//! Delivery of sealed records to remote storage.

use crate::record::CaptureRecord;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";
pub const UPLOAD_PATH: &str = "/api/upload";
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Reported when the server accepts a record without naming its piece.
pub const UNKNOWN_PIECE_CID: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub piece_cid: String,
}

/// Upload failures. All variants are recoverable; the record file stays on disk.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unreadable server response: {0}")]
    Response(String),
}

pub trait Transport: Send {
    fn send(&self, record: &CaptureRecord) -> Result<UploadReceipt, TransportError>;
}

/// JSON POST to `<base_url>/api/upload`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            endpoint: format!("{}{UPLOAD_PATH}", base_url.trim_end_matches('/')),
            agent: ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn send(&self, record: &CaptureRecord) -> Result<UploadReceipt, TransportError> {
        let body = serde_json::to_string(record)?;
        debug!("POST {} ({} bytes)", self.endpoint, body.len());
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| match e {
                ureq::Error::Status(status, resp) => TransportError::Status {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                },
                ureq::Error::Transport(t) => TransportError::Network(t.to_string()),
            })?;
        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| TransportError::Response(e.to_string()))?;
        let receipt = receipt_from_response(&json);
        info!("uploaded capture {}: pieceCid {}", record.data.timestamp, receipt.piece_cid);
        Ok(receipt)
    }
}

/// Piece CID from `{"data": {"pieceCid": ...}}`, or [`UNKNOWN_PIECE_CID`].
pub fn receipt_from_response(json: &serde_json::Value) -> UploadReceipt {
    let piece_cid = json
        .get("data")
        .and_then(|d| d.get("pieceCid"))
        .and_then(|c| c.as_str())
        .unwrap_or(UNKNOWN_PIECE_CID);
    UploadReceipt {
        piece_cid: piece_cid.to_owned(),
    }
}
