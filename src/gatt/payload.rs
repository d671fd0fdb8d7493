//! JSON payloads carried by the provisioning characteristic.
//!
//! # Read
//!
//! ```json
//! {
//!   "state": "Connected",
//!   "ssid": "Stable",
//!   "ip": "192.168.1.5",
//!   "online": true,
//!   "networks": [
//!     { "ssid": "Stable", "bssid": "AA", "signalQuality": 100, "encryption": "NONE" }
//!   ]
//! }
//! ```
//!
//! `lastError` and `scanError` appear only when set. Notifications carry the
//! same object without `networks` and `scanError`.
//!
//! # Write
//!
//! - `{"ssid": "...", "pwd": "..."}` joins a network (`pwd` may be omitted
//!   or empty for open networks)
//! - `{"cmd": "leave"}` leaves the connected network
//! - `{"cmd": "scan"}` runs a scan cycle now

use crate::scanner::ScanSnapshot;
use crate::session::{FailureReason, SessionState, SessionStatus};
use crate::wifi::{CredentialError, JoinRequest, Network};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session summary, also the notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureReason>,
    pub online: bool,
}

impl From<&SessionStatus> for StatusSummary {
    fn from(status: &SessionStatus) -> Self {
        Self {
            state: status.state,
            ssid: status.ssid.clone(),
            ip: status.lease.as_ref().map(|l| l.ip_address),
            last_error: status.last_error,
            online: status.online,
        }
    }
}

/// Full read payload: summary plus the current scan snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    #[serde(flatten)]
    pub summary: StatusSummary,
    pub networks: Vec<Network>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_error: Option<String>,
}

impl ReadPayload {
    pub fn new(status: &SessionStatus, snapshot: &ScanSnapshot) -> Self {
        Self {
            summary: StatusSummary::from(status),
            networks: snapshot.networks.clone(),
            scan_error: snapshot.scan_error.clone(),
        }
    }
}

/// Read-only view over the published session status and scan snapshot.
#[derive(Debug, Clone)]
pub struct StatusView {
    status: watch::Receiver<SessionStatus>,
    snapshots: watch::Receiver<Arc<ScanSnapshot>>,
}

impl StatusView {
    pub fn new(
        status: watch::Receiver<SessionStatus>,
        snapshots: watch::Receiver<Arc<ScanSnapshot>>,
    ) -> Self {
        Self { status, snapshots }
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary::from(&*self.status.borrow())
    }

    pub fn read_payload(&self) -> ReadPayload {
        let snapshot = self.snapshots.borrow().clone();
        ReadPayload::new(&self.status.borrow(), &snapshot)
    }

    /// Receivers for change notification.
    pub fn watchers(
        &self,
    ) -> (
        watch::Receiver<SessionStatus>,
        watch::Receiver<Arc<ScanSnapshot>>,
    ) {
        (self.status.clone(), self.snapshots.clone())
    }
}

/// A decoded characteristic write.
#[derive(Debug)]
pub enum WriteCommand {
    Join(JoinRequest),
    Leave,
    Scan,
}

/// Why a write payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Values are never echoed back; they may be secrets.
    #[error("malformed JSON at line {line} column {column}")]
    InvalidJson { line: usize, column: usize },
    #[error("missing ssid")]
    MissingSsid,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("cmd cannot be combined with ssid or pwd")]
    Ambiguous,
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
struct WritePayload {
    ssid: Option<String>,
    pwd: Option<String>,
    cmd: Option<String>,
}

/// Decode a characteristic write.
pub fn parse_write(data: &[u8]) -> Result<WriteCommand, ParseError> {
    let payload: WritePayload = serde_json::from_slice(data).map_err(|e| ParseError::InvalidJson {
        line: e.line(),
        column: e.column(),
    })?;

    if let Some(cmd) = payload.cmd.as_deref() {
        if payload.ssid.is_some() || payload.pwd.is_some() {
            return Err(ParseError::Ambiguous);
        }
        return match cmd {
            "leave" => Ok(WriteCommand::Leave),
            "scan" => Ok(WriteCommand::Scan),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        };
    }

    let ssid = payload.ssid.as_deref().ok_or(ParseError::MissingSsid)?;
    let password = payload.pwd.as_deref().unwrap_or_default();
    Ok(WriteCommand::Join(JoinRequest::new(ssid, password)?))
}
