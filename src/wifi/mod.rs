//! WiFi driver boundary.
//!
//! The provisioner never talks to a WiFi driver directly. Everything goes
//! through [`WifiInterface`], implemented by:
//!
//! - [`NmcliWifi`] - NetworkManager via the `nmcli` command line tool (host)
//! - [`SimulatedWifi`] - scriptable in-memory driver (tests and demo mode)

mod credentials;
mod network;
mod nmcli;
mod sim;

pub use credentials::{
    Credential, CredentialError, JoinRequest, LeaseInfo, MAX_PASSWORD_LEN, MAX_SSID_LEN,
    MIN_PASSWORD_LEN,
};
pub use network::{
    normalize_quality, Encryption, Network, RawNetwork, DEFAULT_QUALITY_REFERENCE,
    HIDDEN_SSID_LABEL,
};
pub use nmcli::NmcliWifi;
pub use sim::{SimStep, SimulatedWifi};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Link state changes reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
}

/// Abstraction over the WiFi control interface.
///
/// Association and DHCP are separate calls so callers can tell which phase
/// stalled. [`WifiInterface::join`] composes the two.
#[async_trait]
pub trait WifiInterface: Send + Sync {
    /// Power up the radio. Failure here is fatal at startup.
    async fn enable(&self) -> Result<(), WifiError>;

    /// Power down the radio.
    async fn disable(&self) -> Result<(), WifiError>;

    /// Scan for networks.
    async fn scan(&self) -> Result<Vec<RawNetwork>, WifiError>;

    /// Associate with an access point. Does not wait for an address.
    async fn associate(&self, ssid: &str, credential: &Credential) -> Result<(), WifiError>;

    /// Wait for a DHCP lease on the associated link.
    async fn acquire_lease(&self) -> Result<LeaseInfo, WifiError>;

    /// Abort an in-flight association or lease request.
    async fn cancel_join(&self) -> Result<(), WifiError>;

    /// Leave the current network.
    async fn leave(&self) -> Result<(), WifiError>;

    /// Subscribe to link up/down notifications.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Raw quality value that maps to 100%.
    fn quality_reference(&self) -> i32 {
        DEFAULT_QUALITY_REFERENCE
    }
}

/// Errors reported by WiFi drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WifiError {
    /// The access point rejected the credential.
    #[error("authentication failed")]
    AuthFailed,
    /// No access point with the requested SSID is in range.
    #[error("network not found: {0}")]
    NotFound(String),
    /// The driver is busy with another operation.
    #[error("driver busy")]
    Busy,
    /// The driver call itself failed.
    #[error("driver error: {0}")]
    Driver(String),
}
