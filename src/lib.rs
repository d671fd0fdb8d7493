//! BLE WiFi provisioning.
//!
//! A headless device advertises a GATT service; a phone reads the list of
//! nearby WiFi networks from it and writes back credentials. The device joins
//! the chosen network, reports progress through the same characteristic and
//! keeps scanning whenever it is offline.
//!
//! Hardware is reached only through traits, so everything here runs and is
//! tested on an ordinary host:
//!
//! - [`wifi::WifiInterface`] - WiFi driver (`nmcli` or simulated)
//! - [`ble::BlePeripheral`] + [`ble::GattEvent`] - BLE stack (console on host)
//! - [`connectivity::ConnectivityProbe`] - internet reachability

pub mod ble;
pub mod config;
pub mod connectivity;
pub mod gatt;
pub mod provisioner;
pub mod scanner;
pub mod session;
pub mod stats;
pub mod status_server;
pub mod supervisor;
pub mod wifi;

// Re-export commonly used items
pub use config::{ConfigError, ProvisionerConfig, WifiBackendKind};
pub use provisioner::{InitError, Provisioner};
pub use scanner::{NetworkScanner, ScanEvent, ScanSnapshot};
pub use session::{SessionHandle, SessionState};
pub use supervisor::{ConnectionSupervisor, JoinError};
