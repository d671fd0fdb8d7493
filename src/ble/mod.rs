//! BLE peripheral boundary.
//!
//! The provisioner exposes one GATT characteristic inside one service:
//!
//! ```text
//! Service 000012ab-0000-1000-8000-00805f9b34fb
//! └── Characteristic 000034cd-0000-1000-8000-00805f9b34fb (Read, Write, Notify)
//! ```
//!
//! A BLE stack is plugged in through two halves:
//!
//! - outbound calls on [`BlePeripheral`] (advertising, notifications)
//! - inbound [`GattEvent`]s on an mpsc channel, each read or write carrying
//!   a oneshot responder for the ATT result

mod console;
#[cfg(test)]
pub(crate) mod testing;

pub use console::{ConsoleCommand, ConsolePeripheral};

use crate::gatt::GattError;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Bluetooth SIG base UUID; 16-bit UUIDs occupy bits 96..112.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Provisioning service.
pub const SERVICE_UUID: Uuid = uuid_from_u16(0x12ab);

/// Status / credentials characteristic.
pub const CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x34cd);

/// Default advertised device name.
pub const DEFAULT_DEVICE_NAME: &str = "MyDevice";

/// Responder for a characteristic read.
pub type ReadResponder = oneshot::Sender<Result<Vec<u8>, GattError>>;

/// Responder for a characteristic write.
pub type WriteResponder = oneshot::Sender<Result<(), GattError>>;

/// Something the BLE stack wants the provisioner to handle.
pub enum GattEvent {
    /// Read (or long-read continuation) at `offset`.
    Read {
        offset: usize,
        respond: ReadResponder,
    },
    /// Write at `offset`. The buffer may hold a password and is wiped on drop.
    Write {
        data: Zeroizing<Vec<u8>>,
        offset: usize,
        respond: WriteResponder,
    },
    /// Client enabled notifications.
    Subscribe,
    /// Client disabled notifications.
    Unsubscribe,
    ClientConnected(String),
    ClientDisconnected(String),
    /// Adapter powered on (`true`) or off.
    AdapterPowered(bool),
}

impl fmt::Debug for GattEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { offset, .. } => f.debug_struct("Read").field("offset", offset).finish(),
            // Never print the payload
            Self::Write { data, offset, .. } => f
                .debug_struct("Write")
                .field("len", &data.len())
                .field("offset", offset)
                .finish(),
            Self::Subscribe => f.write_str("Subscribe"),
            Self::Unsubscribe => f.write_str("Unsubscribe"),
            Self::ClientConnected(addr) => f.debug_tuple("ClientConnected").field(addr).finish(),
            Self::ClientDisconnected(addr) => {
                f.debug_tuple("ClientDisconnected").field(addr).finish()
            }
            Self::AdapterPowered(on) => f.debug_tuple("AdapterPowered").field(on).finish(),
        }
    }
}

/// Outbound half of a BLE stack.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Advertise `name` with the given service.
    async fn start_advertising(&self, name: &str, service: Uuid) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Push a value to subscribed clients.
    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BleError>;
}

/// BLE stack failures.
#[derive(Debug, Error)]
pub enum BleError {
    #[error("adapter unavailable: {0}")]
    Adapter(String),
    #[error("notification failed: {0}")]
    Notify(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_expand_on_base() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "000012ab-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "000034cd-0000-1000-8000-00805f9b34fb"
        );
    }
}
