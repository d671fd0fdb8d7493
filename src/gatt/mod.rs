//! GATT bridge between the BLE stack and the provisioning session.
//!
//! # Long reads
//!
//! BLE clients read payloads longer than the MTU in pieces, each at a higher
//! offset. A read at offset 0 renders the payload and caches it; later
//! offsets page through the cached copy so one long read never mixes two
//! versions. The cache is dropped when the client disconnects.
//!
//! ```text
//! read(0)   -> render, cache, return [0..]
//! read(22)  -> cached[22..]
//! read(len) -> empty (end of data)
//! read(>len) -> InvalidOffset
//! ```
//!
//! # ATT error codes
//!
//! | Error         | Code |
//! |---------------|------|
//! | InvalidOffset | 0x07 |
//! | Unavailable   | 0x0E |
//! | Busy          | 0x80 |
//! | ParseError    | 0x81 |
//! | NotConnected  | 0x82 |

mod notify;
mod payload;

pub use notify::{NotifyThrottle, DEFAULT_NOTIFY_INTERVAL};
pub use payload::{
    parse_write, ParseError, ReadPayload, StatusSummary, StatusView, WriteCommand,
};

use crate::ble::{BlePeripheral, GattEvent, SERVICE_UUID};
use crate::session::{CommandError, SessionHandle};
use crate::stats::ProvisionerStats;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// ATT "Invalid Offset".
pub const ATT_INVALID_OFFSET: u8 = 0x07;
/// ATT "Unlikely Error".
pub const ATT_UNLIKELY: u8 = 0x0E;
/// Application error: a join is in progress.
pub const ATT_BUSY: u8 = 0x80;
/// Application error: malformed write payload.
pub const ATT_PARSE_ERROR: u8 = 0x81;
/// Application error: leave while not connected.
pub const ATT_NOT_CONNECTED: u8 = 0x82;

/// A rejected GATT request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("invalid offset")]
    InvalidOffset,
    #[error("busy")]
    Busy,
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("not connected")]
    NotConnected,
    #[error("service unavailable")]
    Unavailable,
}

impl GattError {
    /// ATT error code sent back to the client.
    pub fn att_code(&self) -> u8 {
        match self {
            Self::InvalidOffset => ATT_INVALID_OFFSET,
            Self::Busy => ATT_BUSY,
            Self::Parse(_) => ATT_PARSE_ERROR,
            Self::NotConnected => ATT_NOT_CONNECTED,
            Self::Unavailable => ATT_UNLIKELY,
        }
    }
}

impl From<CommandError> for GattError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Busy => Self::Busy,
            CommandError::NotConnected => Self::NotConnected,
            CommandError::ShuttingDown => Self::Unavailable,
        }
    }
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct GattSettings {
    /// Advertised device name.
    pub device_name: String,
    /// Minimum spacing between notifications.
    pub notify_interval: Duration,
}

impl Default for GattSettings {
    fn default() -> Self {
        Self {
            device_name: crate::ble::DEFAULT_DEVICE_NAME.to_string(),
            notify_interval: DEFAULT_NOTIFY_INTERVAL,
        }
    }
}

/// Serves GATT reads and writes from the session.
pub struct GattBridge {
    session: Arc<SessionHandle>,
    view: StatusView,
    peripheral: Arc<dyn BlePeripheral>,
    stats: Arc<ProvisionerStats>,
    settings: GattSettings,
    cache: Mutex<Option<Arc<Vec<u8>>>>,
    notifier: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl GattBridge {
    pub fn new(
        session: Arc<SessionHandle>,
        view: StatusView,
        peripheral: Arc<dyn BlePeripheral>,
        stats: Arc<ProvisionerStats>,
        settings: GattSettings,
    ) -> Self {
        Self {
            session,
            view,
            peripheral,
            stats,
            settings,
            cache: Mutex::new(None),
            notifier: Mutex::new(None),
        }
    }

    /// Serve a characteristic read at `offset`.
    pub fn on_read(&self, offset: usize) -> Result<Vec<u8>, GattError> {
        self.stats.gatt.record_read();

        let payload = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            match cache.as_ref() {
                Some(cached) if offset > 0 => Arc::clone(cached),
                _ => {
                    let rendered = Arc::new(self.render()?);
                    *cache = Some(Arc::clone(&rendered));
                    rendered
                }
            }
        };

        if offset > payload.len() {
            self.stats.gatt.record_rejection();
            warn!("Read at offset {} past end ({} bytes)", offset, payload.len());
            return Err(GattError::InvalidOffset);
        }
        Ok(payload[offset..].to_vec())
    }

    /// Serve a characteristic write.
    pub async fn on_write(&self, data: &[u8], offset: usize) -> Result<(), GattError> {
        self.stats.gatt.record_write();
        let result = self.apply_write(data, offset).await;
        if let Err(e) = &result {
            self.stats.gatt.record_rejection();
            warn!("Rejected write: {}", e);
        }
        result
    }

    async fn apply_write(&self, data: &[u8], offset: usize) -> Result<(), GattError> {
        if offset != 0 {
            return Err(GattError::InvalidOffset);
        }

        match parse_write(data)? {
            WriteCommand::Join(request) => {
                info!("Join requested for {}", request.ssid);
                self.session.submit_join(request).await?;
            }
            WriteCommand::Leave => {
                info!("Leave requested");
                self.session.leave().await?;
            }
            WriteCommand::Scan => {
                debug!("Rescan requested");
                self.session.rescan().await?;
            }
        }
        Ok(())
    }

    /// Handle one event from the BLE stack.
    pub async fn handle_event(&self, event: GattEvent) {
        match event {
            GattEvent::Read { offset, respond } => {
                let _ = respond.send(self.on_read(offset));
            }
            GattEvent::Write {
                data,
                offset,
                respond,
            } => {
                let result = self.on_write(&data, offset).await;
                let _ = respond.send(result);
            }
            GattEvent::Subscribe => self.start_notifications(),
            GattEvent::Unsubscribe => self.stop_notifications().await,
            GattEvent::ClientConnected(addr) => info!("Client {} connected", addr),
            GattEvent::ClientDisconnected(addr) => {
                info!("Client {} disconnected", addr);
                self.clear_cache();
                self.stop_notifications().await;
            }
            GattEvent::AdapterPowered(true) => {
                info!("Adapter powered on");
                if let Err(e) = self
                    .peripheral
                    .start_advertising(&self.settings.device_name, SERVICE_UUID)
                    .await
                {
                    error!("Failed to start advertising: {}", e);
                }
            }
            GattEvent::AdapterPowered(false) => {
                info!("Adapter powered off");
                self.clear_cache();
                self.stop_notifications().await;
                if let Err(e) = self.peripheral.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn serve(&self, mut events: mpsc::Receiver<GattEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("GATT event channel closed");
                        break;
                    }
                },
            }
        }
        self.stop_notifications().await;
    }

    pub fn is_notifying(&self) -> bool {
        self.notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn start_notifications(&self) {
        let mut notifier = self.notifier.lock().unwrap_or_else(|e| e.into_inner());
        if notifier.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = notify::spawn_notifier(
            Arc::clone(&self.peripheral),
            self.view.clone(),
            self.settings.notify_interval,
            Arc::clone(&self.stats),
            cancel.clone(),
        );
        debug!("Notifications enabled");
        *notifier = Some((cancel, handle));
    }

    async fn stop_notifications(&self) {
        let taken = self.notifier.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Notifier ended abnormally: {}", e);
            }
            debug!("Notifications disabled");
        }
    }

    fn clear_cache(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn render(&self) -> Result<Vec<u8>, GattError> {
        serde_json::to_vec(&self.view.read_payload()).map_err(|e| {
            error!("Failed to render read payload: {}", e);
            GattError::Unavailable
        })
    }
}
