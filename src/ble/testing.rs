//! In-memory peripheral that records what it was asked to do.

use super::{BleError, BlePeripheral};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Recorded {
    advertising: Option<(String, Uuid)>,
    advertise_calls: usize,
    stop_calls: usize,
    notifications: Vec<(Uuid, Vec<u8>)>,
    fail_advertising: bool,
    failing_notifies: usize,
    notify_calls: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RecordingPeripheral {
    recorded: Mutex<Recorded>,
}

impl RecordingPeripheral {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every `start_advertising` call fail.
    pub(crate) fn fail_advertising(&self) {
        self.lock().fail_advertising = true;
    }

    /// Make the next `count` notify calls fail.
    pub(crate) fn fail_notifies(&self, count: usize) {
        self.lock().failing_notifies = count;
    }

    /// Notify calls made, including failed ones.
    pub(crate) fn notify_calls(&self) -> usize {
        self.lock().notify_calls
    }

    pub(crate) fn advertising(&self) -> Option<(String, Uuid)> {
        self.lock().advertising.clone()
    }

    pub(crate) fn advertise_calls(&self) -> usize {
        self.lock().advertise_calls
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.lock().stop_calls
    }

    pub(crate) fn notifications(&self) -> Vec<Vec<u8>> {
        self.lock().notifications.iter().map(|(_, v)| v.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }
}

#[async_trait]
impl BlePeripheral for RecordingPeripheral {
    async fn start_advertising(&self, name: &str, service: Uuid) -> Result<(), BleError> {
        let mut recorded = self.lock();
        recorded.advertise_calls += 1;
        if recorded.fail_advertising {
            return Err(BleError::Adapter("no adapter".into()));
        }
        recorded.advertising = Some((name.to_string(), service));
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        let mut recorded = self.lock();
        recorded.stop_calls += 1;
        recorded.advertising = None;
        Ok(())
    }

    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BleError> {
        let mut recorded = self.lock();
        recorded.notify_calls += 1;
        if recorded.failing_notifies > 0 {
            recorded.failing_notifies -= 1;
            return Err(BleError::Notify("link busy".into()));
        }
        recorded.notifications.push((characteristic, value.to_vec()));
        Ok(())
    }
}
