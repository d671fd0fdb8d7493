//! Rate-limited status notifications.
//!
//! While a client is subscribed, a notifier task watches the session status
//! and pushes the compact [`StatusSummary`](super::StatusSummary) whenever it
//! changes, at most once per `min_interval`. Changes arriving faster than that
//! are coalesced: the client gets the latest summary once the interval has
//! passed, never a backlog.

use super::payload::StatusView;
use crate::ble::{BlePeripheral, CHARACTERISTIC_UUID};
use crate::stats::ProvisionerStats;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default minimum spacing between notifications.
pub const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

/// Floor on the wait before resending a notification that failed.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Minimum-spacing limiter.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use ble_wifi_provisioner::gatt::NotifyThrottle;
///
/// let mut throttle = NotifyThrottle::new(Duration::from_secs(1));
/// let now = Instant::now();
/// assert!(throttle.try_acquire(now));
/// assert!(!throttle.try_acquire(now + Duration::from_millis(500)));
/// assert!(throttle.try_acquire(now + Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct NotifyThrottle {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl NotifyThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Earliest instant the next notification may go out.
    pub fn next_allowed(&self) -> Option<Instant> {
        self.last_sent.map(|last| last + self.min_interval)
    }

    /// Take the slot if one is free at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.next_allowed() {
            Some(next) if now < next => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// Push summaries to `peripheral` until `cancel` fires or the session goes away.
///
/// A summary the peripheral failed to deliver stays pending and is retried
/// once the throttle allows, no sooner than [`MIN_RETRY_DELAY`].
pub(crate) fn spawn_notifier(
    peripheral: Arc<dyn BlePeripheral>,
    view: StatusView,
    min_interval: Duration,
    stats: Arc<ProvisionerStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut status, _) = view.watchers();
        status.borrow_and_update();

        let mut throttle = NotifyThrottle::new(min_interval);
        let mut last_sent = None;
        let mut retry_at = None;
        // A fresh subscriber gets the current status right away
        let mut pending = true;

        loop {
            if pending {
                if let Some(next) = throttle.next_allowed() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(next) => {}
                    }
                }

                let summary = view.summary();
                if last_sent.as_ref() == Some(&summary) {
                    pending = false;
                } else if throttle.try_acquire(Instant::now()) {
                    match serde_json::to_vec(&summary) {
                        Ok(value) => match peripheral.notify(CHARACTERISTIC_UUID, &value).await {
                            Ok(()) => {
                                stats.gatt.record_notification();
                                last_sent = Some(summary);
                                retry_at = None;
                                pending = false;
                            }
                            Err(e) => {
                                warn!("Notification failed, will retry: {}", e);
                                retry_at = Some(Instant::now() + min_interval.max(MIN_RETRY_DELAY));
                            }
                        },
                        Err(e) => {
                            warn!("Failed to render notification: {}", e);
                            pending = false;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    status.borrow_and_update();
                    pending = true;
                }
                _ = sleep_until_retry(retry_at), if pending => {
                    retry_at = None;
                }
            }
        }
        debug!("Notifier stopped");
    })
}

async fn sleep_until_retry(retry_at: Option<Instant>) {
    match retry_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_spacing() {
        let mut throttle = NotifyThrottle::new(Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(throttle.next_allowed(), None);
        assert!(throttle.try_acquire(start));
        assert_eq!(throttle.next_allowed(), Some(start + Duration::from_secs(1)));
        assert!(!throttle.try_acquire(start + Duration::from_millis(999)));
        assert!(throttle.try_acquire(start + Duration::from_millis(1000)));
        assert!(!throttle.try_acquire(start + Duration::from_millis(1500)));
    }

    #[test]
    fn test_zero_interval_never_blocks() {
        let mut throttle = NotifyThrottle::new(Duration::ZERO);
        let now = Instant::now();
        assert!(throttle.try_acquire(now));
        assert!(throttle.try_acquire(now));
    }
}
