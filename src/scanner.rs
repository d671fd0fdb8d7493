//! Periodic WiFi scanning.
//!
//! [`ScanTracker`] holds the aging logic and is fully host-testable.
//! [`NetworkScanner`] runs it on a timer against a [`WifiInterface`] and
//! publishes every cycle as an immutable [`ScanSnapshot`] through a `watch`
//! channel, so readers always get a complete list.
//!
//! # Aging
//!
//! 1. Every network in the scan result is refreshed and its miss count reset
//! 2. Every known network missing from the result gets one more miss
//! 3. Networks reaching `vanish_threshold` misses are dropped
//!
//! A failed scan call does not count as a cycle: nothing ages.

use crate::wifi::{Network, RawNetwork, WifiError, WifiInterface};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the scan event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Immutable result of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSnapshot {
    /// Number of completed scan cycles when this snapshot was taken.
    pub cycle: u64,
    /// Networks ordered by quality (strongest first), bssid on ties.
    pub networks: Vec<Network>,
    /// Set when the most recent scan call failed.
    pub scan_error: Option<String>,
}

impl ScanSnapshot {
    /// Look up a network by bssid.
    pub fn get(&self, bssid: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.bssid == bssid)
    }

    /// Check if any network advertises the given SSID.
    pub fn contains_ssid(&self, ssid: &str) -> bool {
        self.networks.iter().any(|n| n.ssid == ssid)
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Something noteworthy that happened during a scan cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A bssid was seen for the first time.
    Appeared(Network),
    /// A bssid was missing for `vanish_threshold` consecutive cycles.
    Vanished(Network),
    /// A known bssid changed its SSID or encryption.
    Changed(Network),
    /// A known bssid changed its quality.
    Signal(Network),
    /// The cycle found no networks at all.
    Empty,
    /// The scan call failed; the cycle was skipped.
    Error(WifiError),
}

#[derive(Debug, Clone)]
struct TrackedNetwork {
    network: Network,
    misses: u32,
}

/// Scan aging state machine.
#[derive(Debug)]
pub struct ScanTracker {
    vanish_threshold: u32,
    quality_reference: i32,
    known: HashMap<String, TrackedNetwork>,
    cycle: u64,
}

impl ScanTracker {
    /// Create a tracker.
    ///
    /// A `vanish_threshold` of 0 is treated as 1, so a network always
    /// survives the cycle it appeared in.
    pub fn new(vanish_threshold: u32, quality_reference: i32) -> Self {
        Self {
            vanish_threshold: vanish_threshold.max(1),
            quality_reference,
            known: HashMap::new(),
            cycle: 0,
        }
    }

    /// Fold one successful scan result into the tracked set.
    pub fn ingest(&mut self, scan: &[RawNetwork], now: Instant) -> (ScanSnapshot, Vec<ScanEvent>) {
        self.cycle += 1;
        let mut events = Vec::new();

        // Collapse duplicate bssids to the strongest report
        let mut seen: HashMap<&str, &RawNetwork> = HashMap::new();
        for raw in scan {
            match seen.get(raw.bssid.as_str()) {
                Some(existing) if existing.quality >= raw.quality => {}
                _ => {
                    seen.insert(raw.bssid.as_str(), raw);
                }
            }
        }

        if seen.is_empty() {
            events.push(ScanEvent::Empty);
        }

        for (bssid, raw) in &seen {
            let fresh = Network::from_raw(raw, self.quality_reference, now);
            match self.known.get_mut(*bssid) {
                Some(tracked) => {
                    let previous = &tracked.network;
                    if previous.ssid != fresh.ssid || previous.encryption != fresh.encryption {
                        events.push(ScanEvent::Changed(fresh.clone()));
                    } else if previous.signal_quality != fresh.signal_quality {
                        events.push(ScanEvent::Signal(fresh.clone()));
                    }
                    tracked.network = fresh;
                    tracked.misses = 0;
                }
                None => {
                    events.push(ScanEvent::Appeared(fresh.clone()));
                    self.known.insert(
                        bssid.to_string(),
                        TrackedNetwork {
                            network: fresh,
                            misses: 0,
                        },
                    );
                }
            }
        }

        let threshold = self.vanish_threshold;
        let mut vanished = Vec::new();
        for (bssid, tracked) in self.known.iter_mut() {
            if seen.contains_key(bssid.as_str()) {
                continue;
            }
            tracked.misses += 1;
            if tracked.misses >= threshold {
                vanished.push(bssid.clone());
            }
        }
        for bssid in vanished {
            if let Some(tracked) = self.known.remove(&bssid) {
                events.push(ScanEvent::Vanished(tracked.network));
            }
        }

        (self.snapshot(None), events)
    }

    /// Record a failed scan call. Nothing ages.
    pub fn record_failure(&self, error: &WifiError) -> ScanSnapshot {
        self.snapshot(Some(error.to_string()))
    }

    fn snapshot(&self, scan_error: Option<String>) -> ScanSnapshot {
        let mut networks: Vec<Network> = self.known.values().map(|t| t.network.clone()).collect();
        networks.sort_by(|a, b| {
            b.signal_quality
                .cmp(&a.signal_quality)
                .then_with(|| a.bssid.cmp(&b.bssid))
        });
        ScanSnapshot {
            cycle: self.cycle,
            networks,
            scan_error,
        }
    }
}

/// Scanner tuning.
#[derive(Debug, Clone, Copy)]
pub struct ScannerSettings {
    /// Consecutive misses before a network is dropped.
    pub vanish_threshold: u32,
    /// Overrides the driver's quality reference when set.
    pub quality_reference: Option<i32>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            vanish_threshold: 2,
            quality_reference: None,
        }
    }
}

/// Runs scan cycles and publishes snapshots.
pub struct NetworkScanner {
    wifi: Arc<dyn WifiInterface>,
    tracker: tokio::sync::Mutex<ScanTracker>,
    snapshot_tx: watch::Sender<Arc<ScanSnapshot>>,
    events_tx: broadcast::Sender<ScanEvent>,
    paused: AtomicBool,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NetworkScanner {
    pub fn new(wifi: Arc<dyn WifiInterface>, settings: ScannerSettings) -> Self {
        let reference = settings
            .quality_reference
            .unwrap_or_else(|| wifi.quality_reference());
        let (snapshot_tx, _) = watch::channel(Arc::new(ScanSnapshot::default()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            wifi,
            tracker: tokio::sync::Mutex::new(ScanTracker::new(settings.vanish_threshold, reference)),
            snapshot_tx,
            events_tx,
            paused: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Start scanning every `interval`. The first cycle runs immediately.
    ///
    /// Calling this while already running is a no-op.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            warn!("Scanner already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let scanner = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("Scanner task shutting down");
                        break;
                    }
                    _ = timer.tick() => {
                        if scanner.is_paused() {
                            continue;
                        }
                        // A stuck driver call must not hold up stop()
                        tokio::select! {
                            _ = task_cancel.cancelled() => {
                                debug!("Scan cycle abandoned");
                                break;
                            }
                            _ = scanner.scan_once() => {}
                        }
                    }
                }
            }
        });

        info!("Scanner started (every {:?})", interval);
        *task = Some((cancel, handle));
    }

    /// Stop the periodic scan. An in-progress cycle is abandoned.
    pub async fn stop(&self) {
        let taken = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Scanner task ended abnormally: {}", e);
            }
            info!("Scanner stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Skip timer ticks until [`resume`](Self::resume).
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("Scanning paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("Scanning resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Run one scan cycle now and publish the result.
    pub async fn scan_once(&self) -> Arc<ScanSnapshot> {
        // Held across the driver call so concurrent cycles cannot interleave
        let mut tracker = self.tracker.lock().await;

        let snapshot = match self.wifi.scan().await {
            Ok(scan) => {
                let (snapshot, events) = tracker.ingest(&scan, Instant::now());
                for event in events {
                    let _ = self.events_tx.send(event);
                }
                snapshot
            }
            Err(e) => {
                warn!("Scan failed, skipping cycle: {}", e);
                let snapshot = tracker.record_failure(&e);
                let _ = self.events_tx.send(ScanEvent::Error(e));
                snapshot
            }
        };

        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// The most recently published snapshot.
    pub fn current_snapshot(&self) -> Arc<ScanSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch published snapshots.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<ScanSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to appear/vanish/error events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::{Encryption, SimStep, SimulatedWifi};

    fn raw(ssid: &str, bssid: &str, quality: i32) -> RawNetwork {
        RawNetwork {
            ssid: ssid.to_string(),
            bssid: bssid.to_string(),
            quality,
            strength_dbm: None,
            encryption: Encryption::Wpa2,
        }
    }

    fn appeared(events: &[ScanEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Appeared(n) => Some(n.bssid.clone()),
                _ => None,
            })
            .collect()
    }

    fn vanished(events: &[ScanEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Vanished(n) => Some(n.bssid.clone()),
                _ => None,
            })
            .collect()
    }

    // ==================== ScanTracker Tests ====================

    #[test]
    fn test_first_sighting_appears() {
        let mut tracker = ScanTracker::new(2, 70);
        let (snapshot, events) = tracker.ingest(&[raw("Stable", "AA", 70)], Instant::now());

        assert_eq!(appeared(&events), vec!["AA"]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("AA").unwrap().signal_quality, 100);
        assert_eq!(snapshot.cycle, 1);
    }

    #[test]
    fn test_vanish_after_threshold() {
        let mut tracker = ScanTracker::new(2, 70);
        let now = Instant::now();
        tracker.ingest(&[raw("A", "AA", 50), raw("B", "BB", 50)], now);

        // One miss: still listed
        let (snapshot, events) = tracker.ingest(&[raw("A", "AA", 50)], now);
        assert!(snapshot.get("BB").is_some());
        assert!(vanished(&events).is_empty());

        // Second consecutive miss: gone
        let (snapshot, events) = tracker.ingest(&[raw("A", "AA", 50)], now);
        assert!(snapshot.get("BB").is_none());
        assert_eq!(vanished(&events), vec!["BB"]);
    }

    #[test]
    fn test_reappearance_resets_misses() {
        let mut tracker = ScanTracker::new(2, 70);
        let now = Instant::now();
        tracker.ingest(&[raw("B", "BB", 50)], now);
        tracker.ingest(&[], now);
        tracker.ingest(&[raw("B", "BB", 50)], now);
        let (snapshot, events) = tracker.ingest(&[], now);
        assert!(snapshot.get("BB").is_some());
        assert!(vanished(&events).is_empty());
    }

    #[test]
    fn test_snapshot_never_holds_vanished_networks() {
        // Pseudo-random presence pattern, checked against an independent miss count
        let threshold = 3;
        let mut tracker = ScanTracker::new(threshold, 70);
        let bssids = ["A", "B", "C", "D"];
        let mut misses = [0u32; 4];
        let mut listed = [false; 4];
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..500 {
            let mut scan = Vec::new();
            for (i, bssid) in bssids.iter().enumerate() {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                if seed % 3 == 0 {
                    scan.push(raw(bssid, bssid, 40));
                    misses[i] = 0;
                    listed[i] = true;
                } else if listed[i] {
                    misses[i] += 1;
                    if misses[i] >= threshold {
                        listed[i] = false;
                    }
                }
            }

            let (snapshot, _) = tracker.ingest(&scan, Instant::now());
            for (i, bssid) in bssids.iter().enumerate() {
                assert_eq!(snapshot.get(bssid).is_some(), listed[i], "bssid {}", bssid);
                if snapshot.get(bssid).is_some() {
                    assert!(misses[i] < threshold);
                }
            }
        }
    }

    #[test]
    fn test_duplicate_bssid_keeps_strongest() {
        let mut tracker = ScanTracker::new(2, 100);
        let (snapshot, events) =
            tracker.ingest(&[raw("A", "AA", 30), raw("A", "AA", 80)], Instant::now());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("AA").unwrap().signal_quality, 80);
        assert_eq!(appeared(&events).len(), 1);
    }

    #[test]
    fn test_snapshot_ordering() {
        let mut tracker = ScanTracker::new(2, 100);
        let (snapshot, _) = tracker.ingest(
            &[raw("low", "CC", 10), raw("high", "BB", 90), raw("tie", "AA", 90)],
            Instant::now(),
        );
        let order: Vec<_> = snapshot.networks.iter().map(|n| n.bssid.as_str()).collect();
        assert_eq!(order, vec!["AA", "BB", "CC"]);
    }

    #[test]
    fn test_change_and_signal_events() {
        let mut tracker = ScanTracker::new(2, 100);
        let now = Instant::now();
        tracker.ingest(&[raw("A", "AA", 50)], now);

        let (_, events) = tracker.ingest(&[raw("A", "AA", 60)], now);
        assert!(matches!(events.as_slice(), [ScanEvent::Signal(n)] if n.signal_quality == 60));

        let (_, events) = tracker.ingest(&[raw("Renamed", "AA", 60)], now);
        assert!(matches!(events.as_slice(), [ScanEvent::Changed(n)] if n.ssid == "Renamed"));
    }

    #[test]
    fn test_empty_scan_event() {
        let mut tracker = ScanTracker::new(2, 70);
        let (_, events) = tracker.ingest(&[], Instant::now());
        assert_eq!(events, vec![ScanEvent::Empty]);
    }

    #[test]
    fn test_failure_does_not_age() {
        let mut tracker = ScanTracker::new(1, 70);
        tracker.ingest(&[raw("A", "AA", 50)], Instant::now());

        let snapshot = tracker.record_failure(&WifiError::Busy);
        assert!(snapshot.get("AA").is_some());
        assert_eq!(snapshot.scan_error.as_deref(), Some("driver busy"));
        assert_eq!(snapshot.cycle, 1);
    }

    #[test]
    fn test_zero_threshold_acts_as_one() {
        let mut tracker = ScanTracker::new(0, 70);
        let now = Instant::now();
        let (snapshot, _) = tracker.ingest(&[raw("A", "AA", 50)], now);
        assert!(snapshot.get("AA").is_some());

        let (snapshot, events) = tracker.ingest(&[], now);
        assert!(snapshot.get("AA").is_none());
        assert_eq!(vanished(&events), vec!["AA"]);
    }

    // ==================== NetworkScanner Tests ====================

    #[tokio::test]
    async fn test_scan_once_publishes_snapshot() {
        let wifi = Arc::new(SimulatedWifi::new().with_network("Stable", "AA", 70, Encryption::None));
        let scanner = NetworkScanner::new(wifi, ScannerSettings::default());
        let mut events = scanner.subscribe_events();

        let snapshot = scanner.scan_once().await;
        assert_eq!(snapshot.get("AA").unwrap().signal_quality, 100);
        assert_eq!(scanner.current_snapshot(), snapshot);
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Appeared(n) if n.ssid == "Stable"));
    }

    #[tokio::test]
    async fn test_scan_error_is_non_fatal() {
        let wifi = Arc::new(SimulatedWifi::new().with_network("Stable", "AA", 70, Encryption::None));
        let scanner = NetworkScanner::new(wifi.clone(), ScannerSettings::default());
        let mut events = scanner.subscribe_events();

        scanner.scan_once().await;
        wifi.push_scan(SimStep::Fail(WifiError::Driver("device busy".into())));
        let snapshot = scanner.scan_once().await;
        assert!(snapshot.scan_error.is_some());
        assert!(snapshot.get("AA").is_some());

        let snapshot = scanner.scan_once().await;
        assert!(snapshot.scan_error.is_none());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, ScanEvent::Error(_));
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_quality_reference_override() {
        let wifi = Arc::new(SimulatedWifi::new().with_network("Stable", "AA", 50, Encryption::None));
        let settings = ScannerSettings {
            quality_reference: Some(100),
            ..Default::default()
        };
        let scanner = NetworkScanner::new(wifi, settings);
        let snapshot = scanner.scan_once().await;
        assert_eq!(snapshot.get("AA").unwrap().signal_quality, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_scan_and_pause() {
        let wifi = Arc::new(SimulatedWifi::demo());
        let scanner = Arc::new(NetworkScanner::new(wifi.clone(), ScannerSettings::default()));

        scanner.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(wifi.calls().scans, 3);

        scanner.pause();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(wifi.calls().scans, 3);

        scanner.resume();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(wifi.calls().scans, 4);

        scanner.stop().await;
        assert!(!scanner.is_running());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(wifi.calls().scans, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_hung_scan() {
        let wifi = Arc::new(SimulatedWifi::demo());
        wifi.push_scan(SimStep::Hang);
        let scanner = Arc::new(NetworkScanner::new(wifi.clone(), ScannerSettings::default()));

        scanner.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(wifi.calls().scans, 1);

        tokio::time::timeout(Duration::from_secs(1), scanner.stop())
            .await
            .unwrap();
        assert!(!scanner.is_running());

        // The tracker lock was released with the abandoned cycle
        let snapshot = scanner.scan_once().await;
        assert!(snapshot.contains_ssid("Stable"));
    }
}
