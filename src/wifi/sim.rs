//! Simulated WiFi driver.
//!
//! Scriptable stand-in for a real driver: a fixed set of visible networks,
//! queued scan failures, and per-attempt association/lease outcomes. Used by
//! the test suite and by `PROVISIONER_WIFI_BACKEND=sim`.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::wifi::{Encryption, SimStep, SimulatedWifi, WifiError};
//!
//! let wifi = SimulatedWifi::new()
//!     .with_network("Stable", "AA", 70, Encryption::None)
//!     .with_lease_ip([192, 168, 1, 5].into());
//! wifi.push_association(SimStep::Fail(WifiError::AuthFailed));
//! ```

use super::{Credential, Encryption, LeaseInfo, LinkEvent, RawNetwork, WifiError, WifiInterface};
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Outcome of one scripted association or lease attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimStep {
    Succeed,
    Fail(WifiError),
    /// Never completes; only a timeout or cancellation ends it.
    Hang,
}

/// Call counters, for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub enables: usize,
    pub disables: usize,
    pub scans: usize,
    pub associations: usize,
    pub leases: usize,
    pub cancels: usize,
    pub leaves: usize,
}

#[derive(Debug)]
struct SimState {
    enabled: bool,
    enable_failure: Option<WifiError>,
    networks: Vec<RawNetwork>,
    scan_steps: VecDeque<SimStep>,
    association_steps: VecDeque<SimStep>,
    lease_steps: VecDeque<SimStep>,
    lease_ip: IpAddr,
    associated: Option<String>,
    calls: SimCalls,
}

/// In-memory WiFi driver.
pub struct SimulatedWifi {
    state: Mutex<SimState>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl SimulatedWifi {
    /// Empty airwaves, every attempt succeeds.
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SimState {
                enabled: false,
                enable_failure: None,
                networks: Vec::new(),
                scan_steps: VecDeque::new(),
                association_steps: VecDeque::new(),
                lease_steps: VecDeque::new(),
                lease_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
                associated: None,
                calls: SimCalls::default(),
            }),
            link_tx,
        }
    }

    /// A small neighbourhood of networks for demo mode.
    pub fn demo() -> Self {
        Self::new()
            .with_network("Stable", "02:00:00:00:00:01", 70, Encryption::None)
            .with_network("HomeNet", "02:00:00:00:00:02", 52, Encryption::Wpa2)
            .with_network("CoffeeShop", "02:00:00:00:00:03", 31, Encryption::WpaWpa2)
            .with_network("", "02:00:00:00:00:04", 12, Encryption::Wep)
    }

    /// Add a visible network.
    pub fn with_network(self, ssid: &str, bssid: &str, quality: i32, encryption: Encryption) -> Self {
        self.lock().networks.push(RawNetwork {
            ssid: ssid.to_string(),
            bssid: bssid.to_string(),
            quality,
            strength_dbm: Some(quality - 110),
            encryption,
        });
        self
    }

    /// Set the address handed out by the simulated DHCP server.
    pub fn with_lease_ip(self, ip: IpAddr) -> Self {
        self.lock().lease_ip = ip;
        self
    }

    /// Make the next `enable` call fail.
    pub fn fail_enable(&self, error: WifiError) {
        self.lock().enable_failure = Some(error);
    }

    /// Replace the visible networks.
    pub fn set_networks(&self, networks: Vec<RawNetwork>) {
        self.lock().networks = networks;
    }

    /// Script the outcome of the next scan.
    pub fn push_scan(&self, step: SimStep) {
        self.lock().scan_steps.push_back(step);
    }

    /// Queue the outcome of the next association attempt.
    pub fn push_association(&self, step: SimStep) {
        self.lock().association_steps.push_back(step);
    }

    /// Queue the outcome of the next lease request.
    pub fn push_lease(&self, step: SimStep) {
        self.lock().lease_steps.push_back(step);
    }

    /// Simulate the access point going away.
    pub fn drop_link(&self) {
        self.lock().associated = None;
        let _ = self.link_tx.send(LinkEvent::Down);
    }

    pub fn calls(&self) -> SimCalls {
        self.lock().calls
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn associated_ssid(&self) -> Option<String> {
        self.lock().associated.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the remaining assertions
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimulatedWifi {
    fn default() -> Self {
        Self::new()
    }
}

async fn play(step: SimStep) -> Result<(), WifiError> {
    match step {
        SimStep::Succeed => Ok(()),
        SimStep::Fail(e) => Err(e),
        SimStep::Hang => std::future::pending().await,
    }
}

#[async_trait]
impl WifiInterface for SimulatedWifi {
    async fn enable(&self) -> Result<(), WifiError> {
        let mut state = self.lock();
        state.calls.enables += 1;
        if let Some(e) = state.enable_failure.take() {
            return Err(e);
        }
        state.enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<(), WifiError> {
        let mut state = self.lock();
        state.calls.disables += 1;
        state.enabled = false;
        state.associated = None;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<RawNetwork>, WifiError> {
        let step = {
            let mut state = self.lock();
            state.calls.scans += 1;
            state.scan_steps.pop_front().unwrap_or(SimStep::Succeed)
        };
        play(step).await?;
        Ok(self.lock().networks.clone())
    }

    async fn associate(&self, ssid: &str, _credential: &Credential) -> Result<(), WifiError> {
        let step = {
            let mut state = self.lock();
            state.calls.associations += 1;
            if !state.networks.iter().any(|n| n.ssid == ssid) {
                return Err(WifiError::NotFound(ssid.to_string()));
            }
            state.association_steps.pop_front().unwrap_or(SimStep::Succeed)
        };
        debug!("sim: associate {} -> {:?}", ssid, step);
        play(step).await?;
        self.lock().associated = Some(ssid.to_string());
        Ok(())
    }

    async fn acquire_lease(&self) -> Result<LeaseInfo, WifiError> {
        let step = {
            let mut state = self.lock();
            state.calls.leases += 1;
            state.lease_steps.pop_front().unwrap_or(SimStep::Succeed)
        };
        debug!("sim: lease -> {:?}", step);
        play(step).await?;
        let ip = self.lock().lease_ip;
        let _ = self.link_tx.send(LinkEvent::Up);
        Ok(LeaseInfo::new(ip))
    }

    async fn cancel_join(&self) -> Result<(), WifiError> {
        let mut state = self.lock();
        state.calls.cancels += 1;
        state.associated = None;
        Ok(())
    }

    async fn leave(&self) -> Result<(), WifiError> {
        {
            let mut state = self.lock();
            state.calls.leaves += 1;
            state.associated = None;
        }
        let _ = self.link_tx.send(LinkEvent::Down);
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}
