//! Top-level wiring.
//!
//! [`Provisioner`] owns every component for one process. [`Provisioner::run`]
//! brings them up in order, serves until the shutdown future resolves, then
//! tears them down:
//!
//! ```text
//! startup:  enable WiFi -> advertise -> scanner/connectivity/session -> GATT loop
//! shutdown: GATT loop -> scanner -> in-flight join (bounded grace)
//!           -> connectivity -> disable WiFi -> stop advertising
//! ```
//!
//! Only the first two startup steps are fatal. Shutdown failures are logged
//! and otherwise ignored.

use crate::ble::{BleError, BlePeripheral, GattEvent, SERVICE_UUID};
use crate::config::ProvisionerConfig;
use crate::connectivity::{ConnectivityChecker, ConnectivityProbe};
use crate::gatt::{GattBridge, GattSettings, StatusView};
use crate::scanner::{NetworkScanner, ScanEvent, ScanSnapshot, ScannerSettings};
use crate::session::{ProvisioningSession, SessionSettings, SessionState, StatusUpdate};
use crate::stats::ProvisionerStats;
use crate::status_server::StatusServer;
use crate::supervisor::ConnectionSupervisor;
use crate::wifi::{Network, WifiError, WifiInterface};
use log::{debug, error, info, warn, Level};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Startup failures. Each one ends the process.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("WiFi init failed: {0}")]
    Wifi(#[from] WifiError),
    #[error("BLE init failed: {0}")]
    Ble(#[from] BleError),
}

/// One provisioning process.
pub struct Provisioner {
    config: ProvisionerConfig,
    wifi: Arc<dyn WifiInterface>,
    peripheral: Arc<dyn BlePeripheral>,
    probe: Arc<dyn ConnectivityProbe>,
    stats: Arc<ProvisionerStats>,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        wifi: Arc<dyn WifiInterface>,
        peripheral: Arc<dyn BlePeripheral>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            config,
            wifi,
            peripheral,
            probe,
            stats: Arc::new(ProvisionerStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<ProvisionerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve `gatt_events` until `shutdown` resolves.
    pub async fn run<S>(
        &self,
        gatt_events: mpsc::Receiver<GattEvent>,
        shutdown: S,
    ) -> Result<(), InitError>
    where
        S: Future<Output = ()>,
    {
        let config = &self.config;

        if let Err(e) = self.wifi.enable().await {
            error!("Failed to enable WiFi: {}", e);
            return Err(e.into());
        }
        if let Err(e) = self
            .peripheral
            .start_advertising(&config.device_name, SERVICE_UUID)
            .await
        {
            error!("Failed to start advertising: {}", e);
            if let Err(e) = self.wifi.disable().await {
                warn!("Failed to disable WiFi: {}", e);
            }
            return Err(e.into());
        }
        info!("Advertising as {}", config.device_name);

        let scanner = Arc::new(NetworkScanner::new(
            Arc::clone(&self.wifi),
            ScannerSettings {
                vanish_threshold: config.vanish_threshold,
                quality_reference: config.quality_reference,
            },
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(Arc::clone(&self.wifi)));
        let checker = Arc::new(ConnectivityChecker::new(
            Arc::clone(&self.probe),
            config.probe_host.clone(),
            config.probe_timeout,
        ));
        checker.start_polling(config.connectivity_interval);

        let session = Arc::new(
            ProvisioningSession::new(
                Arc::clone(&self.wifi),
                Arc::clone(&scanner),
                supervisor,
                SessionSettings {
                    scan_interval: config.scan_interval,
                    join_timeout: config.join_timeout,
                    association_retries: config.association_retries,
                    shutdown_grace: config.shutdown_grace,
                },
            )
            .with_connectivity(checker.subscribe())
            .spawn(),
        );

        let cancel = CancellationToken::new();
        let activity = spawn_activity_log(
            scanner.subscribe_events(),
            scanner.subscribe_snapshots(),
            session.subscribe_updates(),
            Arc::clone(&self.stats),
            cancel.clone(),
        );

        if let Err(e) = session.start().await {
            warn!("Session did not start: {}", e);
        }

        let view = StatusView::new(session.subscribe_status(), scanner.subscribe_snapshots());
        let mut status_server = config.status_port.and_then(|port| {
            StatusServer::start(None, port, view.clone(), Arc::clone(&self.stats))
                .map_err(|e| error!("Status server disabled: {}", e))
                .ok()
        });

        let bridge = Arc::new(GattBridge::new(
            Arc::clone(&session),
            view,
            Arc::clone(&self.peripheral),
            Arc::clone(&self.stats),
            GattSettings {
                device_name: config.device_name.clone(),
                notify_interval: config.notify_interval,
            },
        ));
        let serve_bridge = Arc::clone(&bridge);
        let serve_cancel = cancel.clone();
        let gatt_task = tokio::spawn(async move {
            serve_bridge.serve(gatt_events, serve_cancel).await;
        });

        info!("Provisioner running");
        shutdown.await;
        info!("Shutting down");

        cancel.cancel();
        for (name, task) in [("GATT", gatt_task), ("activity", activity)] {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }

        session.shutdown().await;
        checker.stop().await;
        if let Err(e) = self.wifi.disable().await {
            warn!("Failed to disable WiFi: {}", e);
        }
        if let Err(e) = self.peripheral.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        if let Some(server) = status_server.as_mut() {
            server.stop();
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn describe(network: &Network) -> String {
    let strength = network
        .strength_dbm
        .map(|dbm| format!(" {} dBm", dbm))
        .unwrap_or_default();
    format!(
        "{} [{}] {}%{} {}",
        network.display_ssid(),
        network.bssid,
        network.signal_quality,
        strength,
        network.encryption
    )
}

/// Log line for a scan event, in the bracketed tag format.
fn scan_event_line(event: &ScanEvent) -> (Level, String) {
    match event {
        ScanEvent::Appeared(n) => (Level::Info, format!("[  APPEAR] {}", describe(n))),
        ScanEvent::Vanished(n) => (
            Level::Info,
            format!("[  VANISH] {} [{}]", n.display_ssid(), n.bssid),
        ),
        ScanEvent::Changed(n) => (Level::Info, format!("[  CHANGE] {}", describe(n))),
        ScanEvent::Signal(n) => (Level::Debug, format!("[  SIGNAL] {}", describe(n))),
        ScanEvent::Empty => (Level::Debug, "[   EMPTY] No networks found".to_string()),
        ScanEvent::Error(e) => (Level::Warn, format!("[   ERROR] Scan failed: {}", e)),
    }
}

/// Log line for a session transition, if it is worth one.
fn transition_line(update: &StatusUpdate) -> Option<String> {
    match (update.from, update.to) {
        (_, SessionState::AwaitingLease) => Some("[    JOIN] Associated".to_string()),
        (_, SessionState::Connected) => Some("[    DHCP] Leased".to_string()),
        (SessionState::Connected, SessionState::Scanning) => {
            Some("[   LEAVE] Left the network".to_string())
        }
        (_, SessionState::Failed) => match update.reason {
            Some(reason) => Some(format!("[   ERROR] Join failed: {:?}", reason)),
            None => Some("[   ERROR] Join failed".to_string()),
        },
        _ => None,
    }
}

fn record_scan_event(stats: &ProvisionerStats, event: &ScanEvent) {
    match event {
        ScanEvent::Appeared(_) => stats.scan.record_appeared(),
        ScanEvent::Vanished(_) => stats.scan.record_vanished(),
        ScanEvent::Error(_) => stats.scan.record_error(),
        _ => {}
    }
}

fn record_transition(stats: &ProvisionerStats, update: &StatusUpdate) {
    match update.to {
        SessionState::Joining => stats.join.record_attempt(),
        SessionState::Connected => stats.join.record_success(),
        SessionState::Failed => stats.join.record_failure(),
        _ => {}
    }
}

/// Log scan and session activity and keep the counters current.
fn spawn_activity_log(
    mut scan_events: broadcast::Receiver<ScanEvent>,
    mut snapshots: watch::Receiver<Arc<ScanSnapshot>>,
    mut updates: broadcast::Receiver<StatusUpdate>,
    stats: Arc<ProvisionerStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Drain pending activity before honouring cancellation
            tokio::select! {
                biased;

                event = scan_events.recv() => match event {
                    Ok(event) => {
                        record_scan_event(&stats, &event);
                        let (level, line) = scan_event_line(&event);
                        log::log!(level, "{}", line);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Activity log missed {} scan events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let cycle = snapshots.borrow_and_update().cycle;
                    stats.scan.set_cycles(cycle);
                }

                update = updates.recv() => match update {
                    Ok(update) => {
                        record_transition(&stats, &update);
                        if let Some(line) = transition_line(&update) {
                            info!("{}", line);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Activity log missed {} transitions", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::testing::RecordingPeripheral;
    use crate::wifi::{Encryption, RawNetwork, SimulatedWifi};
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tokio::sync::oneshot;
    use zeroize::Zeroizing;

    struct Unreachable;

    #[async_trait]
    impl ConnectivityProbe for Unreachable {
        async fn probe(&self, _host: &str, _timeout: Duration) -> bool {
            false
        }
    }

    fn config() -> ProvisionerConfig {
        ProvisionerConfig {
            scan_interval: Duration::from_secs(1),
            ..ProvisionerConfig::default()
        }
    }

    fn provisioner(wifi: Arc<SimulatedWifi>, peripheral: Arc<RecordingPeripheral>) -> Provisioner {
        Provisioner::new(config(), wifi, peripheral, Arc::new(Unreachable))
    }

    fn network(ssid: &str, dbm: Option<i32>) -> Network {
        let raw = RawNetwork {
            ssid: ssid.into(),
            bssid: "02:00:00:00:00:01".into(),
            quality: 70,
            strength_dbm: dbm,
            encryption: Encryption::Wpa2,
        };
        Network::from_raw(&raw, 70, Instant::now())
    }

    #[test]
    fn test_scan_event_lines() {
        let (level, line) = scan_event_line(&ScanEvent::Appeared(network("Stable", Some(-40))));
        assert_eq!(level, Level::Info);
        assert_eq!(line, "[  APPEAR] Stable [02:00:00:00:00:01] 100% -40 dBm WPA2");

        let (_, line) = scan_event_line(&ScanEvent::Vanished(network("", None)));
        assert_eq!(line, "[  VANISH] <HIDDEN> [02:00:00:00:00:01]");

        let (level, _) = scan_event_line(&ScanEvent::Signal(network("Stable", None)));
        assert_eq!(level, Level::Debug);
    }

    #[test]
    fn test_transition_lines() {
        let update = |from, to| StatusUpdate {
            seq: 1,
            from,
            to,
            reason: None,
        };
        assert!(transition_line(&update(SessionState::Idle, SessionState::Scanning)).is_none());
        assert_eq!(
            transition_line(&update(SessionState::Connected, SessionState::Scanning)).as_deref(),
            Some("[   LEAVE] Left the network")
        );
        assert!(transition_line(&update(SessionState::Failed, SessionState::Scanning)).is_none());
    }

    #[tokio::test]
    async fn test_wifi_init_failure() {
        let wifi = Arc::new(SimulatedWifi::demo());
        wifi.fail_enable(WifiError::Driver("rfkill".into()));
        let peripheral = Arc::new(RecordingPeripheral::new());
        let (_tx, rx) = mpsc::channel(4);

        let result = provisioner(wifi, peripheral.clone()).run(rx, async {}).await;
        assert!(matches!(result, Err(InitError::Wifi(_))));
        assert_eq!(peripheral.advertise_calls(), 0);
    }

    #[tokio::test]
    async fn test_ble_init_failure_disables_wifi() {
        let wifi = Arc::new(SimulatedWifi::demo());
        let peripheral = Arc::new(RecordingPeripheral::new());
        peripheral.fail_advertising();
        let (_tx, rx) = mpsc::channel(4);

        let result = provisioner(wifi.clone(), peripheral).run(rx, async {}).await;
        assert!(matches!(result, Err(InitError::Ble(_))));
        assert!(!wifi.is_enabled());
    }

    #[tokio::test]
    async fn test_end_to_end_provisioning() {
        let wifi = Arc::new(SimulatedWifi::demo());
        let peripheral = Arc::new(RecordingPeripheral::new());
        let provisioner = provisioner(wifi.clone(), peripheral.clone());
        let stats = provisioner.stats();
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = tokio::spawn(async move {
            provisioner
                .run(rx, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        // Wait for the first scan to find the network
        let read = |offset| {
            let tx = tx.clone();
            async move {
                let (respond, response) = oneshot::channel();
                tx.send(GattEvent::Read { offset, respond }).await.unwrap();
                String::from_utf8(response.await.unwrap().unwrap()).unwrap()
            }
        };
        let mut payload = read(0).await;
        while !payload.contains(r#""ssid":"Stable""#) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            payload = read(0).await;
        }
        assert!(payload.contains(r#""state":"Scanning""#));

        let (respond, response) = oneshot::channel();
        tx.send(GattEvent::Write {
            data: Zeroizing::new(br#"{"ssid":"Stable","pwd":""}"#.to_vec()),
            offset: 0,
            respond,
        })
        .await
        .unwrap();
        assert_eq!(response.await.unwrap(), Ok(()));

        while !payload.contains(r#""state":"Connected""#) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            payload = read(0).await;
        }
        assert!(payload.contains(r#""ip":"192.168.1.5""#));

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert!(!wifi.is_enabled());
        assert_eq!(wifi.calls().disables, 1);
        assert!(peripheral.advertising().is_none());
        assert_eq!(stats.join.attempts(), 1);
        assert_eq!(stats.join.successes(), 1);
        assert!(stats.scan.cycles() >= 1);
    }
}
