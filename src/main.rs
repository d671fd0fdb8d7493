//! Provisioner daemon.
//!
//! Runs the provisioner with the console BLE stand-in until SIGINT or
//! SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Against NetworkManager on wlan0
//! provisioner
//!
//! # Demo mode with simulated networks
//! PROVISIONER_WIFI_BACKEND=sim PROVISIONER_STATUS_PORT=8080 provisioner
//! ```
//!
//! # Exit codes
//!
//! - 0: clean shutdown
//! - 1: WiFi or BLE failed to initialize
//! - 2: invalid configuration

use ble_wifi_provisioner::ble::{BlePeripheral, ConsolePeripheral};
use ble_wifi_provisioner::connectivity::TcpProbe;
use ble_wifi_provisioner::wifi::{NmcliWifi, SimulatedWifi, WifiInterface};
use ble_wifi_provisioner::{Provisioner, ProvisionerConfig, WifiBackendKind};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the GATT event channel.
const GATT_EVENT_CAPACITY: usize = 32;

/// How long runtime teardown waits for tasks still blocked in the driver.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ProvisionerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(run(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    code
}

async fn run(config: ProvisionerConfig) -> ExitCode {
    info!("=== BLE WiFi provisioner starting ===");
    info!(
        "Device {} on {} ({:?} backend)",
        config.device_name, config.interface, config.wifi_backend
    );

    let wifi: Arc<dyn WifiInterface> = match config.wifi_backend {
        WifiBackendKind::Nmcli => Arc::new(NmcliWifi::new(
            config.interface.clone(),
            config.link_check_interval,
        )),
        WifiBackendKind::Sim => Arc::new(SimulatedWifi::demo()),
    };

    let console = Arc::new(ConsolePeripheral::new());
    let (events_tx, events_rx) = mpsc::channel(GATT_EVENT_CAPACITY);
    let reader_cancel = CancellationToken::new();
    if let Err(e) = console.spawn_reader(events_tx, reader_cancel.clone()) {
        error!("Failed to start console reader: {}", e);
        return ExitCode::from(1);
    }

    let peripheral: Arc<dyn BlePeripheral> = console;
    let provisioner = Provisioner::new(config, wifi, peripheral, Arc::new(TcpProbe));

    let result = provisioner.run(events_rx, shutdown_signal()).await;
    reader_cancel.cancel();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
