//! NetworkManager WiFi driver.
//!
//! Drives the radio through the `nmcli` command line tool, the same way
//! `host_utils` drives external tools: spawn, wait, interpret the exit status.
//! Output is requested in terse mode (`-t` / `-g`) so it can be parsed
//! without locale or column-width surprises.

use super::{Credential, Encryption, LeaseInfo, LinkEvent, RawNetwork, WifiError, WifiInterface};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `nmcli` reports signal as a 0-100 percentage.
const NMCLI_QUALITY_REFERENCE: i32 = 100;

/// How often to poll for an address while waiting on DHCP.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on one `nmcli` call; the child is killed when it passes.
const NMCLI_TIMEOUT: Duration = Duration::from_secs(30);

/// NetworkManager device state for "connected".
const NM_DEVICE_STATE_CONNECTED: &str = "100";

/// WiFi driver backed by NetworkManager.
pub struct NmcliWifi {
    interface: String,
    link_check_interval: Duration,
    link_tx: broadcast::Sender<LinkEvent>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NmcliWifi {
    /// Create a driver for the given interface (e.g. `wlan0`).
    pub fn new(interface: impl Into<String>, link_check_interval: Duration) -> Self {
        let (link_tx, _) = broadcast::channel(16);
        Self {
            interface: interface.into(),
            link_check_interval,
            link_tx,
            monitor: Mutex::new(None),
        }
    }

    fn start_link_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let interface = self.interface.clone();
        let link_tx = self.link_tx.clone();
        let period = self.link_check_interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut connected = false;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let now_connected = match device_state(&interface).await {
                            Ok(state) => state.starts_with(NM_DEVICE_STATE_CONNECTED),
                            Err(e) => {
                                debug!("Link check failed: {}", e);
                                continue;
                            }
                        };
                        if now_connected != connected {
                            connected = now_connected;
                            let event = if connected { LinkEvent::Up } else { LinkEvent::Down };
                            debug!("Link {:?} on {}", event, interface);
                            let _ = link_tx.send(event);
                        }
                    }
                }
            }
        });

        *monitor = Some((cancel, handle));
    }

    fn stop_link_monitor(&self) {
        let taken = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            handle.abort();
        }
    }
}

impl Drop for NmcliWifi {
    fn drop(&mut self) {
        self.stop_link_monitor();
    }
}

#[async_trait]
impl WifiInterface for NmcliWifi {
    async fn enable(&self) -> Result<(), WifiError> {
        nmcli(&["radio", "wifi", "on"]).await?;
        // Fails if the interface does not exist
        device_state(&self.interface).await?;
        info!("WiFi radio enabled on {}", self.interface);
        self.start_link_monitor();
        Ok(())
    }

    async fn disable(&self) -> Result<(), WifiError> {
        self.stop_link_monitor();
        nmcli(&["radio", "wifi", "off"]).await?;
        info!("WiFi radio disabled");
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<RawNetwork>, WifiError> {
        let output = nmcli(&[
            "-t",
            "-f",
            "SSID,BSSID,SIGNAL,SECURITY",
            "device",
            "wifi",
            "list",
            "--rescan",
            "yes",
            "ifname",
            &self.interface,
        ])
        .await?;
        Ok(output.lines().filter_map(parse_scan_line).collect())
    }

    async fn associate(&self, ssid: &str, credential: &Credential) -> Result<(), WifiError> {
        // --ask reads the password from stdin so it never shows up in argv
        let mut child = Command::new("nmcli")
            .args(["--ask", "device", "wifi", "connect", ssid, "ifname", &self.interface])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            if !credential.is_empty() {
                let mut line = Vec::with_capacity(credential.len() + 1);
                line.extend_from_slice(credential.expose().as_bytes());
                line.push(b'\n');
                let written = stdin.write_all(&line).await;
                zeroize::Zeroize::zeroize(&mut line);
                written.map_err(|e| WifiError::Driver(e.to_string()))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WifiError::Driver(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_error(&String::from_utf8_lossy(&output.stderr), ssid))
        }
    }

    async fn acquire_lease(&self) -> Result<LeaseInfo, WifiError> {
        loop {
            let output = nmcli(&["-g", "IP4.ADDRESS", "device", "show", &self.interface]).await?;
            if let Some(ip) = parse_ip4_address(&output) {
                return Ok(LeaseInfo::new(ip));
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    async fn cancel_join(&self) -> Result<(), WifiError> {
        nmcli(&["device", "disconnect", &self.interface]).await.map(|_| ())
    }

    async fn leave(&self) -> Result<(), WifiError> {
        nmcli(&["device", "disconnect", &self.interface]).await?;
        info!("Left network on {}", self.interface);
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }

    fn quality_reference(&self) -> i32 {
        NMCLI_QUALITY_REFERENCE
    }
}

/// Run nmcli and return stdout.
async fn nmcli(args: &[&str]) -> Result<String, WifiError> {
    debug!("nmcli {}", args.join(" "));
    let output = Command::new("nmcli")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(NMCLI_TIMEOUT, output)
        .await
        .map_err(|_| {
            warn!("nmcli {} timed out after {:?}", args.join(" "), NMCLI_TIMEOUT);
            WifiError::Driver(format!("nmcli timed out after {:?}", NMCLI_TIMEOUT))
        })?
        .map_err(spawn_error)?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("nmcli {} failed: {}", args.join(" "), stderr.trim());
        Err(classify_error(&stderr, ""))
    }
}

async fn device_state(interface: &str) -> Result<String, WifiError> {
    nmcli(&["-g", "GENERAL.STATE", "device", "show", interface])
        .await
        .map(|s| s.trim().to_string())
}

fn spawn_error(e: std::io::Error) -> WifiError {
    WifiError::Driver(format!("failed to run nmcli: {}", e))
}

/// Map nmcli's stderr to a driver error.
fn classify_error(stderr: &str, ssid: &str) -> WifiError {
    let lower = stderr.to_lowercase();
    if lower.contains("secrets were required")
        || lower.contains("invalid password")
        || lower.contains("authentication")
    {
        WifiError::AuthFailed
    } else if lower.contains("no network with ssid") {
        WifiError::NotFound(ssid.to_string())
    } else if lower.contains("busy") {
        WifiError::Busy
    } else {
        WifiError::Driver(stderr.trim().to_string())
    }
}

/// Split a terse-mode line on unescaped colons.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse one `SSID:BSSID:SIGNAL:SECURITY` line.
fn parse_scan_line(line: &str) -> Option<RawNetwork> {
    let fields = split_terse(line);
    if fields.len() != 4 {
        return None;
    }
    let quality = fields[2].trim().parse().ok()?;
    let security = &fields[3];
    let encryption = Encryption::from_flags(
        security.contains("WEP"),
        security.contains("WPA1"),
        security.contains("WPA2") || security.contains("WPA3"),
    );
    Some(RawNetwork {
        ssid: fields[0].clone(),
        bssid: fields[1].clone(),
        quality,
        strength_dbm: None,
        encryption,
    })
}

/// Parse the first address out of `IP4.ADDRESS` output (`192.168.1.5/24`).
fn parse_ip4_address(output: &str) -> Option<IpAddr> {
    output
        .split(['|', '\n'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .and_then(|s| s.split('/').next())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_terse_escaped_colons() {
        let fields = split_terse(r"Home\:Net:AA\:BB\:CC\:DD\:EE\:FF:54:WPA2");
        assert_eq!(fields, vec!["Home:Net", "AA:BB:CC:DD:EE:FF", "54", "WPA2"]);
    }

    #[test]
    fn test_parse_scan_line() {
        let network = parse_scan_line(r"Stable:AA\:BB\:CC\:DD\:EE\:FF:70:WPA1 WPA2").unwrap();
        assert_eq!(network.ssid, "Stable");
        assert_eq!(network.bssid, "AA:BB:CC:DD:EE:FF");
        assert_eq!(network.quality, 70);
        assert_eq!(network.encryption, Encryption::WpaWpa2);
    }

    #[test]
    fn test_parse_open_and_hidden() {
        let network = parse_scan_line(r":AA\:BB\:CC\:DD\:EE\:01:20:").unwrap();
        assert_eq!(network.ssid, "");
        assert_eq!(network.encryption, Encryption::None);

        let network = parse_scan_line(r"Cafe:AA\:BB\:CC\:DD\:EE\:02:33:WEP").unwrap();
        assert_eq!(network.encryption, Encryption::Wep);
    }

    #[test]
    fn test_parse_scan_line_rejects_garbage() {
        assert!(parse_scan_line("").is_none());
        assert!(parse_scan_line("a:b:notanumber:WPA2").is_none());
        assert!(parse_scan_line("too:few").is_none());
    }

    #[test]
    fn test_parse_ip4_address() {
        assert_eq!(
            parse_ip4_address("192.168.1.5/24\n"),
            Some(IpAddr::from([192, 168, 1, 5]))
        );
        assert_eq!(
            parse_ip4_address("10.0.0.2/8 | 10.0.0.3/8"),
            Some(IpAddr::from([10, 0, 0, 2]))
        );
        assert_eq!(parse_ip4_address("\n"), None);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(
            classify_error("Error: Connection activation failed: Secrets were required, but not provided.", "X"),
            WifiError::AuthFailed
        );
        assert_eq!(
            classify_error("Error: No network with SSID 'Ghost' found.", "Ghost"),
            WifiError::NotFound("Ghost".into())
        );
        assert!(matches!(
            classify_error("Error: something else", ""),
            WifiError::Driver(_)
        ));
    }
}
