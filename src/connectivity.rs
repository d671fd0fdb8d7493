//! Internet reachability checks.
//!
//! The checker only reports [`Connectivity`]; what to do about it (pausing
//! scans while online) is decided by the provisioning session.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default probe target.
pub const DEFAULT_PROBE_HOST: &str = "connectivitycheck.gstatic.com:80";

/// Default probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        *self == Self::Online
    }
}

/// Pluggable reachability probe.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Return `true` if `host` was reached within `timeout`.
    async fn probe(&self, host: &str, timeout: Duration) -> bool;
}

/// Probe that opens a TCP connection to `host:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self, host: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(host)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", host, e);
                false
            }
            Err(_) => {
                debug!("Probe {} timed out after {:?}", host, timeout);
                false
            }
        }
    }
}

/// Periodically probes a host and publishes the result.
pub struct ConnectivityChecker {
    probe: Arc<dyn ConnectivityProbe>,
    host: String,
    timeout: Duration,
    state_tx: watch::Sender<Connectivity>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectivityChecker {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, host: impl Into<String>, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(Connectivity::Offline);
        Self {
            probe,
            host: host.into(),
            timeout,
            state_tx,
            task: Mutex::new(None),
        }
    }

    /// Probe once and publish the result.
    pub async fn check_once(&self) -> Connectivity {
        let state = if self.probe.probe(&self.host, self.timeout).await {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };

        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Connectivity: {:?} -> {:?}", previous, state);
        }
        state
    }

    /// Probe every `interval` until [`stop`](Self::stop).
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            warn!("Connectivity polling already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let checker = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        checker.check_once().await;
                    }
                }
            }
        });

        *task = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let taken = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Connectivity task ended abnormally: {}", e);
            }
        }
    }

    /// Last published result (Offline until the first probe).
    pub fn current(&self) -> Connectivity {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Probe with a switchable answer.
    struct FixedProbe {
        reachable: AtomicBool,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(reachable),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self, _host: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.reachable.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn test_check_once() {
        let probe = FixedProbe::new(true);
        let checker = ConnectivityChecker::new(probe.clone(), "example:80", DEFAULT_PROBE_TIMEOUT);
        assert_eq!(checker.current(), Connectivity::Offline);
        assert_eq!(checker.check_once().await, Connectivity::Online);
        assert!(checker.current().is_online());

        probe.reachable.store(false, Ordering::Relaxed);
        assert_eq!(checker.check_once().await, Connectivity::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_publishes_changes() {
        let probe = FixedProbe::new(false);
        let checker = Arc::new(ConnectivityChecker::new(
            probe.clone(),
            "example:80",
            DEFAULT_PROBE_TIMEOUT,
        ));
        let mut rx = checker.subscribe();

        checker.start_polling(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls.load(Ordering::Relaxed), 1);

        probe.reachable.store(true, Ordering::Relaxed);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Online);

        checker.stop().await;
        let calls = probe.calls.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::Relaxed), calls);
    }

    #[tokio::test]
    async fn test_tcp_probe_unresolvable_host_is_offline() {
        let probe = TcpProbe;
        assert!(!probe.probe("host.invalid:80", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_local_listener_is_online() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe.probe(&addr, Duration::from_secs(2)).await);
    }
}
