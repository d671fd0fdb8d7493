//! Join supervision: deadlines and cancellation for association + DHCP.
//!
//! A join is one operation with one overall deadline. Whichever phase is
//! still running when the deadline passes decides the error:
//!
//! ```text
//! associate ──ok──▶ acquire_lease ──ok──▶ LeaseInfo
//!     │                   │
//!  deadline            deadline
//!     ▼                   ▼
//! AssociationTimeout  LeaseTimeout
//! ```
//!
//! On timeout or cancellation the driver's join is cancelled before the join
//! lock is released. Retrying is the caller's business.

use crate::wifi::{Credential, LeaseInfo, WifiError, WifiInterface};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default overall deadline for association plus DHCP.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Phase of an in-flight join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Associating,
    /// Associated, waiting for DHCP.
    AwaitingLease,
}

/// Why a join did not produce a lease.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("association timed out")]
    AssociationTimeout,
    #[error("DHCP lease timed out")]
    LeaseTimeout,
    #[error("join cancelled")]
    Cancelled,
    /// Another join holds the interface.
    #[error("another join is in progress")]
    Busy,
    #[error("driver error: {0}")]
    Driver(String),
}

/// Either token ends the join.
struct Cancel<'a> {
    scoped: &'a CancellationToken,
    caller: &'a CancellationToken,
}

enum Interrupted {
    Deadline,
    Cancelled,
}

/// Owns the WiFi interface's join lock.
pub struct ConnectionSupervisor {
    wifi: Arc<dyn WifiInterface>,
    join_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
}

impl ConnectionSupervisor {
    pub fn new(wifi: Arc<dyn WifiInterface>) -> Self {
        Self {
            wifi,
            join_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Associate and acquire a lease within `timeout`.
    pub async fn join(
        &self,
        ssid: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<LeaseInfo, JoinError> {
        self.join_observed(ssid, credential, timeout, &CancellationToken::new(), |_| {})
            .await
    }

    /// Like [`join`](Self::join), reporting each phase as it starts.
    ///
    /// The join also ends with [`JoinError::Cancelled`] once `cancel` fires,
    /// including when it fired before the join began.
    pub async fn join_observed<F>(
        &self,
        ssid: &str,
        credential: &Credential,
        timeout: Duration,
        cancel: &CancellationToken,
        mut on_phase: F,
    ) -> Result<LeaseInfo, JoinError>
    where
        F: FnMut(JoinPhase) + Send,
    {
        let _guard = self.join_lock.try_lock().map_err(|_| JoinError::Busy)?;
        let scoped = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).child_token();
        let cancel = Cancel {
            scoped: &scoped,
            caller: cancel,
        };
        let deadline = Instant::now() + timeout;

        info!("Joining {} (timeout {:?})", ssid, timeout);
        on_phase(JoinPhase::Associating);
        match self.run_phase(&cancel, deadline, self.wifi.associate(ssid, credential)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(association_error(e, ssid)),
            Err(interrupted) => {
                self.abort_join().await;
                return Err(match interrupted {
                    Interrupted::Deadline => JoinError::AssociationTimeout,
                    Interrupted::Cancelled => JoinError::Cancelled,
                });
            }
        }

        debug!("Associated with {}, waiting for DHCP", ssid);
        on_phase(JoinPhase::AwaitingLease);
        match self.run_phase(&cancel, deadline, self.wifi.acquire_lease()).await {
            Ok(Ok(lease)) => {
                info!("Leased {} on {}", lease.ip_address, ssid);
                Ok(lease)
            }
            Ok(Err(e)) => {
                self.abort_join().await;
                Err(JoinError::Driver(e.to_string()))
            }
            Err(interrupted) => {
                self.abort_join().await;
                Err(match interrupted {
                    Interrupted::Deadline => JoinError::LeaseTimeout,
                    Interrupted::Cancelled => JoinError::Cancelled,
                })
            }
        }
    }

    /// Cancel every in-flight join. Later joins are unaffected.
    pub fn cancel_all(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        cancel.cancel();
        *cancel = CancellationToken::new();
    }

    /// Check if a join currently holds the interface.
    pub fn is_joining(&self) -> bool {
        self.join_lock.try_lock().is_err()
    }

    async fn run_phase<T, Fut>(
        &self,
        cancel: &Cancel<'_>,
        deadline: Instant,
        phase: Fut,
    ) -> Result<Result<T, WifiError>, Interrupted>
    where
        Fut: Future<Output = Result<T, WifiError>>,
    {
        tokio::select! {
            biased;

            _ = cancel.scoped.cancelled() => Err(Interrupted::Cancelled),
            _ = cancel.caller.cancelled() => Err(Interrupted::Cancelled),
            result = tokio::time::timeout_at(deadline, phase) => {
                result.map_err(|_| Interrupted::Deadline)
            }
        }
    }

    async fn abort_join(&self) {
        if let Err(e) = self.wifi.cancel_join().await {
            error!("Failed to cancel driver join: {}", e);
        }
    }
}

fn association_error(e: WifiError, ssid: &str) -> JoinError {
    warn!("Association with {} failed: {}", ssid, e);
    match e {
        WifiError::AuthFailed => JoinError::AuthFailed,
        WifiError::NotFound(_) => JoinError::NetworkNotFound(ssid.to_string()),
        // Transient; counts as an association that did not complete in time
        WifiError::Busy => JoinError::AssociationTimeout,
        WifiError::Driver(msg) => JoinError::Driver(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::{Encryption, SimStep, SimulatedWifi};
    use std::net::IpAddr;

    fn setup() -> (Arc<SimulatedWifi>, Arc<ConnectionSupervisor>) {
        let wifi = Arc::new(
            SimulatedWifi::new()
                .with_network("Stable", "AA", 70, Encryption::None)
                .with_lease_ip([192, 168, 1, 5].into()),
        );
        let supervisor = Arc::new(ConnectionSupervisor::new(wifi.clone()));
        (wifi, supervisor)
    }

    #[tokio::test]
    async fn test_successful_join_reports_phases() {
        let (_wifi, supervisor) = setup();
        let mut phases = Vec::new();

        let lease = supervisor
            .join_observed(
                "Stable",
                &Credential::default(),
                DEFAULT_JOIN_TIMEOUT,
                &CancellationToken::new(),
                |p| phases.push(p),
            )
            .await
            .unwrap();

        assert_eq!(lease.ip_address, IpAddr::from([192, 168, 1, 5]));
        assert_eq!(phases, vec![JoinPhase::Associating, JoinPhase::AwaitingLease]);
        assert!(!supervisor.is_joining());
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let (wifi, supervisor) = setup();
        wifi.push_association(SimStep::Fail(WifiError::AuthFailed));
        let result = supervisor
            .join("Stable", &Credential::new("wrongpassword"), DEFAULT_JOIN_TIMEOUT)
            .await;
        assert_eq!(result, Err(JoinError::AuthFailed));
    }

    #[tokio::test]
    async fn test_network_not_found() {
        let (_wifi, supervisor) = setup();
        let result = supervisor
            .join("Ghost", &Credential::default(), DEFAULT_JOIN_TIMEOUT)
            .await;
        assert_eq!(result, Err(JoinError::NetworkNotFound("Ghost".into())));
    }

    #[tokio::test]
    async fn test_driver_busy_counts_as_association_timeout() {
        let (wifi, supervisor) = setup();
        wifi.push_association(SimStep::Fail(WifiError::Busy));
        let result = supervisor
            .join("Stable", &Credential::default(), DEFAULT_JOIN_TIMEOUT)
            .await;
        assert_eq!(result, Err(JoinError::AssociationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_timeout_cancels_driver() {
        let (wifi, supervisor) = setup();
        wifi.push_association(SimStep::Hang);

        let started = Instant::now();
        let result = supervisor
            .join("Stable", &Credential::default(), Duration::from_secs(30))
            .await;

        assert_eq!(result, Err(JoinError::AssociationTimeout));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(wifi.calls().cancels, 1);
        assert_eq!(wifi.calls().leases, 0);
        assert!(!supervisor.is_joining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_timeout_shares_deadline() {
        let (wifi, supervisor) = setup();
        wifi.push_lease(SimStep::Hang);

        let started = Instant::now();
        let result = supervisor
            .join("Stable", &Credential::default(), Duration::from_secs(10))
            .await;

        assert_eq!(result, Err(JoinError::LeaseTimeout));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(wifi.calls().cancels, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_lock() {
        let (wifi, supervisor) = setup();
        wifi.push_association(SimStep::Hang);

        let joining = supervisor.clone();
        let handle = tokio::spawn(async move {
            joining
                .join("Stable", &Credential::default(), Duration::from_secs(30))
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(supervisor.is_joining());

        // A second join while the first holds the interface
        let second = supervisor
            .join("Stable", &Credential::default(), Duration::from_secs(30))
            .await;
        assert_eq!(second, Err(JoinError::Busy));

        supervisor.cancel_all();
        assert_eq!(handle.await.unwrap(), Err(JoinError::Cancelled));
        assert_eq!(wifi.calls().cancels, 1);
        assert!(!supervisor.is_joining());

        // Fresh token: the next join goes through
        let lease = supervisor
            .join("Stable", &Credential::default(), Duration::from_secs(30))
            .await;
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn test_token_cancelled_before_join_starts() {
        let (wifi, supervisor) = setup();
        wifi.push_association(SimStep::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = supervisor
            .join_observed(
                "Stable",
                &Credential::default(),
                DEFAULT_JOIN_TIMEOUT,
                &cancel,
                |_| {},
            )
            .await;

        assert_eq!(result, Err(JoinError::Cancelled));
        assert_eq!(wifi.calls().cancels, 1);
        assert!(!supervisor.is_joining());
    }
}
