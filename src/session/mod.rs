//! Provisioning session: the only place session state changes.
//!
//! [`ProvisioningSession::spawn`] starts a dispatcher task and returns a
//! [`SessionHandle`]. Everything that can move the state machine reaches the
//! dispatcher as a message:
//!
//! - commands from the handle (start, join, leave, rescan)
//! - phase progress and results from the join task
//! - link events from the WiFi driver
//! - connectivity changes
//!
//! ```text
//! Idle ──start──▶ Scanning ◀──────────── leave / link down ───┐
//!   │                │                                        │
//!   └──── join ──────┴──▶ Joining ──▶ AwaitingLease ──▶ Connected
//!                            │              │
//!                            └──▶ Failed ◀──┘
//!                                   │
//!                                   └──▶ Scanning
//! ```
//!
//! Join attempts run on their own task and report back tagged with a
//! generation number; events from an older generation are dropped.

mod status;

pub use status::{FailureReason, SessionState, SessionStatus, StatusUpdate};

use crate::connectivity::Connectivity;
use crate::scanner::NetworkScanner;
use crate::supervisor::{ConnectionSupervisor, JoinError, JoinPhase, DEFAULT_JOIN_TIMEOUT};
use crate::wifi::{JoinRequest, LeaseInfo, LinkEvent, WifiInterface};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Scanner period while in Scanning.
    pub scan_interval: Duration,
    /// Overall deadline for one join attempt.
    pub join_timeout: Duration,
    /// Automatic retries after an association timeout.
    pub association_retries: u32,
    /// How long shutdown waits for a cancelled join to wind down.
    pub shutdown_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            association_retries: 1,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("a join is in progress")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("session is shutting down")]
    ShuttingDown,
}

type Reply = oneshot::Sender<Result<(), CommandError>>;

enum Command {
    Start(Reply),
    Join(JoinRequest, Reply),
    Leave(Reply),
    Rescan(Reply),
}

enum JoinProgress {
    Phase(JoinPhase),
    Finished(Result<LeaseInfo, JoinError>),
}

struct JoinEvent {
    generation: u64,
    progress: JoinProgress,
}

/// Session components, ready to be spawned.
pub struct ProvisioningSession {
    wifi: Arc<dyn WifiInterface>,
    scanner: Arc<NetworkScanner>,
    supervisor: Arc<ConnectionSupervisor>,
    connectivity: Option<watch::Receiver<Connectivity>>,
    settings: SessionSettings,
}

impl ProvisioningSession {
    pub fn new(
        wifi: Arc<dyn WifiInterface>,
        scanner: Arc<NetworkScanner>,
        supervisor: Arc<ConnectionSupervisor>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            wifi,
            scanner,
            supervisor,
            connectivity: None,
            settings,
        }
    }

    /// Pause scanning while online and resume when offline.
    pub fn with_connectivity(mut self, connectivity: watch::Receiver<Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Start the dispatcher. The session begins in Idle.
    pub fn spawn(self) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let links = self.wifi.link_events();
        let dispatcher = Dispatcher {
            wifi: self.wifi,
            scanner: self.scanner,
            supervisor: self.supervisor,
            settings: self.settings,
            status: SessionStatus::default(),
            status_tx,
            updates_tx: updates_tx.clone(),
            seq: 0,
            generation: 0,
            join_tx,
            join_task: None,
            join_cancel: None,
        };

        let task = tokio::spawn(dispatcher.run(
            commands_rx,
            join_rx,
            links,
            self.connectivity,
            cancel.clone(),
        ));

        SessionHandle {
            commands: commands_tx,
            status_rx,
            updates_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Client side of a running session.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    updates_tx: broadcast::Sender<StatusUpdate>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Idle -> Scanning. A no-op in any other state.
    pub async fn start(&self) -> Result<(), CommandError> {
        self.request(Command::Start).await
    }

    /// Hand a join request to the session.
    ///
    /// Returns once the session has moved to Joining; the outcome is
    /// reported through status updates.
    pub async fn submit_join(&self, request: JoinRequest) -> Result<(), CommandError> {
        self.request(|reply| Command::Join(request, reply)).await
    }

    /// Leave the connected network.
    pub async fn leave(&self) -> Result<(), CommandError> {
        self.request(Command::Leave).await
    }

    /// Run a scan cycle now.
    pub async fn rescan(&self) -> Result<(), CommandError> {
        self.request(Command::Rescan).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch the latest status. Intermediate values may be skipped.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Receive every state transition.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates_tx.subscribe()
    }

    /// Stop the scanner, cancel any join and stop the dispatcher.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| CommandError::ShuttingDown)?;
        reply_rx.await.map_err(|_| CommandError::ShuttingDown)?
    }
}

struct Dispatcher {
    wifi: Arc<dyn WifiInterface>,
    scanner: Arc<NetworkScanner>,
    supervisor: Arc<ConnectionSupervisor>,
    settings: SessionSettings,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    updates_tx: broadcast::Sender<StatusUpdate>,
    seq: u64,
    generation: u64,
    join_tx: mpsc::UnboundedSender<JoinEvent>,
    join_task: Option<JoinHandle<()>>,
    join_cancel: Option<CancellationToken>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut join_events: mpsc::UnboundedReceiver<JoinEvent>,
        mut links: broadcast::Receiver<LinkEvent>,
        mut connectivity: Option<watch::Receiver<Connectivity>>,
        cancel: CancellationToken,
    ) {
        if let Some(rx) = connectivity.as_mut() {
            let current = *rx.borrow_and_update();
            self.apply_connectivity(current);
        }
        let mut links_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Session dispatcher shutting down");
                    break;
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(event) = join_events.recv() => self.handle_join_event(event),

                link = links.recv(), if links_open => match link {
                    Ok(event) => self.handle_link_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} link events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => links_open = false,
                },

                changed = next_connectivity(&mut connectivity), if connectivity.is_some() => {
                    match changed {
                        Some(state) => self.apply_connectivity(state),
                        None => connectivity = None,
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                if self.status.state == SessionState::Idle {
                    self.enter_scanning();
                }
                let _ = reply.send(Ok(()));
            }
            Command::Join(request, reply) => {
                let result = self.begin_join(request);
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                let result = self.leave().await;
                let _ = reply.send(result);
            }
            Command::Rescan(reply) => {
                let result = if self.status.state.is_joining() {
                    Err(CommandError::Busy)
                } else {
                    let scanner = Arc::clone(&self.scanner);
                    tokio::spawn(async move {
                        scanner.scan_once().await;
                    });
                    Ok(())
                };
                let _ = reply.send(result);
            }
        }
    }

    fn begin_join(&mut self, request: JoinRequest) -> Result<(), CommandError> {
        if !self.status.state.accepts_join() {
            warn!(
                "Rejecting join for {}: session is {}",
                request.ssid, self.status.state
            );
            return Err(CommandError::Busy);
        }

        self.generation += 1;
        let generation = self.generation;
        self.status.ssid = Some(request.ssid.clone());
        self.status.lease = None;
        self.transition(SessionState::Joining, None);

        let supervisor = Arc::clone(&self.supervisor);
        let events = self.join_tx.clone();
        let timeout = self.settings.join_timeout;
        let retries = self.settings.association_retries;
        // Held here so shutdown reaches the join even before its task first runs
        let cancel = CancellationToken::new();
        self.join_cancel = Some(cancel.clone());

        self.join_task = Some(tokio::spawn(async move {
            let mut attempt = 0;
            let result = loop {
                let phase_events = events.clone();
                let result = supervisor
                    .join_observed(
                        &request.ssid,
                        &request.credential,
                        timeout,
                        &cancel,
                        move |phase| {
                            let _ = phase_events.send(JoinEvent {
                                generation,
                                progress: JoinProgress::Phase(phase),
                            });
                        },
                    )
                    .await;

                match result {
                    Err(JoinError::AssociationTimeout) if attempt < retries => {
                        attempt += 1;
                        info!(
                            "Association with {} timed out, retrying ({}/{})",
                            request.ssid, attempt, retries
                        );
                    }
                    result => break result,
                }
            };
            let _ = events.send(JoinEvent {
                generation,
                progress: JoinProgress::Finished(result),
            });
        }));

        Ok(())
    }

    fn handle_join_event(&mut self, event: JoinEvent) {
        if event.generation != self.generation || !self.status.state.is_joining() {
            debug!("Dropping stale join event (generation {})", event.generation);
            return;
        }

        match event.progress {
            // Retries re-enter Associating while already Joining
            JoinProgress::Phase(JoinPhase::Associating) => {}
            JoinProgress::Phase(JoinPhase::AwaitingLease) => {
                if self.status.state == SessionState::Joining {
                    self.transition(SessionState::AwaitingLease, None);
                }
            }
            JoinProgress::Finished(Ok(lease)) => {
                self.join_task = None;
                self.join_cancel = None;
                info!(
                    "Connected to {} as {}",
                    self.status.ssid.as_deref().unwrap_or_default(),
                    lease.ip_address
                );
                self.status.lease = Some(lease);
                self.status.last_error = None;
                self.transition(SessionState::Connected, None);
            }
            JoinProgress::Finished(Err(e)) => {
                self.join_task = None;
                self.join_cancel = None;
                warn!(
                    "Join of {} failed: {}",
                    self.status.ssid.as_deref().unwrap_or_default(),
                    e
                );
                let reason = FailureReason::from(&e);
                self.status.last_error = Some(reason);
                self.transition(SessionState::Failed, Some(reason));
                self.enter_scanning();
            }
        }
    }

    async fn leave(&mut self) -> Result<(), CommandError> {
        match self.status.state {
            SessionState::Connected => {
                if let Err(e) = self.wifi.leave().await {
                    warn!("Driver failed to leave cleanly: {}", e);
                }
                self.status.ssid = None;
                self.status.lease = None;
                self.enter_scanning();
                Ok(())
            }
            state if state.is_joining() => Err(CommandError::Busy),
            _ => Err(CommandError::NotConnected),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Down if self.status.state == SessionState::Connected => {
                warn!(
                    "Link to {} lost",
                    self.status.ssid.as_deref().unwrap_or_default()
                );
                self.status.ssid = None;
                self.status.lease = None;
                self.enter_scanning();
            }
            _ => debug!("Link {:?} in {}", event, self.status.state),
        }
    }

    fn apply_connectivity(&mut self, connectivity: Connectivity) {
        let online = connectivity.is_online();
        if online {
            self.scanner.pause();
        } else {
            self.scanner.resume();
        }
        if self.status.online != online {
            self.status.online = online;
            self.status_tx.send_replace(self.status.clone());
        }
    }

    fn enter_scanning(&mut self) {
        if !self.scanner.is_running() {
            self.scanner.start(self.settings.scan_interval);
        }
        self.transition(SessionState::Scanning, None);
    }

    fn transition(&mut self, to: SessionState, reason: Option<FailureReason>) {
        let from = self.status.state;
        self.status.state = to;
        self.seq += 1;

        match reason {
            Some(reason) => info!("Session {} -> {} ({:?})", from, to, reason),
            None => info!("Session {} -> {}", from, to),
        }

        self.status_tx.send_replace(self.status.clone());
        let _ = self.updates_tx.send(StatusUpdate {
            seq: self.seq,
            from,
            to,
            reason,
        });
    }

    async fn shutdown(&mut self) {
        self.scanner.stop().await;

        if let Some(task) = self.join_task.take() {
            info!("Cancelling in-flight join");
            if let Some(cancel) = self.join_cancel.take() {
                cancel.cancel();
            }
            self.supervisor.cancel_all();
            let abort = task.abort_handle();
            match tokio::time::timeout(self.settings.shutdown_grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Join task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Join did not stop within {:?}, aborting it",
                        self.settings.shutdown_grace
                    );
                    abort.abort();
                }
            }
        }
    }
}

async fn next_connectivity(rx: &mut Option<watch::Receiver<Connectivity>>) -> Option<Connectivity> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
