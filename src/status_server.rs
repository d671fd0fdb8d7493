//! HTTP status endpoint.
//!
//! Serves `GET /status` with the same JSON a BLE client reads, plus process
//! counters. Runs `tiny_http` on a plain thread so it never competes with the
//! async runtime.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "state": "Connected",
//!   "ssid": "Stable",
//!   "ip": "192.168.1.5",
//!   "online": true,
//!   "networks": [ ... ],
//!   "stats": {
//!     "uptime_secs": 3600,
//!     "scan": { "cycles": 360, "errors": 0, "appeared": 4, "vanished": 1 },
//!     "join": { "attempts": 1, "successes": 1, "failures": 0 },
//!     "gatt": { "reads": 12, "writes": 1, "rejections": 0, "notifications": 5 }
//!   }
//! }
//! ```

use crate::gatt::{ReadPayload, StatusView};
use crate::stats::{ProvisionerStats, StatsSnapshot};
use log::{error, info, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

/// How often the server thread checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    payload: ReadPayload,
    stats: StatsSnapshot,
}

/// What to answer for a request.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Json(String),
    Redirect,
    MethodNotAllowed,
    NotFound,
    Error,
}

fn route(method: &Method, path: &str, view: &StatusView, stats: &ProvisionerStats) -> Reply {
    if method != &Method::Get {
        return Reply::MethodNotAllowed;
    }
    match path {
        "/status" | "/status/" => {
            let response = StatusResponse {
                payload: view.read_payload(),
                stats: stats.snapshot(),
            };
            match serde_json::to_string(&response) {
                Ok(json) => Reply::Json(json),
                Err(e) => {
                    error!("Failed to render status: {}", e);
                    Reply::Error
                }
            }
        }
        "/" => Reply::Redirect,
        _ => Reply::NotFound,
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

/// Background HTTP server. Drop it to stop.
pub struct StatusServer {
    addr: Option<SocketAddr>,
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatusServer {
    /// Bind and start serving.
    ///
    /// Binds `0.0.0.0` when `bind_addr` is `None`; port 0 picks a free port.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        view: StatusView,
        stats: Arc<ProvisionerStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
        let local = server.server_addr().to_ip();
        info!("Status server listening on http://{}/status", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::run_server(server, view, stats, thread_shutdown);
        });

        Ok(Self {
            addr: local,
            handle: Some(handle),
            shutdown,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn run_server(
        server: Server,
        view: StatusView,
        stats: Arc<ProvisionerStats>,
        shutdown: Arc<AtomicBool>,
    ) {
        let content_type = header("Content-Type", "application/json");
        let location = header("Location", "/status");
        let allow_get = header("Allow", "GET");

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Status server shutting down");
                break;
            }

            let request = match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!("Status server error: {}", e);
                    break;
                }
            };

            let reply = route(request.method(), request.url(), &view, &stats);
            let result = match reply {
                Reply::Json(json) => {
                    let mut response = Response::from_string(json).with_status_code(200);
                    if let Some(h) = content_type.clone() {
                        response.add_header(h);
                    }
                    request.respond(response)
                }
                Reply::Redirect => {
                    let mut response =
                        Response::from_string("See /status").with_status_code(302);
                    if let Some(h) = location.clone() {
                        response.add_header(h);
                    }
                    request.respond(response)
                }
                Reply::MethodNotAllowed => {
                    let mut response =
                        Response::from_string("Method Not Allowed").with_status_code(405);
                    if let Some(h) = allow_get.clone() {
                        response.add_header(h);
                    }
                    request.respond(response)
                }
                Reply::NotFound => {
                    request.respond(Response::from_string("Not Found").with_status_code(404))
                }
                Reply::Error => request.respond(
                    Response::from_string("Internal Server Error").with_status_code(500),
                ),
            };

            if let Err(e) = result {
                warn!("Failed to send response: {}", e);
            }
        }
    }

    /// Stop the server. May take up to one poll interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanSnapshot;
    use crate::session::SessionStatus;
    use std::io::{Read, Write};
    use tokio::sync::watch;

    fn view() -> (
        watch::Sender<SessionStatus>,
        watch::Sender<Arc<ScanSnapshot>>,
        StatusView,
    ) {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(ScanSnapshot::default()));
        (status_tx, snapshot_tx, StatusView::new(status_rx, snapshot_rx))
    }

    #[test]
    fn test_route() {
        let (_status, _snapshots, view) = view();
        let stats = ProvisionerStats::new();
        stats.join.record_attempt();

        match route(&Method::Get, "/status", &view, &stats) {
            Reply::Json(json) => {
                assert!(json.contains(r#""state":"Idle""#));
                assert!(json.contains(r#""networks":[]"#));
                assert!(json.contains(r#""attempts":1"#));
            }
            other => panic!("expected JSON, got {:?}", other),
        }
        assert_eq!(route(&Method::Get, "/", &view, &stats), Reply::Redirect);
        assert_eq!(route(&Method::Post, "/status", &view, &stats), Reply::MethodNotAllowed);
        assert_eq!(route(&Method::Get, "/stats", &view, &stats), Reply::NotFound);
    }

    #[test]
    fn test_serves_over_http() {
        let (_status, _snapshots, view) = view();
        let stats = Arc::new(ProvisionerStats::new());
        let mut server =
            StatusServer::start(Some([127, 0, 0, 1].into()), 0, view, stats).unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("application/json"));
        assert!(response.contains(r#""uptime_secs":"#));
        server.stop();
    }
}
