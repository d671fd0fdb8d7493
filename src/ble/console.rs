//! Line-oriented stand-in for a BLE stack.
//!
//! Reads commands from stdin and turns them into [`GattEvent`]s; advertising
//! and notifications are printed to stdout. Lets the whole provisioner run on
//! a machine without a Bluetooth adapter.
//!
//! # Commands
//!
//! - `read [offset]` - Read the characteristic
//! - `write <json>` - Write the characteristic
//! - `subscribe` / `unsubscribe` - Toggle notifications
//! - `connect <addr>` / `disconnect` - Simulate a central
//! - `power on|off` - Simulate adapter power changes
//! - `help` - Show available commands
//!
//! # Example Session
//!
//! ```text
//! > read
//! {"state":"Scanning","online":false,"networks":[...]}
//! > write {"ssid":"Stable","pwd":""}
//! ok
//! [notify] {"state":"Joining","ssid":"Stable"}
//! ```

use super::{BleError, BlePeripheral, GattEvent};
use async_trait::async_trait;
use log::{debug, info};
use std::io::{self, BufRead, Write};
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Address reported for console clients that did not name one.
const CONSOLE_CLIENT: &str = "console";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Read { offset: usize },
    Write(String),
    Subscribe,
    Unsubscribe,
    Connect(String),
    Disconnect,
    Power(bool),
    Help,
    /// Unknown or invalid command, with a message for the user.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return ConsoleCommand::Unknown(String::new());
        }

        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match cmd.to_lowercase().as_str() {
            "read" | "r" => {
                if args.is_empty() {
                    return ConsoleCommand::Read { offset: 0 };
                }
                match args.parse() {
                    Ok(offset) => ConsoleCommand::Read { offset },
                    Err(_) => ConsoleCommand::Unknown("Usage: read [offset]".to_string()),
                }
            }
            "write" | "w" => {
                if args.is_empty() {
                    ConsoleCommand::Unknown("Usage: write <json>".to_string())
                } else {
                    ConsoleCommand::Write(args.to_string())
                }
            }
            "subscribe" | "sub" => ConsoleCommand::Subscribe,
            "unsubscribe" | "unsub" => ConsoleCommand::Unsubscribe,
            "connect" => {
                let addr = if args.is_empty() { CONSOLE_CLIENT } else { args };
                ConsoleCommand::Connect(addr.to_string())
            }
            "disconnect" => ConsoleCommand::Disconnect,
            "power" => match args.to_lowercase().as_str() {
                "on" => ConsoleCommand::Power(true),
                "off" => ConsoleCommand::Power(false),
                _ => ConsoleCommand::Unknown("Usage: power on|off".to_string()),
            },
            "help" | "h" | "?" => ConsoleCommand::Help,
            _ => ConsoleCommand::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }
}

fn print_console(msg: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", msg);
    let _ = stdout.flush();
}

fn print_help() {
    print_console("Commands:");
    print_console("  read [offset]      Read the characteristic");
    print_console("  write <json>       Write the characteristic");
    print_console("  subscribe          Enable notifications");
    print_console("  unsubscribe        Disable notifications");
    print_console("  connect [addr]     Connect a client");
    print_console("  disconnect         Disconnect the client");
    print_console("  power on|off       Toggle adapter power");
}

/// Console-backed peripheral.
#[derive(Debug, Default)]
pub struct ConsolePeripheral;

impl ConsolePeripheral {
    pub fn new() -> Self {
        Self
    }

    /// Read stdin on a detached thread and forward events until EOF or
    /// cancellation.
    ///
    /// The thread is never joined: a read parked on stdin must not hold up
    /// runtime shutdown.
    pub fn spawn_reader(
        &self,
        events: mpsc::Sender<GattEvent>,
        cancel: CancellationToken,
    ) -> io::Result<thread::JoinHandle<()>> {
        let stdin = io::BufReader::new(io::stdin());
        spawn_line_reader(Handle::current(), stdin, events, cancel)
    }
}

fn spawn_line_reader<R>(
    runtime: Handle,
    source: R,
    events: mpsc::Sender<GattEvent>,
    cancel: CancellationToken,
) -> io::Result<thread::JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("console-reader".into())
        .spawn(move || {
            let mut lines = source.lines();
            let mut client: Option<String> = None;

            while !cancel.is_cancelled() {
                let line = match lines.next() {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        debug!("Console read failed: {}", e);
                        break;
                    }
                    None => break,
                };
                if cancel.is_cancelled() {
                    break;
                }

                let command = ConsoleCommand::parse(&line);
                let keep_going = runtime.block_on(dispatch(command, &events, &mut client));
                if !keep_going {
                    break;
                }
            }
            debug!("Console reader stopped");
        })
}

/// Forward one command. Returns `false` once the event channel is gone.
async fn dispatch(
    command: ConsoleCommand,
    events: &mpsc::Sender<GattEvent>,
    client: &mut Option<String>,
) -> bool {
    let event = match command {
        ConsoleCommand::Read { offset } => {
            let (respond, response) = oneshot::channel();
            if events.send(GattEvent::Read { offset, respond }).await.is_err() {
                return false;
            }
            match response.await {
                Ok(Ok(value)) => print_console(&String::from_utf8_lossy(&value)),
                Ok(Err(e)) => print_console(&format!("error: {} (ATT 0x{:02x})", e, e.att_code())),
                Err(_) => print_console("error: no response"),
            }
            return true;
        }
        ConsoleCommand::Write(json) => {
            let (respond, response) = oneshot::channel();
            let data = Zeroizing::new(json.into_bytes());
            if events
                .send(GattEvent::Write {
                    data,
                    offset: 0,
                    respond,
                })
                .await
                .is_err()
            {
                return false;
            }
            match response.await {
                Ok(Ok(())) => print_console("ok"),
                Ok(Err(e)) => print_console(&format!("error: {} (ATT 0x{:02x})", e, e.att_code())),
                Err(_) => print_console("error: no response"),
            }
            return true;
        }
        ConsoleCommand::Subscribe => GattEvent::Subscribe,
        ConsoleCommand::Unsubscribe => GattEvent::Unsubscribe,
        ConsoleCommand::Connect(addr) => {
            *client = Some(addr.clone());
            GattEvent::ClientConnected(addr)
        }
        ConsoleCommand::Disconnect => {
            let addr = client.take().unwrap_or_else(|| CONSOLE_CLIENT.to_string());
            GattEvent::ClientDisconnected(addr)
        }
        ConsoleCommand::Power(on) => GattEvent::AdapterPowered(on),
        ConsoleCommand::Help => {
            print_help();
            return true;
        }
        ConsoleCommand::Unknown(msg) => {
            if !msg.is_empty() {
                print_console(&msg);
            }
            return true;
        }
    };

    events.send(event).await.is_ok()
}

#[async_trait]
impl BlePeripheral for ConsolePeripheral {
    async fn start_advertising(&self, name: &str, service: Uuid) -> Result<(), BleError> {
        info!("Advertising {} (service {})", name, service);
        print_console(&format!("[advertising] {} {}", name, service));
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        info!("Advertising stopped");
        print_console("[advertising stopped]");
        Ok(())
    }

    async fn notify(&self, _characteristic: Uuid, value: &[u8]) -> Result<(), BleError> {
        print_console(&format!("[notify] {}", String::from_utf8_lossy(value)));
        Ok(())
    }
}
