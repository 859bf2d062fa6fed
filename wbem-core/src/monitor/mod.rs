//! Background pollers over services and processes.
//!
//! Each monitor runs on its own thread with its own [`Connection`]: the
//! thread initialises its context before the first native call and tears it
//! down (by dropping the connection) before it exits.  Proxies never leave
//! that thread.  Results travel to the consumer as [`MonitorEvent`]s over an
//! mpsc channel; requests travel back as [`MonitorCommand`]s.
//!
//! Per-iteration failures are logged, reported as
//! [`MonitorEvent::PollFailed`] and polling continues.  Failing to open the
//! connection is fatal: the monitor reports [`MonitorEvent::Failed`] and
//! exits.

pub mod process;
pub mod service;
pub mod table;

use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::connection::{Connection, ConnectionHandle};
use crate::errors::WbemError;
use crate::provider::Provider;
use crate::service::ServiceState;

pub use process::{ProcessMonitor, WatchedProcess};
pub use service::ServiceMonitor;
pub use table::{Reconciled, WatchTable};

/// Notification queued from a monitor thread to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A process matching a watch pattern appeared.
    ProcessAppeared { pid: u32, name: String },
    /// A watched pid now reports a different name or executable path.
    ProcessChanged {
        pid: u32,
        name: String,
        executable_path: String,
    },
    ProcessVanished { pid: u32, name: String },
    /// First observation of a service, or a change of its state.
    ServiceState {
        name: String,
        label: Option<String>,
        state: ServiceState,
    },
    /// A watched service is not (or no longer) installed.
    ServiceMissing { name: String },
    CommandDone { command: String, return_code: i64 },
    CommandFailed { command: String, error: String },
    /// One iteration failed; polling continues.
    PollFailed { monitor: String, error: String },
    /// Setup failed; the monitor has exited.
    Failed { monitor: String, error: String },
    Stopped { monitor: String },
}

/// Request processed on a monitor's own thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    Terminate(u32),
    AttachDebugger(u32),
    Toggle(String),
    /// Wake the thread so it notices a stop request.
    Wake,
}

impl std::fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorCommand::Terminate(pid) => write!(f, "kill {pid}"),
            MonitorCommand::AttachDebugger(pid) => write!(f, "debug {pid}"),
            MonitorCommand::Toggle(name) => write!(f, "toggle {name}"),
            MonitorCommand::Wake => f.write_str("wake"),
        }
    }
}

impl std::str::FromStr for MonitorCommand {
    type Err = WbemError;

    /// Parse the text form produced by `Display`, e.g. `kill 1312`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WbemError::Config(format!("unrecognised command: {s:?}"));
        let (verb, arg) = match s.trim().split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (s.trim(), ""),
        };
        let pid = || arg.parse::<u32>().map_err(|_| bad());
        match verb.to_ascii_lowercase().as_str() {
            "kill" | "terminate" => Ok(MonitorCommand::Terminate(pid()?)),
            "debug" => Ok(MonitorCommand::AttachDebugger(pid()?)),
            "toggle" if !arg.is_empty() => Ok(MonitorCommand::Toggle(arg.to_owned())),
            "wake" if arg.is_empty() => Ok(MonitorCommand::Wake),
            _ => Err(bad()),
        }
    }
}

/// Cooperative stop flag shared between a monitor and its handle.
pub trait StopFlag: Send + Sync {
    fn request_stop(&self);
    fn is_stopped(&self) -> bool;
}

impl<K, V> StopFlag for WatchTable<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + PartialEq + Send,
{
    fn request_stop(&self) {
        WatchTable::request_stop(self)
    }

    fn is_stopped(&self) -> bool {
        WatchTable::is_stopped(self)
    }
}

/// One monitor's polling logic, living on the monitor thread.
pub(crate) trait Poller {
    fn name(&self) -> &'static str;

    /// One iteration.
    fn poll(&mut self, conn: &ConnectionHandle) -> Result<Vec<MonitorEvent>, WbemError>;

    fn command(&mut self, conn: &ConnectionHandle, command: MonitorCommand) -> MonitorEvent;
}

/// Owner-side handle of a running monitor.  Dropping it stops and joins the
/// thread.
pub struct MonitorHandle {
    name: &'static str,
    commands: Sender<MonitorCommand>,
    stop: Arc<dyn StopFlag>,
    heartbeat: Arc<Mutex<Instant>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a command; `false` once the monitor has exited.
    pub fn send(&self, command: MonitorCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Time since the monitor thread last started an iteration.
    pub fn since_heartbeat(&self) -> Duration {
        self.heartbeat.lock().elapsed()
    }

    /// `true` when no iteration started within `threshold`, typically a
    /// native call that never returned.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        !self.is_finished() && self.since_heartbeat() > threshold
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request a stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.request_stop();
        let _ = self.commands.send(MonitorCommand::Wake);
    }

    /// Stop and join.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} monitor thread panicked", self.name);
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a monitor thread.  `make_poller` runs on the new thread, so the
/// poller may hold apartment-bound state.
pub(crate) fn spawn_monitor<P, F, W>(
    name: &'static str,
    provider: P,
    config: MonitorConfig,
    stop: Arc<dyn StopFlag>,
    events: Sender<MonitorEvent>,
    make_poller: F,
) -> Result<MonitorHandle, WbemError>
where
    P: Provider + 'static,
    F: FnOnce() -> W + Send + 'static,
    W: Poller,
{
    config.validate()?;
    let (command_tx, command_rx) = mpsc::channel();
    let heartbeat = Arc::new(Mutex::new(Instant::now()));
    let worker = Worker {
        name,
        config,
        stop: Arc::clone(&stop),
        events,
        commands: command_rx,
        heartbeat: Arc::clone(&heartbeat),
    };
    let thread = std::thread::Builder::new()
        .name(format!("wbem-{name}-monitor"))
        .spawn(move || worker.run(&provider, make_poller()))
        .map_err(|e| WbemError::Config(format!("cannot spawn {name} monitor: {e}")))?;
    Ok(MonitorHandle {
        name,
        commands: command_tx,
        stop,
        heartbeat,
        thread: Some(thread),
    })
}

struct Worker {
    name: &'static str,
    config: MonitorConfig,
    stop: Arc<dyn StopFlag>,
    events: Sender<MonitorEvent>,
    commands: Receiver<MonitorCommand>,
    heartbeat: Arc<Mutex<Instant>>,
}

impl Worker {
    fn run<P: Provider, W: Poller>(self, provider: &P, mut poller: W) {
        let conn = match Connection::open(provider, &self.config.binding) {
            Ok(conn) => Rc::new(conn),
            Err(e) => {
                error!("{} monitor setup failed: {e}", self.name);
                let _ = self.events.send(MonitorEvent::Failed {
                    monitor: self.name.to_owned(),
                    error: e.to_string(),
                });
                return;
            }
        };
        debug!("{} monitor started ({})", self.name, poller.name());

        let interval = self.config.poll_interval();
        let mut next_poll = Instant::now();
        while !self.stop.is_stopped() {
            *self.heartbeat.lock() = Instant::now();

            if Instant::now() >= next_poll {
                let events = match retry_transient(self.config.transient_retries, || {
                    poller.poll(&conn)
                }) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("{} poll failed: {e}", self.name);
                        vec![MonitorEvent::PollFailed {
                            monitor: self.name.to_owned(),
                            error: e.to_string(),
                        }]
                    }
                };
                if !self.emit(events) {
                    break;
                }
                next_poll = Instant::now() + interval;
            }

            let wait = next_poll.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(wait) {
                Ok(MonitorCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(command) => {
                    let event = poller.command(&conn, command);
                    if !self.emit(vec![event]) {
                        break;
                    }
                }
                // Handle dropped without stopping; nothing can command us
                // any more, keep polling until the stop flag is set.
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
            }
        }

        drop(conn);
        debug!("{} monitor stopped", self.name);
        let _ = self.events.send(MonitorEvent::Stopped {
            monitor: self.name.to_owned(),
        });
    }

    /// `false` once the consumer is gone.
    fn emit(&self, events: Vec<MonitorEvent>) -> bool {
        events.into_iter().all(|event| self.events.send(event).is_ok())
    }
}

/// Run `op`, retrying up to `retries` more times while it fails with a
/// transient status.
pub fn retry_transient<T>(
    retries: u32,
    mut op: impl FnMut() -> Result<T, WbemError>,
) -> Result<T, WbemError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                debug!("transient failure, retry {attempt}/{retries}: {e}");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{NativeStatus, WBEM_E_ACCESS_DENIED, WBEM_E_SERVER_TOO_BUSY};

    #[test]
    fn test_retry_transient_gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), WbemError> = retry_transient(2, || {
            calls += 1;
            Err(WbemError::native("Next", NativeStatus::new(WBEM_E_SERVER_TOO_BUSY)))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_transient_does_not_retry_permanent() {
        let mut calls = 0;
        let result: Result<(), WbemError> = retry_transient(5, || {
            calls += 1;
            Err(WbemError::native("ExecMethod", NativeStatus::new(WBEM_E_ACCESS_DENIED)))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_transient_recovers() {
        let mut calls = 0;
        let result = retry_transient(1, || {
            calls += 1;
            if calls == 1 {
                Err(WbemError::native("Next", NativeStatus::new(WBEM_E_SERVER_TOO_BUSY)))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_command_text_round_trips() {
        for command in [
            MonitorCommand::Terminate(1312),
            MonitorCommand::AttachDebugger(7),
            MonitorCommand::Toggle("postgresql-x64-16".into()),
            MonitorCommand::Wake,
        ] {
            assert_eq!(command.to_string().parse::<MonitorCommand>().unwrap(), command);
        }
        assert!("kill".parse::<MonitorCommand>().is_err());
        assert!("kill -1".parse::<MonitorCommand>().is_err());
        assert!("toggle".parse::<MonitorCommand>().is_err());
        assert!("reboot now".parse::<MonitorCommand>().is_err());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MonitorEvent::ProcessAppeared {
            pid: 42,
            name: "qt_chooser.exe".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "process_appeared");
        assert_eq!(json["pid"], 42);
    }
}
