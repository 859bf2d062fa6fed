//! Process watcher: tracks live processes whose name matches a pattern and
//! forwards terminate/debug requests for them.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{debug, info};
use regex::Regex;
use serde::Serialize;

use super::{spawn_monitor, MonitorCommand, MonitorEvent, MonitorHandle, Poller, WatchTable};
use crate::config::MonitorConfig;
use crate::connection::ConnectionHandle;
use crate::errors::WbemError;
use crate::process::ProcessProxy;
use crate::provider::Provider;

/// Exit code handed to `Terminate`.
const TERMINATE_REASON: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: String,
}

pub type ProcessTable = WatchTable<u32, WatchedProcess>;

pub struct ProcessMonitor {
    handle: MonitorHandle,
    table: Arc<ProcessTable>,
}

impl ProcessMonitor {
    pub const NAME: &'static str = "process";

    /// Start polling on a new thread.  Events are delivered to `events`.
    pub fn spawn<P: Provider + 'static>(
        provider: P,
        config: MonitorConfig,
        events: Sender<MonitorEvent>,
    ) -> Result<Self, WbemError> {
        let patterns = config.process_patterns()?;
        let table = Arc::new(ProcessTable::new());
        let shared = Arc::clone(&table);
        let handle = spawn_monitor(
            Self::NAME,
            provider,
            config,
            Arc::clone(&table) as Arc<dyn super::StopFlag>,
            events,
            move || ProcessPoller {
                patterns,
                table: shared,
            },
        )?;
        Ok(Self { handle, table })
    }

    /// Processes currently watched.
    pub fn watched(&self) -> Vec<WatchedProcess> {
        self.table.snapshot().into_values().collect()
    }

    pub fn is_watched(&self, pid: u32) -> bool {
        self.table.contains(&pid)
    }

    pub fn terminate(&self, pid: u32) -> bool {
        self.handle.send(MonitorCommand::Terminate(pid))
    }

    pub fn attach_debugger(&self, pid: u32) -> bool {
        self.handle.send(MonitorCommand::AttachDebugger(pid))
    }

    pub fn handle(&self) -> &MonitorHandle {
        &self.handle
    }

    pub fn stop(self) {
        self.handle.stop();
    }
}

struct ProcessPoller {
    patterns: Vec<Regex>,
    table: Arc<ProcessTable>,
}

impl ProcessPoller {
    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }

    fn live(&self, conn: &ConnectionHandle) -> Result<BTreeMap<u32, WatchedProcess>, WbemError> {
        let mut live = BTreeMap::new();
        for process in ProcessProxy::all(conn)? {
            let name = process.name()?;
            if !self.matches(&name) || process.is_terminated()? {
                continue;
            }
            let Some(pid) = process.process_id()? else {
                continue;
            };
            let executable_path = process.executable_path()?;
            live.insert(
                pid,
                WatchedProcess {
                    pid,
                    name,
                    executable_path,
                },
            );
        }
        Ok(live)
    }

    fn run_command(
        &self,
        conn: &ConnectionHandle,
        command: &MonitorCommand,
    ) -> Result<i64, WbemError> {
        let pid = match command {
            MonitorCommand::Terminate(pid) | MonitorCommand::AttachDebugger(pid) => *pid,
            other => {
                return Err(WbemError::InvalidTransition(format!(
                    "{other} is not a process command"
                )))
            }
        };
        if !self.table.contains(&pid) {
            return Err(WbemError::InvalidTransition(format!(
                "process {pid} is not watched"
            )));
        }
        let process = ProcessProxy::by_id(conn, pid)?
            .ok_or_else(|| WbemError::ObjectGone(format!("process {pid}")))?;
        match command {
            MonitorCommand::AttachDebugger(_) => process.attach_debugger(),
            _ => process.terminate(TERMINATE_REASON),
        }
    }
}

impl Poller for ProcessPoller {
    fn name(&self) -> &'static str {
        ProcessMonitor::NAME
    }

    fn poll(&mut self, conn: &ConnectionHandle) -> Result<Vec<MonitorEvent>, WbemError> {
        let diff = self.table.reconcile(self.live(conn)?);
        let mut events = Vec::new();
        for (pid, process) in diff.appeared {
            info!("watching {} ({pid})", process.name);
            events.push(MonitorEvent::ProcessAppeared {
                pid,
                name: process.name,
            });
        }
        for (pid, process) in diff.changed {
            debug!("{pid} is now {}", process.name);
            events.push(MonitorEvent::ProcessChanged {
                pid,
                name: process.name,
                executable_path: process.executable_path,
            });
        }
        for (pid, process) in diff.vanished {
            info!("{} ({pid}) is gone", process.name);
            events.push(MonitorEvent::ProcessVanished {
                pid,
                name: process.name,
            });
        }
        Ok(events)
    }

    fn command(&mut self, conn: &ConnectionHandle, command: MonitorCommand) -> MonitorEvent {
        debug!("process command: {command}");
        match self.run_command(conn, &command) {
            Ok(return_code) => MonitorEvent::CommandDone {
                command: command.to_string(),
                return_code,
            },
            Err(e) => MonitorEvent::CommandFailed {
                command: command.to_string(),
                error: e.to_string(),
            },
        }
    }
}
