//! Service watcher: follows the state of configured services and toggles
//! them on request.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{debug, info};

use super::{spawn_monitor, MonitorCommand, MonitorEvent, MonitorHandle, Poller, WatchTable};
use crate::config::{MonitorConfig, WatchedService};
use crate::connection::ConnectionHandle;
use crate::errors::WbemError;
use crate::provider::Provider;
use crate::service::{ServiceProxy, ServiceState};

pub type ServiceTable = WatchTable<String, ServiceState>;

pub struct ServiceMonitor {
    handle: MonitorHandle,
    table: Arc<ServiceTable>,
}

impl ServiceMonitor {
    pub const NAME: &'static str = "service";

    pub fn spawn<P: Provider + 'static>(
        provider: P,
        config: MonitorConfig,
        events: Sender<MonitorEvent>,
    ) -> Result<Self, WbemError> {
        let watched = config.services.clone();
        let table = Arc::new(ServiceTable::new());
        let shared = Arc::clone(&table);
        let handle = spawn_monitor(
            Self::NAME,
            provider,
            config,
            Arc::clone(&table) as Arc<dyn super::StopFlag>,
            events,
            move || ServicePoller {
                watched,
                table: shared,
                proxies: HashMap::new(),
                missing: BTreeSet::new(),
            },
        )?;
        Ok(Self { handle, table })
    }

    /// Last observed state of every installed watched service.
    pub fn states(&self) -> BTreeMap<String, ServiceState> {
        self.table.snapshot()
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.table.get(&name.to_owned())
    }

    pub fn toggle(&self, name: &str) -> bool {
        self.handle.send(MonitorCommand::Toggle(name.to_owned()))
    }

    pub fn handle(&self) -> &MonitorHandle {
        &self.handle
    }

    pub fn stop(self) {
        self.handle.stop();
    }
}

struct ServicePoller {
    watched: Vec<WatchedService>,
    table: Arc<ServiceTable>,
    /// Bound proxies, keyed by lowercase service name.
    proxies: HashMap<String, ServiceProxy>,
    missing: BTreeSet<String>,
}

impl ServicePoller {
    fn watched(&self, name: &str) -> Option<&WatchedService> {
        self.watched.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// State of one service, `None` when it is not installed.
    fn observe(
        &mut self,
        conn: &ConnectionHandle,
        name: &str,
    ) -> Result<Option<ServiceState>, WbemError> {
        let key = name.to_ascii_lowercase();
        if !self.proxies.contains_key(&key) {
            match ServiceProxy::find(conn, name)? {
                Some(service) => {
                    self.proxies.insert(key.clone(), service);
                }
                None => return Ok(None),
            }
        }
        let Some(service) = self.proxies.get_mut(&key) else {
            return Ok(None);
        };
        match service.state() {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_gone() => {
                debug!("{name}: bound instance is gone");
                self.proxies.remove(&key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn toggle(&mut self, conn: &ConnectionHandle, name: &str) -> Result<i64, WbemError> {
        let Some(configured) = self.watched(name).map(|s| s.name.clone()) else {
            return Err(WbemError::InvalidTransition(format!(
                "service {name} is not watched"
            )));
        };
        let gone = || WbemError::ObjectGone(format!("service {configured}"));
        if self.observe(conn, &configured)?.is_none() {
            return Err(gone());
        }
        let key = configured.to_ascii_lowercase();
        let service = self.proxies.get_mut(&key).ok_or_else(gone)?;
        service.toggle()
    }
}

impl Poller for ServicePoller {
    fn name(&self) -> &'static str {
        ServiceMonitor::NAME
    }

    fn poll(&mut self, conn: &ConnectionHandle) -> Result<Vec<MonitorEvent>, WbemError> {
        let mut live = BTreeMap::new();
        let mut missing = BTreeSet::new();
        let names: Vec<String> = self.watched.iter().map(|s| s.name.clone()).collect();
        for name in names {
            match self.observe(conn, &name)? {
                Some(state) => {
                    live.insert(name, state);
                }
                None => {
                    missing.insert(name);
                }
            }
        }

        let diff = self.table.reconcile(live);
        let mut events = Vec::new();
        for (name, state) in diff.appeared.into_iter().chain(diff.changed) {
            info!("{name}: {state}");
            let label = self.watched(&name).and_then(|s| s.label.clone());
            events.push(MonitorEvent::ServiceState { name, label, state });
        }
        for name in missing.difference(&self.missing) {
            info!("{name}: not installed");
            events.push(MonitorEvent::ServiceMissing { name: name.clone() });
        }
        self.missing = missing;
        Ok(events)
    }

    fn command(&mut self, conn: &ConnectionHandle, command: MonitorCommand) -> MonitorEvent {
        debug!("service command: {command}");
        let result = match &command {
            MonitorCommand::Toggle(name) => self.toggle(conn, name),
            other => Err(WbemError::InvalidTransition(format!(
                "{other} is not a service command"
            ))),
        };
        match result {
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
