//! `Win32_Process` accessors and process creation.

use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::enumerate::enumerate_with;
use crate::errors::WbemError;
use crate::proxy::ObjectProxy;
use crate::value::DynamicValue;

/// Logical entity name of processes.
pub const PROCESS: &str = "process";
/// Logical entity name of the startup-information class.
pub const PROCESS_STARTUP: &str = "processStartup";

/// `ExecutionState` values 0..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionState {
    Unknown,
    Other,
    Ready,
    Running,
    Blocked,
    SuspendedBlocked,
    SuspendedReady,
    Terminated,
    Stopped,
    Growing,
}

impl ExecutionState {
    pub fn from_raw(raw: u64) -> Option<Self> {
        let state = match raw {
            0 => ExecutionState::Unknown,
            1 => ExecutionState::Other,
            2 => ExecutionState::Ready,
            3 => ExecutionState::Running,
            4 => ExecutionState::Blocked,
            5 => ExecutionState::SuspendedBlocked,
            6 => ExecutionState::SuspendedReady,
            7 => ExecutionState::Terminated,
            8 => ExecutionState::Stopped,
            9 => ExecutionState::Growing,
            _ => return None,
        };
        Some(state)
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, ExecutionState::Terminated | ExecutionState::Stopped)
    }
}

/// `CreateFlags` bits of `Win32_ProcessStartup`.
pub mod create_flags {
    pub const DEBUG_PROCESS: u32 = 1;
    pub const DEBUG_ONLY_THIS_PROCESS: u32 = 2;
    pub const CREATE_SUSPENDED: u32 = 4;
    pub const DETACHED_PROCESS: u32 = 8;
    pub const CREATE_NEW_CONSOLE: u32 = 16;
    pub const CREATE_NEW_PROCESS_GROUP: u32 = 512;
    pub const CREATE_UNICODE_ENVIRONMENT: u32 = 1024;
    pub const CREATE_BREAKAWAY_FROM_JOB: u32 = 16_777_216;
    pub const CREATE_DEFAULT_ERROR_MODE: u32 = 67_108_864;
}

/// `ShowWindow` values of `Win32_ProcessStartup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum ShowWindow {
    Hide = 0,
    Normal = 1,
    ShowMinimized = 2,
    ShowMaximized = 3,
    ShowNoActivate = 4,
    Show = 5,
    Minimize = 6,
    ShowMinNoActive = 7,
    ShowNa = 8,
    Restore = 9,
    ShowDefault = 10,
    ForceMinimize = 11,
}

/// Optional startup settings for [`ProcessProxy::create`]; unset fields
/// are left null on the startup object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupInfo {
    pub create_flags: Option<u32>,
    pub show_window: Option<ShowWindow>,
    pub title: Option<String>,
}

/// A bound `Win32_Process` instance.
#[derive(Clone, Debug)]
pub struct ProcessProxy {
    proxy: ObjectProxy,
}

impl ProcessProxy {
    pub fn new(proxy: ObjectProxy) -> Self {
        Self { proxy }
    }

    /// All processes.
    pub fn all(conn: &ConnectionHandle) -> Result<Vec<ProcessProxy>, WbemError> {
        enumerate_with(conn, PROCESS, conn.config().enumeration_policy)?
            .map(|p| p.map(ProcessProxy::new))
            .collect()
    }

    /// The process with the given id, if it is alive.
    pub fn by_id(conn: &ConnectionHandle, pid: u32) -> Result<Option<ProcessProxy>, WbemError> {
        for proxy in enumerate_with(conn, PROCESS, conn.config().enumeration_policy)? {
            let process = ProcessProxy::new(proxy?);
            if process.process_id()? == Some(pid) {
                return Ok(Some(process));
            }
        }
        Ok(None)
    }

    /// Start a process through `Win32_Process.Create`; returns the new
    /// process id, or the method's non-zero return code as an error.
    pub fn create(
        conn: &ConnectionHandle,
        command_line: &str,
        current_directory: Option<&str>,
        startup: Option<&StartupInfo>,
    ) -> Result<u32, WbemError> {
        let class = ObjectProxy::class(conn, PROCESS)?;
        let startup_arg = match startup {
            Some(info) => {
                let template = ObjectProxy::class(conn, PROCESS_STARTUP)?.spawn_template()?;
                if let Some(flags) = info.create_flags.filter(|f| *f > 0) {
                    template.set("CreateFlags", DynamicValue::from(flags))?;
                }
                if let Some(title) = info.title.as_deref().filter(|t| !t.is_empty()) {
                    template.set("Title", DynamicValue::from(title))?;
                }
                if let Some(show) = info.show_window {
                    template.set("ShowWindow", DynamicValue::UnsignedInt(show as u64))?;
                }
                template.as_reference()
            }
            None => DynamicValue::ObjectReference(None),
        };
        let directory = current_directory
            .map(DynamicValue::from)
            .unwrap_or(DynamicValue::Invalid);
        let result = class.invoke(
            "Create(string,string,object,uint&)",
            &[DynamicValue::from(command_line), directory, startup_arg],
        )?;
        if !result.is_success() {
            return Err(WbemError::UnexpectedValue {
                property: "ReturnValue".to_owned(),
                value: result.return_code.to_string(),
            });
        }
        result
            .outputs
            .first()
            .and_then(DynamicValue::as_u64)
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or(WbemError::UnexpectedValue {
                property: "ProcessId".to_owned(),
                value: "null".to_owned(),
            })
    }

    pub fn proxy(&self) -> &ObjectProxy {
        &self.proxy
    }

    pub fn into_proxy(self) -> ObjectProxy {
        self.proxy
    }

    pub fn refresh(&mut self) -> Result<(), WbemError> {
        self.proxy.refresh()
    }

    /// `None` when the property is null.
    pub fn process_id(&self) -> Result<Option<u32>, WbemError> {
        Ok(self
            .proxy
            .get("ProcessId")?
            .as_u64()
            .and_then(|v| u32::try_from(v).ok()))
    }

    pub fn name(&self) -> Result<String, WbemError> {
        Ok(self.proxy.get("Name")?.to_string_or_empty())
    }

    pub fn caption(&self) -> Result<String, WbemError> {
        Ok(self.proxy.get("Caption")?.to_string_or_empty())
    }

    pub fn command_line(&self) -> Result<String, WbemError> {
        Ok(self.proxy.get("CommandLine")?.to_string_or_empty())
    }

    pub fn executable_path(&self) -> Result<String, WbemError> {
        Ok(self.proxy.get("ExecutablePath")?.to_string_or_empty())
    }

    /// A null `ExecutionState` (the usual case on desktop systems) reads as
    /// `Unknown`.
    pub fn execution_state(&self) -> Result<ExecutionState, WbemError> {
        let value = self.proxy.get("ExecutionState")?;
        if value.is_invalid() {
            return Ok(ExecutionState::Unknown);
        }
        value
            .as_u64()
            .and_then(ExecutionState::from_raw)
            .ok_or_else(|| WbemError::UnexpectedValue {
                property: "ExecutionState".to_owned(),
                value: value.to_string(),
            })
    }

    pub fn is_terminated(&self) -> Result<bool, WbemError> {
        Ok(self.execution_state()?.is_terminated())
    }

    pub fn terminate(&self, reason: u32) -> Result<i64, WbemError> {
        Ok(self
            .proxy
            .invoke("Terminate(uint)", &[DynamicValue::from(reason)])?
            .return_code)
    }

    pub fn attach_debugger(&self) -> Result<i64, WbemError> {
        Ok(self.proxy.invoke("AttachDebugger()", &[])?.return_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_mapping() {
        assert_eq!(ExecutionState::from_raw(3), Some(ExecutionState::Running));
        assert!(ExecutionState::from_raw(7).unwrap().is_terminated());
        assert!(ExecutionState::from_raw(8).unwrap().is_terminated());
        assert!(!ExecutionState::from_raw(3).unwrap().is_terminated());
        assert_eq!(ExecutionState::from_raw(10), None);
    }

    #[test]
    fn test_show_window_discriminants() {
        assert_eq!(ShowWindow::Hide as u16, 0);
        assert_eq!(ShowWindow::ForceMinimize as u16, 11);
    }
}
