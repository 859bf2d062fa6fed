//! `Win32_Service` accessors.
//!
//! A thin layer over [`ObjectProxy`]: the service state machine lives in the
//! subsystem, callers poll [`ServiceProxy::state`] and drive it through the
//! start/stop/resume methods.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::enumerate::enumerate_with;
use crate::errors::WbemError;
use crate::proxy::ObjectProxy;
use crate::value::DynamicValue;

/// Logical entity name of services.
pub const SERVICE: &str = "service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
    Unknown,
}

impl ServiceState {
    /// Parse the subsystem's `State` string.
    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "Stopped" => ServiceState::Stopped,
            "Start Pending" => ServiceState::StartPending,
            "Stop Pending" => ServiceState::StopPending,
            "Running" => ServiceState::Running,
            "Continue Pending" => ServiceState::ContinuePending,
            "Pause Pending" => ServiceState::PausePending,
            "Paused" => ServiceState::Paused,
            "Unknown" => ServiceState::Unknown,
            _ => return None,
        };
        Some(state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::StartPending => "Start Pending",
            ServiceState::StopPending => "Stop Pending",
            ServiceState::Running => "Running",
            ServiceState::ContinuePending => "Continue Pending",
            ServiceState::PausePending => "Pause Pending",
            ServiceState::Paused => "Paused",
            ServiceState::Unknown => "Unknown",
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ServiceState::StartPending
                | ServiceState::StopPending
                | ServiceState::ContinuePending
                | ServiceState::PausePending
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartMode {
    Boot,
    System,
    Auto,
    Manual,
    Disabled,
}

impl StartMode {
    pub fn parse(s: &str) -> Option<Self> {
        let mode = match s {
            "Boot" => StartMode::Boot,
            "System" => StartMode::System,
            "Auto" => StartMode::Auto,
            "Manual" => StartMode::Manual,
            "Disabled" => StartMode::Disabled,
            _ => return None,
        };
        Some(mode)
    }
}

static QUOTED_RUN: OnceLock<Option<Regex>> = OnceLock::new();
static PLAIN_RUN: OnceLock<Option<Regex>> = OnceLock::new();
static FIRST_TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
static EXECUTABLE: OnceLock<Option<Regex>> = OnceLock::new();

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

fn executable_parts(path: &str) -> Option<regex::Captures<'_>> {
    pattern(&EXECUTABLE, r"^(.*/)?([^/]+)$")?.captures(path)
}

/// Executable path from a service command line, with forward slashes.
///
/// `"C:\Program Files\x.exe" -k` and `C:\Windows\svc.exe -k netsvcs` both
/// yield the binary.  Without quotes or a known extension the first
/// whitespace-delimited token is taken.
pub fn executable_path(command_line: &str) -> String {
    let candidates = if command_line.starts_with('"') {
        [pattern(&QUOTED_RUN, r#"^"([^"]+).*$"#), None]
    } else {
        [
            pattern(&PLAIN_RUN, r"(?i)^(.+?\.(exe|dll|sys))(\s.*)?$"),
            pattern(&FIRST_TOKEN, r"^([^ ]+)"),
        ]
    };
    candidates
        .into_iter()
        .flatten()
        .find_map(|re| re.captures(command_line).and_then(|c| c.get(1)))
        .map(|m| m.as_str().replace('\\', "/"))
        .unwrap_or_default()
}

/// Value following `key` in a command line; a quoted value may span
/// several words and is returned without its quotes.
pub fn key_data(command_line: &str, key: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let (mut quoted, mut collecting) = (false, false);
    for arg in command_line.split(' ') {
        if arg.starts_with('"') {
            quoted = true;
        }
        if arg.ends_with('"') {
            quoted = false;
        }
        if collecting {
            result.push(arg);
            if !quoted {
                break;
            }
        }
        if quoted {
            continue;
        }
        if arg == key {
            collecting = true;
        }
    }
    let joined = result.join(" ");
    match joined.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.to_owned(),
        None => joined,
    }
}

/// A bound `Win32_Service` instance.
#[derive(Clone, Debug)]
pub struct ServiceProxy {
    proxy: ObjectProxy,
}

impl ServiceProxy {
    pub fn new(proxy: ObjectProxy) -> Self {
        Self { proxy }
    }

    /// All services.
    pub fn all(conn: &ConnectionHandle) -> Result<Vec<ServiceProxy>, WbemError> {
        enumerate_with(conn, SERVICE, conn.config().enumeration_policy)?
            .map(|p| p.map(ServiceProxy::new))
            .collect()
    }

    /// The service whose `Name` matches, case-insensitively.
    pub fn find(conn: &ConnectionHandle, name: &str) -> Result<Option<ServiceProxy>, WbemError> {
        for proxy in enumerate_with(conn, SERVICE, conn.config().enumeration_policy)? {
            let service = ServiceProxy::new(proxy?);
            if service.name()?.eq_ignore_ascii_case(name) {
                return Ok(Some(service));
            }
        }
        Ok(None)
    }

    pub fn proxy(&self) -> &ObjectProxy {
        &self.proxy
    }

    pub fn into_proxy(self) -> ObjectProxy {
        self.proxy
    }

    fn string(&self, property: &str) -> Result<String, WbemError> {
        Ok(self.proxy.get(property)?.to_string_or_empty())
    }

    pub fn name(&self) -> Result<String, WbemError> {
        self.string("Name")
    }

    pub fn display_name(&self) -> Result<String, WbemError> {
        self.string("DisplayName")
    }

    pub fn description(&self) -> Result<String, WbemError> {
        self.string("Description")
    }

    /// Current state; the instance is refreshed first.
    pub fn state(&mut self) -> Result<ServiceState, WbemError> {
        self.proxy.refresh()?;
        match self.proxy.get("State")? {
            DynamicValue::Invalid => Ok(ServiceState::Unknown),
            value => {
                let text = value.to_string_or_empty();
                ServiceState::parse(&text).ok_or(WbemError::UnexpectedValue {
                    property: "State".to_owned(),
                    value: text,
                })
            }
        }
    }

    /// `None` when the property is null.
    pub fn start_mode(&self) -> Result<Option<StartMode>, WbemError> {
        match self.proxy.get("StartMode")? {
            DynamicValue::Invalid => Ok(None),
            value => {
                let text = value.to_string_or_empty();
                StartMode::parse(&text)
                    .map(Some)
                    .ok_or(WbemError::UnexpectedValue {
                        property: "StartMode".to_owned(),
                        value: text,
                    })
            }
        }
    }

    /// Raw `PathName` command line.
    pub fn path_name(&self) -> Result<String, WbemError> {
        self.string("PathName")
    }

    /// Command line with forward slashes and surrounding quotes removed.
    pub fn full_path(&self) -> Result<String, WbemError> {
        let p = self.path_name()?.replace('\\', "/");
        match p.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            Some(inner) => Ok(inner.to_owned()),
            None => Ok(p),
        }
    }

    /// Executable path, without arguments.
    pub fn path(&self) -> Result<String, WbemError> {
        Ok(executable_path(&self.path_name()?))
    }

    /// File name of the executable.
    pub fn executable(&self) -> Result<String, WbemError> {
        let path = self.path()?;
        Ok(executable_parts(&path)
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default())
    }

    /// Directory of the executable, with a trailing slash.
    pub fn executable_directory(&self) -> Result<String, WbemError> {
        let path = self.path()?;
        Ok(executable_parts(&path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default())
    }

    /// Argument following `key` on the command line (e.g. `-D` for a data
    /// directory).
    pub fn executable_key_data(&self, key: &str) -> Result<String, WbemError> {
        Ok(key_data(&self.full_path()?, key))
    }

    fn call(&self, signature: &str) -> Result<i64, WbemError> {
        Ok(self.proxy.invoke(signature, &[])?.return_code)
    }

    pub fn start(&self) -> Result<i64, WbemError> {
        self.call("StartService()")
    }

    pub fn stop(&self) -> Result<i64, WbemError> {
        self.call("StopService()")
    }

    pub fn resume(&self) -> Result<i64, WbemError> {
        self.call("ResumeService()")
    }

    pub fn pause(&self) -> Result<i64, WbemError> {
        self.call("PauseService()")
    }

    /// Stopped -> start, Running -> stop, Paused -> resume.  Pending states
    /// are rejected.
    pub fn toggle(&mut self) -> Result<i64, WbemError> {
        match self.state()? {
            ServiceState::Stopped => self.start(),
            ServiceState::Running => self.stop(),
            ServiceState::Paused => self.resume(),
            other => Err(WbemError::InvalidTransition(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        assert_eq!(ServiceState::parse("Running"), Some(ServiceState::Running));
        assert_eq!(ServiceState::parse("Start Pending"), Some(ServiceState::StartPending));
        assert_eq!(ServiceState::parse("running"), None);
        for state in [ServiceState::Paused, ServiceState::ContinuePending] {
            assert_eq!(ServiceState::parse(state.as_str()), Some(state));
        }
        assert!(ServiceState::StopPending.is_pending());
        assert!(!ServiceState::Stopped.is_pending());
    }

    #[test]
    fn test_executable_path_quoted() {
        assert_eq!(
            executable_path(r#""C:\Program Files\PostgreSQL\16\bin\pg_ctl.exe" runservice -N "pg16""#),
            "C:/Program Files/PostgreSQL/16/bin/pg_ctl.exe"
        );
    }

    #[test]
    fn test_executable_path_plain() {
        assert_eq!(
            executable_path(r"C:\Windows\system32\svchost.exe -k netsvcs -p"),
            "C:/Windows/system32/svchost.exe"
        );
        assert_eq!(
            executable_path(r"C:\Windows\System32\drivers\ACPI.SYS"),
            "C:/Windows/System32/drivers/ACPI.SYS"
        );
        assert_eq!(executable_path(r"C:\Tools\legacy.com /service"), "C:/Tools/legacy.com");
        assert_eq!(executable_path("agent --daemon"), "agent");
        assert_eq!(executable_path(""), "");
    }

    #[test]
    fn test_key_data() {
        let cmd = r#"C:/pg/bin/pg_ctl.exe runservice -N pg16 -D "C:/pg/data dir" -w"#;
        assert_eq!(key_data(cmd, "-N"), "pg16");
        assert_eq!(key_data(cmd, "-D"), "C:/pg/data dir");
        assert_eq!(key_data(cmd, "-X"), "");
    }
}
