//! Error types for `wbem_core`.
//!
//! All Rust-side failures are funnelled through [`WbemError`], which uses
//! `thiserror` for `Display` and `Error` derives.  Variants are grouped the
//! way callers react to them:
//!
//! - **initialization** -- connection/context setup; fatal to the caller,
//! - **schema** -- unknown property/method or class identity; not retried,
//! - **marshalling** -- conversions that would lose or invent data,
//! - **native** -- a wrapped subsystem status; see [`WbemError::is_transient`].

use std::fmt;

use thiserror::Error;

use crate::value::CimType;

// ---------------------------------------------------------------------------
// Native status codes
// ---------------------------------------------------------------------------

/// `WBEM_E_NOT_FOUND` -- object path no longer resolves.
pub const WBEM_E_NOT_FOUND: i32 = 0x8004_1002_u32 as i32;
/// `WBEM_E_FAILED` -- unspecified failure.
pub const WBEM_E_FAILED: i32 = 0x8004_1001_u32 as i32;
/// `WBEM_E_INVALID_CLASS`.
pub const WBEM_E_INVALID_CLASS: i32 = 0x8004_1010_u32 as i32;
/// `WBEM_E_INVALID_NAMESPACE`.
pub const WBEM_E_INVALID_NAMESPACE: i32 = 0x8004_100E_u32 as i32;
/// `WBEM_E_ACCESS_DENIED`.
pub const WBEM_E_ACCESS_DENIED: i32 = 0x8004_1003_u32 as i32;
/// `WBEM_E_TYPE_MISMATCH`.
pub const WBEM_E_TYPE_MISMATCH: i32 = 0x8004_1005_u32 as i32;
/// `WBEM_E_INVALID_METHOD`.
pub const WBEM_E_INVALID_METHOD: i32 = 0x8004_102E_u32 as i32;
/// `WBEM_E_INVALID_PARAMETER`.
pub const WBEM_E_INVALID_PARAMETER: i32 = 0x8004_1008_u32 as i32;
/// `WBEM_E_TRANSPORT_FAILURE`.
pub const WBEM_E_TRANSPORT_FAILURE: i32 = 0x8004_1015_u32 as i32;
/// `WBEM_E_CALL_CANCELLED`.
pub const WBEM_E_CALL_CANCELLED: i32 = 0x8004_1032_u32 as i32;
/// `WBEM_E_SERVER_TOO_BUSY`.
pub const WBEM_E_SERVER_TOO_BUSY: i32 = 0x8004_1045_u32 as i32;
/// `WBEM_E_RETRY_LATER`.
pub const WBEM_E_RETRY_LATER: i32 = 0x8004_3001_u32 as i32;
/// `WBEM_E_RESOURCE_CONTENTION`.
pub const WBEM_E_RESOURCE_CONTENTION: i32 = 0x8004_3002_u32 as i32;
/// `RPC_E_DISCONNECTED` -- the object invoked has disconnected from its clients.
pub const RPC_E_DISCONNECTED: i32 = 0x8001_0108_u32 as i32;
/// `RPC_S_SERVER_UNAVAILABLE` as an HRESULT.
pub const RPC_S_SERVER_UNAVAILABLE: i32 = 0x8007_06BA_u32 as i32;
/// `E_FAIL`.
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;

/// Statuses that describe a temporary condition of the broker or transport.
const TRANSIENT_STATUSES: &[i32] = &[
    WBEM_E_TRANSPORT_FAILURE,
    WBEM_E_CALL_CANCELLED,
    WBEM_E_SERVER_TOO_BUSY,
    WBEM_E_RETRY_LATER,
    WBEM_E_RESOURCE_CONTENTION,
    RPC_E_DISCONNECTED,
    RPC_S_SERVER_UNAVAILABLE,
];

/// A failed native status together with the subsystem's own description.
///
/// `text` is filled from the error-text service when it is available;
/// otherwise only the numeric code is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    pub code: i32,
    pub text: Option<String>,
}

impl NativeStatus {
    pub fn new(code: i32) -> Self {
        Self { code, text: None }
    }

    pub fn with_text(code: i32, text: impl Into<String>) -> Self {
        let text = text.into();
        let text = text.trim().to_owned();
        Self {
            code,
            text: if text.is_empty() { None } else { Some(text) },
        }
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "0x{:08X} {text}", self.code as u32),
            None => write!(f, "0x{:08X}", self.code as u32),
        }
    }
}

// ---------------------------------------------------------------------------
// Error enum
// ---------------------------------------------------------------------------

/// Direction of a failed conversion, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToNative,
    FromNative,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToNative => f.write_str("to native"),
            Direction::FromNative => f.write_str("from native"),
        }
    }
}

/// Top-level error type for the `wbem_core` library.
#[derive(Debug, Clone, Error)]
pub enum WbemError {
    /// Context, locator or namespace setup failed.  Never retried.
    #[error("InitializationError: {stage} failed: {status}")]
    Initialization { stage: String, status: NativeStatus },

    /// The instance carries no class name and none was supplied.
    #[error("SchemaError: cannot determine class identity")]
    ClassIdentity,

    #[error("SchemaError: property not found: {0}")]
    PropertyNotFound(String),

    #[error("SchemaError: method not found: {0}")]
    MethodNotFound(String),

    #[error("SchemaError: {signature} takes {expected} argument(s), {actual} given")]
    ArgumentCount {
        signature: String,
        expected: usize,
        actual: usize,
    },

    #[error("MarshalError: unsupported conversion {direction} for {cim}")]
    UnsupportedConversion { cim: CimType, direction: Direction },

    #[error("MarshalError: type mismatch for {name}: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("MarshalError: value {value} does not fit {cim}")]
    OutOfRange { cim: CimType, value: String },

    /// A native call returned a failure status.
    #[error("NativeError: {call}: {status}")]
    Native { call: String, status: NativeStatus },

    #[error("ObjectError: object no longer exists: {0}")]
    ObjectGone(String),

    #[error("ValueError: unexpected {property} value: {value}")]
    UnexpectedValue { property: String, value: String },

    #[error("StateError: cannot toggle service while {0}")]
    InvalidTransition(String),

    #[error("ConfigError: {0}")]
    Config(String),
}

impl WbemError {
    /// Wrap a native status returned by `call`.
    pub fn native(call: impl Into<String>, status: NativeStatus) -> Self {
        WbemError::Native {
            call: call.into(),
            status,
        }
    }

    /// Wrap a setup failure as a fatal initialization error.
    pub fn initialization(stage: impl Into<String>, status: NativeStatus) -> Self {
        WbemError::Initialization {
            stage: stage.into(),
            status,
        }
    }

    /// Native status code, if this error wraps one.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            WbemError::Native { status, .. } | WbemError::Initialization { status, .. } => {
                Some(status.code)
            }
            _ => None,
        }
    }

    /// `true` for native failures worth retrying (transport hiccups, busy
    /// broker, cancelled call).  Initialization failures are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            WbemError::Native { status, .. } => TRANSIENT_STATUSES.contains(&status.code),
            _ => false,
        }
    }

    /// `true` for lookups of names the schema does not know.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WbemError::PropertyNotFound(_) | WbemError::MethodNotFound(_)
        )
    }

    /// `true` when the entity behind a proxy has disappeared server-side.
    pub fn is_gone(&self) -> bool {
        match self {
            WbemError::ObjectGone(_) => true,
            WbemError::Native { status, .. } => status.code == WBEM_E_NOT_FOUND,
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, WbemError::Initialization { .. })
    }
}

/// Convert a `windows::core::Error` (COM HRESULT failure) into a
/// `WbemError::Native` without a call name.
#[cfg(windows)]
impl From<windows::core::Error> for WbemError {
    fn from(err: windows::core::Error) -> Self {
        let message = err.message();
        WbemError::native(
            "COM",
            NativeStatus::with_text(err.code().0, message.to_string()),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_without_text() {
        let status = NativeStatus::new(WBEM_E_NOT_FOUND);
        assert_eq!(status.to_string(), "0x80041002");
    }

    #[test]
    fn test_status_display_with_text() {
        let status = NativeStatus::with_text(WBEM_E_NOT_FOUND, "Not found \r\n");
        assert_eq!(status.to_string(), "0x80041002 Not found");
    }

    #[test]
    fn test_blank_text_degrades_to_code() {
        let status = NativeStatus::with_text(E_FAIL, "  ");
        assert!(status.text.is_none());
    }

    #[test]
    fn test_transient_classification() {
        let busy = WbemError::native("ExecMethod", NativeStatus::new(WBEM_E_SERVER_TOO_BUSY));
        let denied = WbemError::native("ExecMethod", NativeStatus::new(WBEM_E_ACCESS_DENIED));
        assert!(busy.is_transient());
        assert!(!denied.is_transient());
        assert!(!WbemError::initialization("ConnectServer", NativeStatus::new(WBEM_E_TRANSPORT_FAILURE)).is_transient());
    }

    #[test]
    fn test_not_found_grouping() {
        assert!(WbemError::PropertyNotFound("X".into()).is_not_found());
        assert!(WbemError::MethodNotFound("X()".into()).is_not_found());
        assert!(!WbemError::ClassIdentity.is_not_found());
    }

    #[test]
    fn test_gone_includes_native_not_found() {
        assert!(WbemError::ObjectGone("p".into()).is_gone());
        assert!(WbemError::native("GetObject", NativeStatus::new(WBEM_E_NOT_FOUND)).is_gone());
        assert!(!WbemError::native("GetObject", NativeStatus::new(E_FAIL)).is_gone());
    }

    #[test]
    fn test_error_messages_carry_prefix() {
        let err = WbemError::PropertyNotFound("NoSuchProp".into());
        assert_eq!(err.to_string(), "SchemaError: property not found: NoSuchProp");
        let err = WbemError::initialization("CoInitializeEx", NativeStatus::new(E_FAIL));
        assert!(err.to_string().starts_with("InitializationError: CoInitializeEx failed"));
    }
}
