//! `wbem_core` -- Runtime-discovered bindings to the Windows management
//! subsystem (WMI).
//!
//! Nothing here is generated from a schema at build time: class layouts and
//! method signatures are discovered from live class objects, values are
//! marshalled by their declared CIM type, and the result is exposed through
//! dynamic proxies and a few thin domain wrappers.  It can be consumed by:
//! - `wbem-ffi` (C ABI DLL for ctypes / other languages)
//! - `wbem-cli` (worker, query and monitor binaries)
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`errors`] | `WbemError` enum via `thiserror`, native status classification |
//! | [`native`] | `NativeValue`, the subsystem's tagged union |
//! | [`value`] | `CimType`, `TypeTag`, `DynamicValue`, CIM datetimes |
//! | [`marshal`] | `DynamicValue` <-> `NativeValue` by declared CIM type |
//! | [`provider`] | Traits at the native seam, `DefaultProvider` |
//! | [`com`] | COM backend (`IWbemServices`), Windows only |
//! | [`memory`] | In-memory backend seeded from JSON fixtures |
//! | [`config`] | TOML configuration via `serde` + `toml` |
//! | [`connection`] | Per-thread connection lifecycle |
//! | [`schema`] | Property and method discovery |
//! | [`proxy`] | `ObjectProxy`: dynamic get/set/invoke |
//! | [`enumerate`] | Lazy instance enumeration |
//! | [`service`] | `Win32_Service` wrapper |
//! | [`process`] | `Win32_Process` wrapper |
//! | [`monitor`] | Threaded service/process watchers |

#[cfg(windows)]
pub mod com;
pub mod config;
pub mod connection;
pub mod enumerate;
pub mod errors;
pub mod marshal;
pub mod memory;
pub mod monitor;
pub mod native;
pub mod process;
pub mod provider;
pub mod proxy;
pub mod schema;
pub mod service;
pub mod value;

pub use config::{BindingConfig, MonitorConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionManager};
pub use enumerate::{enumerate, EnumerationPolicy};
pub use errors::WbemError;
pub use memory::MemoryProvider;
pub use provider::{DefaultProvider, Provider};
pub use proxy::{MethodResult, ObjectProxy};
pub use value::{CimType, DynamicValue};
