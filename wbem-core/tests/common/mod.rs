//! Shared fixture plumbing for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::rc::Rc;

use wbem_core::config::BindingConfig;
use wbem_core::connection::{Connection, ConnectionHandle};
use wbem_core::enumerate::EnumerationPolicy;
use wbem_core::memory::MemoryProvider;

pub fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/cimv2.json")
}

/// Fresh repository seeded from `tests/fixtures/cimv2.json`.
pub fn provider() -> MemoryProvider {
    MemoryProvider::from_fixture_path(&fixture_path()).expect("fixture loads")
}

pub fn connect_with(provider: &MemoryProvider, policy: EnumerationPolicy) -> ConnectionHandle {
    let config = BindingConfig {
        enumeration_policy: policy,
        ..BindingConfig::default()
    };
    Rc::new(Connection::open(provider, &config).expect("connection opens"))
}

pub fn connect(provider: &MemoryProvider) -> ConnectionHandle {
    connect_with(provider, EnumerationPolicy::FailFast)
}

pub const SPOOLER: &str = r#"Win32_Service.Name="Spooler""#;
pub const POSTGRES: &str = r#"Win32_Service.Name="postgresql-x64-16""#;
pub const CHOOSER: &str = r#"Win32_Process.Handle="1312""#;
