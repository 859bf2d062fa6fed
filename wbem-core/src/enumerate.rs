//! Enumeration of live instances as proxies.
//!
//! [`Instances`] is lazy, finite and forward-only: each element is bound and
//! discovered before the enumerator advances.  A class's schema is
//! discovered once per enumeration and shared by every element of that class.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionHandle;
use crate::errors::WbemError;
use crate::provider::{InstanceEnumerator, ObjectHandle};
use crate::proxy::ObjectProxy;
use crate::schema::{self, identify_class, Schema};

/// What to do with an element whose discovery fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnumerationPolicy {
    /// Yield the error and end the sequence.
    #[default]
    FailFast,
    /// Log, skip the element and continue.
    SkipInvalid,
}

/// `("Win32_", "service")` -> `Win32_Service`.  Only the first letter is
/// changed; the subsystem matches class names case-insensitively.
pub fn provider_class_name(prefix: &str, logical: &str) -> String {
    let mut chars = logical.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_uppercase(), chars.as_str()),
        None => prefix.to_owned(),
    }
}

/// Sequence of bound proxies over one instance enumeration.
pub struct Instances {
    conn: ConnectionHandle,
    enumerator: Option<Box<dyn InstanceEnumerator>>,
    policy: EnumerationPolicy,
    class_name: String,
    cache: HashMap<String, (ObjectHandle, Schema)>,
    skipped: usize,
}

impl Instances {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Elements dropped under [`EnumerationPolicy::SkipInvalid`] so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn materialize(&mut self, instance: ObjectHandle) -> Result<ObjectProxy, WbemError> {
        let class_name = identify_class(&instance, None)?;
        let (class_object, schema) = match self.cache.entry(class_name.to_ascii_lowercase()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let class_object = self.conn.services().get_object(&class_name)?;
                let schema = schema::discover(&class_name, &*class_object)?;
                entry.insert((class_object, schema))
            }
        };
        Ok(ObjectProxy::with_schema(
            &self.conn,
            instance,
            class_object.clone(),
            schema.clone(),
        ))
    }
}

impl Iterator for Instances {
    type Item = Result<ObjectProxy, WbemError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.enumerator.as_mut()?.next();
            let instance = match next {
                Ok(Some(instance)) => instance,
                Ok(None) => {
                    self.enumerator = None;
                    return None;
                }
                Err(e) => {
                    self.enumerator = None;
                    return Some(Err(e));
                }
            };
            match self.materialize(instance) {
                Ok(proxy) => return Some(Ok(proxy)),
                Err(e) => match self.policy {
                    EnumerationPolicy::FailFast => {
                        self.enumerator = None;
                        return Some(Err(e));
                    }
                    EnumerationPolicy::SkipInvalid => {
                        warn!("{}: skipping instance: {e}", self.class_name);
                        self.skipped += 1;
                    }
                },
            }
        }
    }
}

/// Enumerate a logical entity (`"service"`) with the connection's policy.
pub fn enumerate(conn: &ConnectionHandle, logical: &str) -> Result<Instances, WbemError> {
    enumerate_with(conn, logical, conn.config().enumeration_policy)
}

pub fn enumerate_with(
    conn: &ConnectionHandle,
    logical: &str,
    policy: EnumerationPolicy,
) -> Result<Instances, WbemError> {
    let class_name = provider_class_name(&conn.config().class_prefix, logical);
    enumerate_class(conn, &class_name, policy)
}

/// Enumerate an exact provider class name.
pub fn enumerate_class(
    conn: &ConnectionHandle,
    class_name: &str,
    policy: EnumerationPolicy,
) -> Result<Instances, WbemError> {
    debug!("CreateInstanceEnum {class_name} ({policy:?})");
    let enumerator = conn.services().create_instance_enum(class_name)?;
    Ok(Instances {
        conn: ConnectionHandle::clone(conn),
        enumerator: Some(enumerator),
        policy,
        class_name: class_name.to_owned(),
        cache: HashMap::new(),
        skipped: 0,
    })
}

/// Eagerly collect an enumeration, stopping at the first error.
pub fn collect(conn: &ConnectionHandle, logical: &str) -> Result<Vec<ObjectProxy>, WbemError> {
    enumerate(conn, logical)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_class_name_capitalizes_first_letter() {
        assert_eq!(provider_class_name("Win32_", "service"), "Win32_Service");
        assert_eq!(provider_class_name("Win32_", "process"), "Win32_Process");
        assert_eq!(provider_class_name("Win32_", "logicalDisk"), "Win32_LogicalDisk");
        assert_eq!(provider_class_name("Win32_", "Process"), "Win32_Process");
        assert_eq!(provider_class_name("Win32_", ""), "Win32_");
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: EnumerationPolicy = serde_json::from_str("\"skip-invalid\"").unwrap();
        assert_eq!(policy, EnumerationPolicy::SkipInvalid);
        assert_eq!(EnumerationPolicy::default(), EnumerationPolicy::FailFast);
    }
}
