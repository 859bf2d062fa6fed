//! Schema discovery.
//!
//! A [`Schema`] is captured once from a live class object and never changes
//! afterwards.  Properties come from the begin/next/end enumeration protocol;
//! methods from its method counterpart, recursing into the input and output
//! parameter pseudo-objects.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::errors::WbemError;
use crate::marshal;
use crate::native::NativeValue;
use crate::provider::{ObjectHandle, WbemObject};
use crate::value::{CimType, TypeTag};

/// Prefix of system properties, skipped unless explicitly requested.
pub const SYSTEM_PREFIX: &str = "__";
/// Persistent instance path.
pub const PATH_PROPERTY: &str = "__PATH";
/// Output pseudo-property carrying a method's integer result.
pub const RETURN_VALUE: &str = "ReturnValue";
/// Property naming the concrete class of an instance.
pub const CREATION_CLASS_NAME: &str = "CreationClassName";
/// Qualifier giving a method parameter's position.
pub const ID_QUALIFIER: &str = "ID";

/// A property or a method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDef {
    pub name: String,
    pub cim: CimType,
    pub tag: TypeTag,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, cim: CimType) -> Self {
        Self {
            name: name.into(),
            cim,
            tag: cim.tag(),
        }
    }
}

/// Ordered inputs and outputs of one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodSignature {
    pub name: String,
    pub inputs: Vec<PropertyDef>,
    pub outputs: Vec<PropertyDef>,
}

impl MethodSignature {
    /// The dispatch key: `name(In1,In2,Out1&,Out2&)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .inputs
            .iter()
            .map(|p| p.tag.signature_name().to_owned())
            .chain(
                self.outputs
                    .iter()
                    .map(|p| format!("{}&", p.tag.signature_name())),
            )
            .collect();
        format!("{}({})", self.name, params.join(","))
    }
}

/// Strip whitespace so `"Terminate( uint )"` dispatches like `"Terminate(uint)"`.
pub fn normalize_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Discovered shape of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub class_name: String,
    pub properties: BTreeMap<String, PropertyDef>,
    pub methods: BTreeMap<String, MethodSignature>,
}

impl Schema {
    /// Look a property up by exact name, then case-insensitively (the
    /// subsystem itself does not distinguish case).
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name).or_else(|| {
            self.properties
                .values()
                .find(|p| p.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn method(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.get(name)
    }

    /// All dispatch keys, sorted.
    pub fn signatures(&self) -> Vec<String> {
        self.methods.values().map(MethodSignature::signature).collect()
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Enumerate `(name, type)` pairs of `object` in enumeration order.
pub fn discover_properties(
    object: &dyn WbemObject,
    include_system: bool,
) -> Result<Vec<PropertyDef>, WbemError> {
    object.begin_enumeration(include_system)?;
    let collect = || -> Result<Vec<PropertyDef>, WbemError> {
        let mut found = Vec::new();
        while let Some((name, cim)) = object.next()? {
            if !include_system && name.starts_with(SYSTEM_PREFIX) {
                continue;
            }
            found.push(PropertyDef::new(name, cim));
        }
        Ok(found)
    };
    let result = collect();
    object.end_enumeration()?;
    result
}

/// Parameters of a pseudo-object, ordered by their `ID` qualifier where the
/// object carries one, by enumeration order otherwise.
pub fn discover_parameters(params: &dyn WbemObject) -> Result<Vec<PropertyDef>, WbemError> {
    let defs = discover_properties(params, false)?;
    let mut keyed = Vec::with_capacity(defs.len());
    for (position, def) in defs.into_iter().enumerate() {
        let id = match params.property_qualifier(&def.name, ID_QUALIFIER)? {
            Some(value) => qualifier_index(&value),
            None => None,
        };
        keyed.push((id.unwrap_or(i64::MAX), position, def));
    }
    keyed.sort_by_key(|(id, position, _)| (*id, *position));
    Ok(keyed.into_iter().map(|(_, _, def)| def).collect())
}

fn qualifier_index(value: &NativeValue) -> Option<i64> {
    marshal::from_native(CimType::SInt64, value.clone())
        .ok()
        .and_then(|v| v.as_i64())
}

/// Capture the full schema of `class_name` from its class object.
pub fn discover(class_name: &str, class_object: &dyn WbemObject) -> Result<Schema, WbemError> {
    let properties = discover_properties(class_object, false)?
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

    class_object.begin_method_enumeration()?;
    let collect = || -> Result<BTreeMap<String, MethodSignature>, WbemError> {
        let mut methods = BTreeMap::new();
        while let Some(entry) = class_object.next_method()? {
            let inputs = match &entry.inputs {
                Some(params) => discover_parameters(&**params)?,
                None => Vec::new(),
            };
            let outputs = match &entry.outputs {
                Some(params) => discover_parameters(&**params)?
                    .into_iter()
                    .filter(|p| p.name != RETURN_VALUE)
                    .collect(),
                None => Vec::new(),
            };
            let method = MethodSignature {
                name: entry.name.clone(),
                inputs,
                outputs,
            };
            debug!("discovered {}::{}", class_name, method.signature());
            methods.insert(entry.name, method);
        }
        Ok(methods)
    };
    let methods = collect();
    class_object.end_method_enumeration()?;

    Ok(Schema {
        class_name: class_name.to_owned(),
        properties,
        methods: methods?,
    })
}

/// Class identity of an instance: its `CreationClassName`, else the
/// externally supplied hint.
pub fn identify_class(instance: &ObjectHandle, hint: Option<&str>) -> Result<String, WbemError> {
    if let Ok((value, _)) = instance.get(CREATION_CLASS_NAME) {
        if let Some(name) = value.as_string().filter(|n| !n.is_empty()) {
            return Ok(name);
        }
    }
    match hint {
        Some(hint) if !hint.is_empty() => Ok(hint.to_owned()),
        _ => Err(WbemError::ClassIdentity),
    }
}

/// Object path without its namespace part:
/// `\\HOST\root\cimv2:Win32_Service.Name="Spooler"` -> `Win32_Service.Name="Spooler"`.
pub fn relative_path(path: &str) -> &str {
    match path.split_once(':') {
        Some((ns, rel)) if ns.contains(['\\', '/']) || !ns.contains(['.', '=', '"']) => rel,
        _ => path,
    }
}

/// Class name embedded in an object path.
pub fn class_from_path(path: &str) -> Option<&str> {
    let class = relative_path(path)
        .split(|c: char| c == '.' || c == '=')
        .next()
        .unwrap_or_default();
    (!class.is_empty()).then_some(class)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str, inputs: &[CimType], outputs: &[CimType]) -> MethodSignature {
        MethodSignature {
            name: name.into(),
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(i, c)| PropertyDef::new(format!("in{i}"), *c))
                .collect(),
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(i, c)| PropertyDef::new(format!("out{i}"), *c))
                .collect(),
        }
    }

    #[test]
    fn test_signature_synthesis() {
        assert_eq!(sig("StopService", &[], &[]).signature(), "StopService()");
        assert_eq!(
            sig("Terminate", &[CimType::UInt32], &[]).signature(),
            "Terminate(uint)"
        );
        assert_eq!(
            sig(
                "Create",
                &[CimType::String, CimType::String, CimType::Object],
                &[CimType::UInt32]
            )
            .signature(),
            "Create(string,string,object,uint&)"
        );
    }

    #[test]
    fn test_normalize_strips_whitespace() {
        assert_eq!(normalize_signature(" Terminate( uint ) "), "Terminate(uint)");
    }

    #[test]
    fn test_class_from_path() {
        assert_eq!(
            class_from_path(r#"\\HOST\root\cimv2:Win32_Service.Name="Spooler""#),
            Some("Win32_Service")
        );
        assert_eq!(class_from_path(r#"Win32_Process.Handle="4""#), Some("Win32_Process"));
        assert_eq!(class_from_path("Win32_Process"), Some("Win32_Process"));
        assert_eq!(
            class_from_path(r#"Win32_Directory.Name="C:\Temp""#),
            Some("Win32_Directory")
        );
        assert_eq!(class_from_path(""), None);
    }

    #[test]
    fn test_property_lookup_ignores_case_as_fallback() {
        let mut properties = BTreeMap::new();
        properties.insert("State".to_owned(), PropertyDef::new("State", CimType::String));
        let schema = Schema {
            class_name: "Win32_Service".into(),
            properties,
            methods: BTreeMap::new(),
        };
        assert!(schema.property("State").is_some());
        assert!(schema.property("state").is_some());
        assert!(schema.property("Status").is_none());
    }
}
