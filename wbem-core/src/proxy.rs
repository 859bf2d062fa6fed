//! The dynamic object proxy.
//!
//! [`ObjectProxy`] pairs a live instance handle with the class object and
//! the [`Schema`] discovered from it.  `get`/`set`/`invoke` are checked
//! against the schema first, so an unknown name is always a schema error and
//! never reaches the subsystem.  Every read goes to the live instance; there
//! is no value cache.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::enumerate::provider_class_name;
use crate::errors::{WbemError, WBEM_E_NOT_FOUND};
use crate::marshal::{self, from_native, to_native};
use crate::provider::ObjectHandle;
use crate::schema::{
    self, class_from_path, identify_class, normalize_signature, MethodSignature, Schema,
    PATH_PROPERTY, RETURN_VALUE,
};
use crate::value::DynamicValue;

/// Outcome of a method invocation: the integer `ReturnValue` plus the
/// output parameters in declared order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodResult {
    pub return_code: i64,
    pub outputs: Vec<DynamicValue>,
}

impl MethodResult {
    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// A live instance plus its discovered schema.
///
/// `Clone` shares both native handles (bumping their counts) and copies
/// the schema tables.
#[derive(Clone)]
pub struct ObjectProxy {
    conn: ConnectionHandle,
    instance: ObjectHandle,
    class_object: ObjectHandle,
    schema: Schema,
    /// normalized signature -> method name
    dispatch: BTreeMap<String, String>,
}

impl ObjectProxy {
    /// Wrap a live instance, discovering its class schema.
    ///
    /// The class comes from the instance's `CreationClassName`, else from
    /// `hint`; with neither the bind fails with
    /// [`WbemError::ClassIdentity`].
    pub fn bind(
        conn: &ConnectionHandle,
        instance: ObjectHandle,
        hint: Option<&str>,
    ) -> Result<Self, WbemError> {
        let class_name = identify_class(&instance, hint)?;
        let class_object = conn.services().get_object(&class_name)?;
        let schema = schema::discover(&class_name, &*class_object)?;
        Ok(Self::with_schema(conn, instance, class_object, schema))
    }

    /// Template proxy for a logical entity name: `("process")` binds the
    /// `Win32_Process` class object itself.
    pub fn class(conn: &ConnectionHandle, logical_name: &str) -> Result<Self, WbemError> {
        let class_name = provider_class_name(&conn.config().class_prefix, logical_name);
        let class_object = conn.services().get_object(&class_name)?;
        Self::bind(conn, class_object, Some(&class_name))
    }

    /// Resolve an object path and bind the instance it names.
    pub fn from_path(conn: &ConnectionHandle, path: &str) -> Result<Self, WbemError> {
        let instance = conn.services().get_object(path)?;
        Self::bind(conn, instance, class_from_path(path))
    }

    pub(crate) fn with_schema(
        conn: &ConnectionHandle,
        instance: ObjectHandle,
        class_object: ObjectHandle,
        schema: Schema,
    ) -> Self {
        let dispatch = schema
            .methods
            .values()
            .map(|m| (normalize_signature(&m.signature()), m.name.clone()))
            .collect();
        Self {
            conn: ConnectionHandle::clone(conn),
            instance,
            class_object,
            schema,
            dispatch,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn class_name(&self) -> &str {
        &self.schema.class_name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.schema.property(name).is_some()
    }

    pub fn has_method(&self, signature: &str) -> bool {
        self.dispatch.contains_key(&normalize_signature(signature))
    }

    /// Method signature registered under a dispatch key.
    pub fn method(&self, signature: &str) -> Option<&MethodSignature> {
        self.dispatch
            .get(&normalize_signature(signature))
            .and_then(|name| self.schema.method(name))
    }

    /// Persistent path of the bound instance; `None` for spawned instances.
    pub fn path(&self) -> Option<String> {
        let (value, _) = self.instance.get(PATH_PROPERTY).ok()?;
        value.as_string().filter(|p| !p.is_empty())
    }

    /// Pass this object as an object-typed method argument.
    pub fn as_reference(&self) -> DynamicValue {
        DynamicValue::ObjectReference(Some(self.instance.clone()))
    }

    /// MOF rendering of the live instance.
    pub fn object_text(&self) -> Result<String, WbemError> {
        self.instance.object_text()
    }

    // -- properties --------------------------------------------------------

    /// Read a property from the live instance.
    pub fn get(&self, name: &str) -> Result<DynamicValue, WbemError> {
        let def = self
            .schema
            .property(name)
            .ok_or_else(|| WbemError::PropertyNotFound(name.to_owned()))?;
        let (native, _) = self.instance.get(&def.name)?;
        from_native(def.cim, native).map_err(|e| marshal::named(e, &def.name))
    }

    /// Write a property of the bound instance.  No read-back.
    pub fn set(&self, name: &str, value: DynamicValue) -> Result<(), WbemError> {
        let def = self
            .schema
            .property(name)
            .ok_or_else(|| WbemError::PropertyNotFound(name.to_owned()))?;
        let native = to_native(def.cim, &value).map_err(|e| marshal::named(e, &def.name))?;
        self.instance.put(&def.name, native, def.cim)
    }

    /// Persist local modifications of the instance.
    pub fn commit(&self) -> Result<(), WbemError> {
        self.conn.services().put_instance(&self.instance)
    }

    /// Every readable property.  Values that fail to marshal (object
    /// properties, malformed datetimes) show up as `Invalid`.
    pub fn property_snapshot(&self) -> BTreeMap<String, DynamicValue> {
        self.schema
            .properties
            .keys()
            .map(|name| {
                let value = self.get(name).unwrap_or_else(|e| {
                    debug!("{}.{name}: {e}", self.class_name());
                    DynamicValue::Invalid
                });
                (name.clone(), value)
            })
            .collect()
    }

    // -- methods -----------------------------------------------------------

    /// Invoke a method by its signature, e.g. `invoke("Terminate(uint)", &[0u32.into()])`.
    ///
    /// Native failures are returned as-is; retrying is up to the caller.
    pub fn invoke(
        &self,
        signature: &str,
        args: &[DynamicValue],
    ) -> Result<MethodResult, WbemError> {
        let method = self
            .method(signature)
            .ok_or_else(|| WbemError::MethodNotFound(signature.to_owned()))?;
        if args.len() != method.inputs.len() {
            return Err(WbemError::ArgumentCount {
                signature: method.signature(),
                expected: method.inputs.len(),
                actual: args.len(),
            });
        }

        let (template, _) = self.class_object.get_method(&method.name)?;
        let input = match template {
            Some(template) if !method.inputs.is_empty() => {
                let params = template.spawn_instance()?;
                for (def, arg) in method.inputs.iter().zip(args) {
                    let native = to_native(def.cim, arg).map_err(|e| marshal::named(e, &def.name))?;
                    params.put(&def.name, native, def.cim)?;
                }
                Some(params)
            }
            _ => None,
        };

        let target = self.path().unwrap_or_else(|| self.class_name().to_owned());
        debug!("ExecMethod {} on {target}", method.signature());
        let output = self
            .conn
            .services()
            .exec_method(&target, &method.name, input.as_ref())?;

        let output = output.ok_or_else(|| WbemError::UnexpectedValue {
            property: RETURN_VALUE.to_owned(),
            value: format!("no output parameters from {}", method.name),
        })?;

        let return_code = match output.get(RETURN_VALUE) {
            Ok((native, cim)) => {
                let value = from_native(cim, native).map_err(|e| marshal::named(e, RETURN_VALUE))?;
                value.as_i64().ok_or_else(|| WbemError::TypeMismatch {
                    name: RETURN_VALUE.to_owned(),
                    expected: "integer".to_owned(),
                    actual: cim.to_string(),
                })?
            }
            Err(e) if e.status_code() == Some(WBEM_E_NOT_FOUND) => {
                return Err(WbemError::UnexpectedValue {
                    property: RETURN_VALUE.to_owned(),
                    value: format!("missing from {} output", method.name),
                })
            }
            Err(e) => return Err(e),
        };
        let mut outputs = Vec::with_capacity(method.outputs.len());
        for def in &method.outputs {
            let (native, actual) = output.get(&def.name)?;
            if actual != def.cim && !native.is_null() {
                return Err(WbemError::TypeMismatch {
                    name: def.name.clone(),
                    expected: def.cim.to_string(),
                    actual: actual.to_string(),
                });
            }
            outputs.push(from_native(def.cim, native).map_err(|e| marshal::named(e, &def.name))?);
        }
        Ok(MethodResult {
            return_code,
            outputs,
        })
    }

    // -- lifecycle ---------------------------------------------------------

    /// Re-resolve the instance from its persistent path, keeping the schema.
    pub fn refresh(&mut self) -> Result<(), WbemError> {
        let path = self
            .path()
            .ok_or_else(|| WbemError::ObjectGone(self.class_name().to_owned()))?;
        self.instance = self.conn.services().get_object(&path).map_err(|e| {
            if e.is_gone() {
                WbemError::ObjectGone(path.clone())
            } else {
                e
            }
        })?;
        Ok(())
    }

    /// New unbound instance of the same class, sharing the class object.
    pub fn spawn_template(&self) -> Result<ObjectProxy, WbemError> {
        let instance = self.class_object.spawn_instance()?;
        Ok(Self {
            conn: ConnectionHandle::clone(&self.conn),
            instance,
            class_object: self.class_object.clone(),
            schema: self.schema.clone(),
            dispatch: self.dispatch.clone(),
        })
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("class", &self.schema.class_name)
            .field("path", &self.path())
            .finish()
    }
}
