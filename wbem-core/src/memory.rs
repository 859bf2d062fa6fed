//! In-memory provider.
//!
//! Implements every native trait of [`crate::provider`] over a
//! repository of classes and instances, so the whole binding layer runs
//! without the real subsystem.  The repository sits behind
//! `Arc<parking_lot::Mutex<_>>`: the provider is `Send + Sync` and can be
//! handed to monitor threads, while the objects it produces are per-thread
//! snapshots, exactly like instances fetched from the real broker.
//!
//! Fixtures are JSON documents deserialized into [`Fixture`]; property
//! values are stored as JSON and converted through the marshaller on every
//! read.  Failures can be injected per [`Operation`].

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::config::DEFAULT_NAMESPACE;
use crate::errors::{
    NativeStatus, WbemError, E_FAIL, WBEM_E_ACCESS_DENIED, WBEM_E_INVALID_CLASS,
    WBEM_E_INVALID_METHOD, WBEM_E_INVALID_NAMESPACE, WBEM_E_INVALID_PARAMETER, WBEM_E_NOT_FOUND,
    WBEM_E_SERVER_TOO_BUSY, WBEM_E_TRANSPORT_FAILURE, WBEM_E_TYPE_MISMATCH,
};
use crate::marshal;
use crate::native::NativeValue;
use crate::provider::{
    ApartmentScope, InstanceEnumerator, MethodEntry, ObjectHandle, Provider, WbemLocator,
    WbemObject, WbemServices,
};
use crate::schema::{self, ID_QUALIFIER, PATH_PROPERTY, RETURN_VALUE};
use crate::value::{CimType, DynamicValue};

const CLASS_PROPERTY: &str = "__CLASS";
const PARAMETERS_CLASS: &str = "__PARAMETERS";

// ---------------------------------------------------------------------------
// Fixture format
// ---------------------------------------------------------------------------

/// A complete repository description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub instances: Vec<InstanceDef>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            namespaces: default_namespaces(),
            classes: Vec::new(),
            instances: Vec::new(),
        }
    }
}

fn default_namespaces() -> Vec<String> {
    vec![DEFAULT_NAMESPACE.to_owned()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(rename = "type")]
    pub cim: CimType,
    /// Part of the instance path.
    #[serde(default)]
    pub key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub cim: CimType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<ParamSpec>,
    #[serde(default)]
    pub outputs: Vec<ParamSpec>,
    #[serde(default = "default_return_type")]
    pub return_type: CimType,
    #[serde(default)]
    pub behaviour: Behaviour,
}

fn default_return_type() -> CimType {
    CimType::UInt32
}

/// What a method does when executed.
///
/// String values of the form `"$Name"` in `effects`, `creates` and
/// `outputs` are replaced by the input argument `Name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Behaviour {
    #[serde(default)]
    pub return_value: i64,
    /// Output parameter values.
    #[serde(default)]
    pub outputs: BTreeMap<String, Json>,
    /// Property assignments applied to the target instance.
    #[serde(default)]
    pub effects: BTreeMap<String, Json>,
    /// Properties of a new instance of the target class.
    #[serde(default)]
    pub creates: Option<BTreeMap<String, Json>>,
    /// Delete the target instance after applying effects.
    #[serde(default)]
    pub removes_target: bool,
    /// Fail with this native status instead of running.
    #[serde(default)]
    pub status: Option<u32>,
    /// Succeed without producing an output object.
    #[serde(default)]
    pub no_output: bool,
    /// Leave `ReturnValue` out of the output object.
    #[serde(default)]
    pub omits_return_value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDef {
    pub class: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
}

/// Native operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    Locator,
    ConnectServer,
    GetObject,
    CreateInstanceEnum,
    NextInstance,
    ExecMethod,
    PutInstance,
}

/// One recorded method execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodCall {
    pub path: String,
    pub method: String,
    pub args: BTreeMap<String, Json>,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

struct StoredInstance {
    class: Arc<ClassDef>,
    properties: BTreeMap<String, Json>,
}

impl StoredInstance {
    fn path(&self) -> String {
        instance_path(&self.class, &self.properties)
    }
}

struct Injected {
    operation: Operation,
    status: i32,
    remaining: usize,
}

#[derive(Default)]
struct Repository {
    namespaces: Vec<String>,
    classes: BTreeMap<String, Arc<ClassDef>>,
    instances: Vec<StoredInstance>,
    failures: Vec<Injected>,
    calls: Vec<MethodCall>,
}

enum Target {
    Class(Arc<ClassDef>),
    Instance(usize),
}

impl Repository {
    fn from_fixture(fixture: Fixture) -> Result<Self, WbemError> {
        let mut repo = Repository {
            namespaces: fixture.namespaces,
            ..Repository::default()
        };
        for class in fixture.classes {
            for property in &class.properties {
                if property.name.starts_with(schema::SYSTEM_PREFIX) {
                    return Err(WbemError::Config(format!(
                        "{}.{}: system names are reserved",
                        class.name, property.name
                    )));
                }
            }
            repo.classes
                .insert(class.name.to_ascii_lowercase(), Arc::new(class));
        }
        for instance in fixture.instances {
            repo.insert(&instance.class, instance.properties)?;
        }
        Ok(repo)
    }

    fn class(&self, name: &str) -> Option<Arc<ClassDef>> {
        self.classes.get(&name.to_ascii_lowercase()).cloned()
    }

    fn insert(
        &mut self,
        class_name: &str,
        properties: BTreeMap<String, Json>,
    ) -> Result<String, WbemError> {
        let class = self
            .class(class_name)
            .ok_or_else(|| WbemError::Config(format!("unknown class {class_name}")))?;
        let mut stored = BTreeMap::new();
        for (name, value) in properties {
            let spec = class.property(&name).ok_or_else(|| {
                WbemError::Config(format!("{}: unknown property {name}", class.name))
            })?;
            native_from_json(spec.cim, &value)
                .map_err(|e| WbemError::Config(format!("{}.{}: {e}", class.name, spec.name)))?;
            stored.insert(spec.name.clone(), value);
        }
        let instance = StoredInstance {
            class,
            properties: stored,
        };
        let path = instance.path();
        self.instances.retain(|i| !i.path().eq_ignore_ascii_case(&path));
        self.instances.push(instance);
        Ok(path)
    }

    fn resolve(&self, path: &str) -> Option<Target> {
        let relative = schema::relative_path(path);
        if !relative.contains(['.', '=']) {
            return self.class(relative).map(Target::Class);
        }
        self.instances
            .iter()
            .position(|i| i.path().eq_ignore_ascii_case(relative))
            .map(Target::Instance)
    }

    fn check(&mut self, operation: Operation, call: &str) -> Result<(), WbemError> {
        let Some(index) = self
            .failures
            .iter()
            .position(|f| f.operation == operation && f.remaining > 0)
        else {
            return Ok(());
        };
        let injected = &mut self.failures[index];
        injected.remaining -= 1;
        let status = injected.status;
        if injected.remaining == 0 {
            self.failures.remove(index);
        }
        debug!("memory: injected failure for {call}: 0x{:08X}", status as u32);
        Err(native_error(call, status))
    }
}

/// `Class.Key1="v",Key2=5`, or `Class=@` for keyless classes.
fn instance_path(class: &ClassDef, properties: &BTreeMap<String, Json>) -> String {
    let keys: Vec<String> = class
        .properties
        .iter()
        .filter(|p| p.key)
        .map(|p| {
            let value = match properties.get(&p.name) {
                Some(Json::String(s)) => {
                    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
                }
                Some(Json::Null) | None => "\"\"".to_owned(),
                Some(other) => other.to_string(),
            };
            format!("{}={}", p.name, value)
        })
        .collect();
    if keys.is_empty() {
        format!("{}=@", class.name)
    } else {
        format!("{}.{}", class.name, keys.join(","))
    }
}

/// The subsystem's own wording for the statuses this provider produces.
fn status_text(code: i32) -> &'static str {
    match code {
        WBEM_E_NOT_FOUND => "Not found",
        WBEM_E_INVALID_CLASS => "Invalid class",
        WBEM_E_INVALID_NAMESPACE => "Invalid namespace",
        WBEM_E_INVALID_METHOD => "Invalid method",
        WBEM_E_INVALID_PARAMETER => "Invalid parameter",
        WBEM_E_TYPE_MISMATCH => "Type mismatch",
        WBEM_E_ACCESS_DENIED => "Access denied",
        WBEM_E_TRANSPORT_FAILURE => "Transport failure",
        WBEM_E_SERVER_TOO_BUSY => "Server too busy",
        E_FAIL => "Generic failure",
        _ => "",
    }
}

fn native_error(call: &str, code: i32) -> WbemError {
    WbemError::native(call, NativeStatus::with_text(code, status_text(code)))
}

fn native_from_json(cim: CimType, json: &Json) -> Result<NativeValue, WbemError> {
    if cim == CimType::Object {
        return Ok(NativeValue::Null);
    }
    let value = DynamicValue::from_json(cim, json)?;
    marshal::to_native(cim, &value)
}

fn json_from_native(cim: CimType, native: &NativeValue) -> Result<Json, WbemError> {
    match native {
        NativeValue::Object(Some(handle)) => snapshot_object(handle),
        NativeValue::Object(None) => Ok(Json::Null),
        other => Ok(marshal::from_native(cim, other.clone())?.to_json()),
    }
}

/// Non-system properties of any object as a JSON map.
fn snapshot_object(object: &ObjectHandle) -> Result<Json, WbemError> {
    let mut map = serde_json::Map::new();
    for def in schema::discover_properties(&**object, false)? {
        let (native, cim) = object.get(&def.name)?;
        map.insert(def.name, json_from_native(cim, &native)?);
    }
    Ok(Json::Object(map))
}

fn resolve_args(json: &Json, args: &BTreeMap<String, Json>) -> Json {
    match json {
        Json::String(s) => match s.strip_prefix('$').and_then(|name| args.get(name)) {
            Some(arg) => arg.clone(),
            None => json.clone(),
        },
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle on a shared repository.
#[derive(Clone)]
pub struct MemoryProvider {
    repo: Arc<Mutex<Repository>>,
}

impl MemoryProvider {
    pub fn new(fixture: Fixture) -> Result<Self, WbemError> {
        Ok(Self {
            repo: Arc::new(Mutex::new(Repository::from_fixture(fixture)?)),
        })
    }

    pub fn from_fixture_str(json: &str) -> Result<Self, WbemError> {
        let fixture: Fixture =
            serde_json::from_str(json).map_err(|e| WbemError::Config(format!("fixture: {e}")))?;
        Self::new(fixture)
    }

    pub fn from_fixture_path(path: &Path) -> Result<Self, WbemError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WbemError::Config(format!("{}: {e}", path.display())))?;
        Self::from_fixture_str(&text)
    }

    /// Make the next `operation` fail with `status`.
    pub fn fail_next(&self, operation: Operation, status: i32) {
        self.fail_times(operation, status, 1);
    }

    /// Make the next `times` calls of `operation` fail with `status`.
    pub fn fail_times(&self, operation: Operation, status: i32, times: usize) {
        self.repo.lock().failures.push(Injected {
            operation,
            status,
            remaining: times,
        });
    }

    pub fn clear_failures(&self) {
        self.repo.lock().failures.clear();
    }

    /// Add (or replace) an instance; returns its path.
    pub fn insert_instance(
        &self,
        class: &str,
        properties: BTreeMap<String, Json>,
    ) -> Result<String, WbemError> {
        self.repo.lock().insert(class, properties)
    }

    /// Change one property server-side.
    pub fn set_property(&self, path: &str, property: &str, value: Json) -> Result<(), WbemError> {
        let mut repo = self.repo.lock();
        let Some(Target::Instance(index)) = repo.resolve(path) else {
            return Err(native_error("Put", WBEM_E_NOT_FOUND));
        };
        let instance = &mut repo.instances[index];
        let spec = instance
            .class
            .property(property)
            .ok_or_else(|| native_error("Put", WBEM_E_NOT_FOUND))?;
        native_from_json(spec.cim, &value)?;
        let name = spec.name.clone();
        instance.properties.insert(name, value);
        Ok(())
    }

    pub fn remove_instance(&self, path: &str) -> bool {
        let mut repo = self.repo.lock();
        match repo.resolve(path) {
            Some(Target::Instance(index)) => {
                repo.instances.remove(index);
                true
            }
            _ => false,
        }
    }

    pub fn instance_paths(&self, class: &str) -> Vec<String> {
        self.repo
            .lock()
            .instances
            .iter()
            .filter(|i| i.class.name.eq_ignore_ascii_case(class))
            .map(StoredInstance::path)
            .collect()
    }

    pub fn instance_property(&self, path: &str, property: &str) -> Option<Json> {
        let repo = self.repo.lock();
        match repo.resolve(path)? {
            Target::Instance(index) => repo.instances[index]
                .properties
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(property))
                .map(|(_, v)| v.clone()),
            Target::Class(_) => None,
        }
    }

    /// Every method execution so far, oldest first.
    pub fn calls(&self) -> Vec<MethodCall> {
        self.repo.lock().calls.clone()
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError> {
        self.repo.lock().check(Operation::Initialize, "CoInitializeEx")?;
        Ok(Box::new(MemoryApartment))
    }

    fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError> {
        self.repo
            .lock()
            .check(Operation::Locator, "CoCreateInstance")?;
        Ok(Box::new(MemoryLocator {
            repo: Arc::clone(&self.repo),
        }))
    }
}

struct MemoryApartment;

impl ApartmentScope for MemoryApartment {
    fn owns_context(&self) -> bool {
        true
    }
}

struct MemoryLocator {
    repo: Arc<Mutex<Repository>>,
}

impl WbemLocator for MemoryLocator {
    fn connect_server(&self, namespace: &str) -> Result<Box<dyn WbemServices>, WbemError> {
        let mut repo = self.repo.lock();
        repo.check(Operation::ConnectServer, "ConnectServer")?;
        if !repo
            .namespaces
            .iter()
            .any(|ns| ns.eq_ignore_ascii_case(namespace))
        {
            return Err(native_error("ConnectServer", WBEM_E_INVALID_NAMESPACE));
        }
        Ok(Box::new(MemoryServices {
            repo: Arc::clone(&self.repo),
        }))
    }
}

struct MemoryServices {
    repo: Arc<Mutex<Repository>>,
}

impl WbemServices for MemoryServices {
    fn get_object(&self, path: &str) -> Result<ObjectHandle, WbemError> {
        let mut repo = self.repo.lock();
        repo.check(Operation::GetObject, "GetObject")?;
        let object = match repo.resolve(path) {
            Some(Target::Class(class)) => MemoryObject::class(class),
            Some(Target::Instance(index)) => {
                let stored = &repo.instances[index];
                MemoryObject::instance(Arc::clone(&stored.class), &stored.properties)?
            }
            None => return Err(native_error("GetObject", WBEM_E_NOT_FOUND)),
        };
        Ok(ObjectHandle::new(object))
    }

    fn create_instance_enum(
        &self,
        class: &str,
    ) -> Result<Box<dyn InstanceEnumerator>, WbemError> {
        let mut repo = self.repo.lock();
        repo.check(Operation::CreateInstanceEnum, "CreateInstanceEnum")?;
        if repo.class(class).is_none() {
            return Err(native_error("CreateInstanceEnum", WBEM_E_INVALID_CLASS));
        }
        let pending = repo
            .instances
            .iter()
            .filter(|i| i.class.name.eq_ignore_ascii_case(class))
            .map(|i| (Arc::clone(&i.class), i.properties.clone()))
            .collect();
        Ok(Box::new(MemoryEnumerator {
            repo: Arc::clone(&self.repo),
            pending,
        }))
    }

    fn exec_method(
        &self,
        path: &str,
        method: &str,
        input: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, WbemError> {
        let args = match input {
            Some(params) => match snapshot_object(params)? {
                Json::Object(map) => map.into_iter().collect(),
                _ => BTreeMap::new(),
            },
            None => BTreeMap::new(),
        };

        let mut repo = self.repo.lock();
        repo.check(Operation::ExecMethod, "ExecMethod")?;
        let target = repo
            .resolve(path)
            .ok_or_else(|| native_error("ExecMethod", WBEM_E_NOT_FOUND))?;
        let class = match &target {
            Target::Class(class) => Arc::clone(class),
            Target::Instance(index) => Arc::clone(&repo.instances[*index].class),
        };
        let def = class
            .method(method)
            .cloned()
            .ok_or_else(|| native_error("ExecMethod", WBEM_E_INVALID_METHOD))?;
        repo.calls.push(MethodCall {
            path: schema::relative_path(path).to_owned(),
            method: def.name.clone(),
            args: args.clone(),
        });
        if let Some(status) = def.behaviour.status {
            return Err(native_error("ExecMethod", status as i32));
        }

        let behaviour = &def.behaviour;
        if let Target::Instance(index) = target {
            for (property, value) in &behaviour.effects {
                let name = class
                    .property(property)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| property.clone());
                repo.instances[index]
                    .properties
                    .insert(name, resolve_args(value, &args));
            }
            if behaviour.removes_target {
                repo.instances.remove(index);
            }
        }
        if let Some(creates) = &behaviour.creates {
            let properties = creates
                .iter()
                .map(|(k, v)| (k.clone(), resolve_args(v, &args)))
                .collect();
            repo.insert(&class.name, properties)?;
        }
        drop(repo);

        if behaviour.no_output {
            return Ok(None);
        }
        let ret = (!behaviour.omits_return_value).then_some(def.return_type);
        let output = MemoryObject::parameters(Arc::clone(&class), &def.outputs, ret);
        if let Some(cim) = ret {
            output.put(
                RETURN_VALUE,
                native_from_json(cim, &Json::from(behaviour.return_value))?,
                cim,
            )?;
        }
        for param in &def.outputs {
            if let Some(value) = behaviour.outputs.get(&param.name) {
                let value = resolve_args(value, &args);
                output.put(&param.name, native_from_json(param.cim, &value)?, param.cim)?;
            }
        }
        Ok(Some(ObjectHandle::new(output)))
    }

    fn put_instance(&self, instance: &ObjectHandle) -> Result<(), WbemError> {
        let (class_value, _) = instance.get(CLASS_PROPERTY)?;
        let class = class_value
            .as_string()
            .ok_or_else(|| native_error("PutInstance", WBEM_E_INVALID_CLASS))?;
        let properties = match snapshot_object(instance)? {
            Json::Object(map) => map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
            _ => BTreeMap::new(),
        };
        let mut repo = self.repo.lock();
        repo.check(Operation::PutInstance, "PutInstance")?;
        repo.insert(&class, properties)
            .map(|_| ())
            .map_err(|_| native_error("PutInstance", WBEM_E_INVALID_PARAMETER))
    }
}

struct MemoryEnumerator {
    repo: Arc<Mutex<Repository>>,
    pending: VecDeque<(Arc<ClassDef>, BTreeMap<String, Json>)>,
}

impl InstanceEnumerator for MemoryEnumerator {
    fn next(&mut self) -> Result<Option<ObjectHandle>, WbemError> {
        self.repo.lock().check(Operation::NextInstance, "Next")?;
        match self.pending.pop_front() {
            Some((class, properties)) => Ok(Some(ObjectHandle::new(MemoryObject::instance(
                class,
                &properties,
            )?))),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

struct Slot {
    name: String,
    cim: CimType,
    value: NativeValue,
    id: Option<i32>,
    key: bool,
}

impl Slot {
    fn new(name: &str, cim: CimType, value: NativeValue) -> Self {
        Self {
            name: name.to_owned(),
            cim,
            value,
            id: None,
            key: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Class,
    Instance,
    Parameters,
}

struct MemoryObject {
    class: Arc<ClassDef>,
    shape: Shape,
    slots: RefCell<Vec<Slot>>,
    cursor: RefCell<Option<(usize, bool)>>,
    method_cursor: RefCell<Option<usize>>,
}

impl MemoryObject {
    fn build(class: Arc<ClassDef>, shape: Shape, slots: Vec<Slot>) -> Self {
        Self {
            class,
            shape,
            slots: RefCell::new(slots),
            cursor: RefCell::new(None),
            method_cursor: RefCell::new(None),
        }
    }

    fn class(class: Arc<ClassDef>) -> Self {
        let mut slots = vec![
            Slot::new(CLASS_PROPERTY, CimType::String, NativeValue::bstr(&class.name)),
            Slot::new(PATH_PROPERTY, CimType::String, NativeValue::bstr(&class.name)),
        ];
        slots.extend(class.properties.iter().map(|p| Slot {
            key: p.key,
            ..Slot::new(&p.name, p.cim, NativeValue::Null)
        }));
        Self::build(class, Shape::Class, slots)
    }

    fn instance(
        class: Arc<ClassDef>,
        properties: &BTreeMap<String, Json>,
    ) -> Result<Self, WbemError> {
        let path = instance_path(&class, properties);
        let mut slots = vec![
            Slot::new(CLASS_PROPERTY, CimType::String, NativeValue::bstr(&class.name)),
            Slot::new(PATH_PROPERTY, CimType::String, NativeValue::bstr(&path)),
        ];
        for p in &class.properties {
            let value = match properties.get(&p.name) {
                Some(json) => native_from_json(p.cim, json)?,
                None => NativeValue::Null,
            };
            slots.push(Slot {
                key: p.key,
                ..Slot::new(&p.name, p.cim, value)
            });
        }
        Ok(Self::build(class, Shape::Instance, slots))
    }

    /// Parameter pseudo-object.  Slots enumerate alphabetically; the `ID`
    /// qualifier carries the declared position.
    fn parameters(class: Arc<ClassDef>, params: &[ParamSpec], ret: Option<CimType>) -> Self {
        let mut slots: Vec<Slot> = params
            .iter()
            .enumerate()
            .map(|(i, p)| Slot {
                id: i32::try_from(i).ok(),
                ..Slot::new(&p.name, p.cim, NativeValue::Null)
            })
            .collect();
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(cim) = ret {
            slots.insert(0, Slot::new(RETURN_VALUE, cim, NativeValue::Null));
        }
        Self::build(class, Shape::Parameters, slots)
    }

    fn params_object(class: &Arc<ClassDef>, params: &[ParamSpec], ret: Option<CimType>) -> Option<ObjectHandle> {
        if params.is_empty() && ret.is_none() {
            return None;
        }
        Some(ObjectHandle::new(Self::parameters(Arc::clone(class), params, ret)))
    }

    fn type_name(&self) -> &str {
        match self.shape {
            Shape::Parameters => PARAMETERS_CLASS,
            _ => &self.class.name,
        }
    }
}

impl WbemObject for MemoryObject {
    fn get(&self, name: &str) -> Result<(NativeValue, CimType), WbemError> {
        self.slots
            .borrow()
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| (s.value.clone(), s.cim))
            .ok_or_else(|| native_error("Get", WBEM_E_NOT_FOUND))
    }

    fn put(&self, name: &str, value: NativeValue, cim: CimType) -> Result<(), WbemError> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| native_error("Put", WBEM_E_NOT_FOUND))?;
        if slot.name.starts_with(schema::SYSTEM_PREFIX) {
            return Err(native_error("Put", WBEM_E_ACCESS_DENIED));
        }
        if cim != slot.cim && !value.is_null() {
            return Err(native_error("Put", WBEM_E_TYPE_MISMATCH));
        }
        slot.value = value;
        Ok(())
    }

    fn begin_enumeration(&self, include_system: bool) -> Result<(), WbemError> {
        *self.cursor.borrow_mut() = Some((0, include_system));
        Ok(())
    }

    fn next(&self) -> Result<Option<(String, CimType)>, WbemError> {
        let mut cursor = self.cursor.borrow_mut();
        let Some((position, include_system)) = cursor.as_mut() else {
            return Err(native_error("Next", E_FAIL));
        };
        let slots = self.slots.borrow();
        while let Some(slot) = slots.get(*position) {
            *position += 1;
            if *include_system || !slot.name.starts_with(schema::SYSTEM_PREFIX) {
                return Ok(Some((slot.name.clone(), slot.cim)));
            }
        }
        Ok(None)
    }

    fn end_enumeration(&self) -> Result<(), WbemError> {
        *self.cursor.borrow_mut() = None;
        Ok(())
    }

    fn begin_method_enumeration(&self) -> Result<(), WbemError> {
        *self.method_cursor.borrow_mut() = Some(0);
        Ok(())
    }

    fn next_method(&self) -> Result<Option<MethodEntry>, WbemError> {
        if self.shape == Shape::Parameters {
            return Ok(None);
        }
        let mut cursor = self.method_cursor.borrow_mut();
        let Some(position) = cursor.as_mut() else {
            return Err(native_error("NextMethod", E_FAIL));
        };
        let Some(def) = self.class.methods.get(*position) else {
            return Ok(None);
        };
        *position += 1;
        Ok(Some(MethodEntry {
            name: def.name.clone(),
            inputs: Self::params_object(&self.class, &def.inputs, None),
            outputs: Self::params_object(&self.class, &def.outputs, Some(def.return_type)),
        }))
    }

    fn end_method_enumeration(&self) -> Result<(), WbemError> {
        *self.method_cursor.borrow_mut() = None;
        Ok(())
    }

    fn get_method(
        &self,
        name: &str,
    ) -> Result<(Option<ObjectHandle>, Option<ObjectHandle>), WbemError> {
        let def = self
            .class
            .method(name)
            .ok_or_else(|| native_error("GetMethod", WBEM_E_NOT_FOUND))?;
        Ok((
            Self::params_object(&self.class, &def.inputs, None),
            Self::params_object(&self.class, &def.outputs, Some(def.return_type)),
        ))
    }

    fn spawn_instance(&self) -> Result<ObjectHandle, WbemError> {
        let slots = self
            .slots
            .borrow()
            .iter()
            .map(|s| {
                let value = match s.name.as_str() {
                    CLASS_PROPERTY => s.value.clone(),
                    _ => NativeValue::Null,
                };
                Slot {
                    name: s.name.clone(),
                    cim: s.cim,
                    value,
                    id: s.id,
                    key: s.key,
                }
            })
            .collect();
        let shape = match self.shape {
            Shape::Parameters => Shape::Parameters,
            _ => Shape::Instance,
        };
        Ok(ObjectHandle::new(Self::build(
            Arc::clone(&self.class),
            shape,
            slots,
        )))
    }

    fn object_text(&self) -> Result<String, WbemError> {
        let mut text = String::new();
        let slots = self.slots.borrow();
        let visible = slots
            .iter()
            .filter(|s| !s.name.starts_with(schema::SYSTEM_PREFIX));
        if self.shape == Shape::Class {
            let _ = writeln!(text, "class {}\n{{", self.type_name());
            for slot in visible {
                let key = if slot.key { "[key] " } else { "" };
                let _ = writeln!(text, "\t{key}{} {};", mof_type(slot.cim), slot.name);
            }
        } else {
            let _ = writeln!(text, "instance of {}\n{{", self.type_name());
            for slot in visible.filter(|s| !s.value.is_null()) {
                let _ = writeln!(text, "\t{} = {};", slot.name, mof_value(&slot.value));
            }
        }
        text.push_str("};\n");
        Ok(text)
    }

    fn property_qualifier(
        &self,
        property: &str,
        qualifier: &str,
    ) -> Result<Option<NativeValue>, WbemError> {
        let slots = self.slots.borrow();
        let slot = slots
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(property))
            .ok_or_else(|| native_error("GetPropertyQualifierSet", WBEM_E_NOT_FOUND))?;
        let value = if qualifier.eq_ignore_ascii_case(ID_QUALIFIER) {
            slot.id.map(NativeValue::I4)
        } else if qualifier.eq_ignore_ascii_case("key") {
            slot.key.then_some(NativeValue::Bool(true))
        } else if qualifier.eq_ignore_ascii_case("CIMTYPE") {
            Some(NativeValue::bstr(&mof_type(slot.cim)))
        } else {
            None
        };
        Ok(value)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn mof_type(cim: CimType) -> String {
    match cim {
        CimType::Boolean => "boolean".to_owned(),
        CimType::Reference => "ref".to_owned(),
        other => other.to_string(),
    }
}

fn mof_value(value: &NativeValue) -> String {
    match value {
        NativeValue::Bstr(w) => format!(
            "\"{}\"",
            w.to_string_lossy().replace('\\', "\\\\").replace('"', "\\\"")
        ),
        NativeValue::Bool(true) => "TRUE".to_owned(),
        NativeValue::Bool(false) => "FALSE".to_owned(),
        NativeValue::I1(v) => v.to_string(),
        NativeValue::I2(v) => v.to_string(),
        NativeValue::I4(v) => v.to_string(),
        NativeValue::I8(v) => v.to_string(),
        NativeValue::UI1(v) => v.to_string(),
        NativeValue::UI2(v) => v.to_string(),
        NativeValue::UI4(v) => v.to_string(),
        NativeValue::UI8(v) => v.to_string(),
        NativeValue::R4(v) => v.to_string(),
        NativeValue::R8(v) => v.to_string(),
        NativeValue::ByteArray(bytes) => {
            let items: Vec<String> = bytes.iter().map(u8::to_string).collect();
            format!("{{{}}}", items.join(", "))
        }
        NativeValue::Object(_) => "instance of object".to_owned(),
        NativeValue::Empty | NativeValue::Null => "NULL".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> MemoryProvider {
        let fixture: Fixture = serde_json::from_value(json!({
            "classes": [{
                "name": "Win32_Service",
                "properties": [
                    {"name": "Name", "type": "string", "key": true},
                    {"name": "State", "type": "string"},
                    {"name": "ProcessId", "type": "uint32"}
                ],
                "methods": [{
                    "name": "StopService",
                    "behaviour": {"return_value": 0, "effects": {"State": "Stopped"}}
                }]
            }],
            "instances": [
                {"class": "Win32_Service", "properties": {"Name": "Spooler", "State": "Running", "ProcessId": 42}}
            ]
        }))
        .unwrap();
        MemoryProvider::new(fixture).unwrap()
    }

    fn services(p: &MemoryProvider) -> Box<dyn WbemServices> {
        p.locator().unwrap().connect_server("root\\cimv2").unwrap()
    }

    #[test]
    fn test_instance_path_quotes_keys() {
        let p = provider();
        assert_eq!(
            p.instance_paths("Win32_Service"),
            vec![r#"Win32_Service.Name="Spooler""#.to_owned()]
        );
    }

    #[test]
    fn test_get_object_by_path_and_class() {
        let p = provider();
        let svc = services(&p);
        let instance = svc.get_object(r#"Win32_Service.Name="Spooler""#).unwrap();
        let (state, cim) = instance.get("State").unwrap();
        assert_eq!(cim, CimType::String);
        assert_eq!(state.as_string().as_deref(), Some("Running"));
        let class = svc.get_object("Win32_Service").unwrap();
        assert!(class.get("State").unwrap().0.is_null());
    }

    #[test]
    fn test_unknown_namespace_fails() {
        let p = provider();
        let err = p.locator().unwrap().connect_server("ROOT\\Nope").err().unwrap();
        assert_eq!(err.status_code(), Some(WBEM_E_INVALID_NAMESPACE));
    }

    #[test]
    fn test_exec_method_applies_effects() {
        let p = provider();
        let svc = services(&p);
        let out = svc
            .exec_method(r#"Win32_Service.Name="Spooler""#, "StopService", None)
            .unwrap()
            .unwrap();
        assert!(matches!(out.get("ReturnValue").unwrap().0, NativeValue::UI4(0)));
        assert_eq!(
            p.instance_property(r#"Win32_Service.Name="Spooler""#, "State"),
            Some(json!("Stopped"))
        );
        assert_eq!(p.calls().len(), 1);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let p = provider();
        let svc = services(&p);
        p.fail_next(Operation::GetObject, WBEM_E_SERVER_TOO_BUSY);
        let err = svc.get_object("Win32_Service").err().unwrap();
        assert!(err.is_transient());
        assert!(err.to_string().contains("Server too busy"));
        assert!(svc.get_object("Win32_Service").is_ok());
    }

    #[test]
    fn test_enumerator_snapshots_instances() {
        let p = provider();
        let svc = services(&p);
        let mut instances = svc.create_instance_enum("Win32_Service").unwrap();
        p.remove_instance(r#"Win32_Service.Name="Spooler""#);
        assert!(instances.next().unwrap().is_some());
        assert!(instances.next().unwrap().is_none());
    }

    #[test]
    fn test_put_rejects_type_mismatch() {
        let p = provider();
        let svc = services(&p);
        let instance = svc.get_object(r#"Win32_Service.Name="Spooler""#).unwrap();
        let err = instance
            .put("State", NativeValue::UI4(1), CimType::UInt32)
            .unwrap_err();
        assert_eq!(err.status_code(), Some(WBEM_E_TYPE_MISMATCH));
    }

    #[test]
    fn test_object_text_renders_mof() {
        let p = provider();
        let svc = services(&p);
        let instance = svc.get_object(r#"Win32_Service.Name="Spooler""#).unwrap();
        let text = instance.object_text().unwrap();
        assert!(text.starts_with("instance of Win32_Service"));
        assert!(text.contains("State = \"Running\";"));
        assert!(text.contains("ProcessId = 42;"));
    }

    #[test]
    fn test_fixture_rejects_unknown_property() {
        let result = MemoryProvider::from_fixture_str(
            r#"{"classes":[{"name":"C","properties":[]}],"instances":[{"class":"C","properties":{"X":1}}]}"#,
        );
        assert!(matches!(result, Err(WbemError::Config(_))));
    }
}
