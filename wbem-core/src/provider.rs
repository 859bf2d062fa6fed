//! Native seams of the management subsystem.
//!
//! The binding layer never talks to COM directly; it talks to these traits.
//! [`crate::com`] implements them over `IWbemLocator`/`IWbemServices` on
//! Windows and [`crate::memory`] implements them over an in-process
//! repository everywhere else (tests, fixtures, `--fixture`).
//!
//! Everything handed out by a [`WbemServices`] is apartment-bound: handles
//! are `Rc`-based and therefore `!Send`, so a proxy can never leak to a
//! thread that has not initialised its own context.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;

use crate::errors::WbemError;
use crate::memory::MemoryProvider;
use crate::native::NativeValue;
use crate::value::CimType;

/// One entry of a method enumeration: the method name plus its input and
/// output parameter pseudo-objects (absent when the method has none).
pub struct MethodEntry {
    pub name: String,
    pub inputs: Option<ObjectHandle>,
    pub outputs: Option<ObjectHandle>,
}

/// A native class object, instance, or parameter pseudo-object.
///
/// The enumeration cursors are interior state of the object, mirroring the
/// begin/next/end protocol of the subsystem.
pub trait WbemObject {
    /// Read a property together with its declared native type.
    fn get(&self, name: &str) -> Result<(NativeValue, CimType), WbemError>;

    /// Write a property of the local copy.
    fn put(&self, name: &str, value: NativeValue, cim: CimType) -> Result<(), WbemError>;

    /// Start a property enumeration; `include_system` also yields `__` names.
    fn begin_enumeration(&self, include_system: bool) -> Result<(), WbemError>;

    /// Next `(name, type)` pair, `None` once exhausted.
    fn next(&self) -> Result<Option<(String, CimType)>, WbemError>;

    fn end_enumeration(&self) -> Result<(), WbemError>;

    fn begin_method_enumeration(&self) -> Result<(), WbemError>;

    fn next_method(&self) -> Result<Option<MethodEntry>, WbemError>;

    fn end_method_enumeration(&self) -> Result<(), WbemError>;

    /// Input and output parameter templates of one method.
    fn get_method(
        &self,
        name: &str,
    ) -> Result<(Option<ObjectHandle>, Option<ObjectHandle>), WbemError>;

    /// Fresh, unbound instance of this class (or parameter template).
    fn spawn_instance(&self) -> Result<ObjectHandle, WbemError>;

    /// MOF rendering of the object.
    fn object_text(&self) -> Result<String, WbemError>;

    /// Value of a qualifier on one property, `None` when not present.
    fn property_qualifier(
        &self,
        property: &str,
        qualifier: &str,
    ) -> Result<Option<NativeValue>, WbemError>;

    /// Backend-specific view, used when a backend hands one of its own
    /// objects back to itself (method input, `PutInstance`).
    fn as_any(&self) -> &dyn Any;
}

/// Shared-ownership handle to a native object.
///
/// Cloning bumps the count; the native object is released when the last
/// handle drops.
#[derive(Clone)]
pub struct ObjectHandle(Rc<dyn WbemObject>);

impl ObjectHandle {
    pub fn new(object: impl WbemObject + 'static) -> Self {
        Self(Rc::new(object))
    }

    /// `true` when both handles refer to the same native object.
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles sharing the native object.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl Deref for ObjectHandle {
    type Target = dyn WbemObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle(refs={})", self.ref_count())
    }
}

/// Forward-only instance enumerator.
pub trait InstanceEnumerator {
    fn next(&mut self) -> Result<Option<ObjectHandle>, WbemError>;
}

/// A namespace connection.
pub trait WbemServices {
    /// Resolve a class name or an object path.
    fn get_object(&self, path: &str) -> Result<ObjectHandle, WbemError>;

    /// Forward-only, return-immediately enumeration of a class's instances.
    fn create_instance_enum(&self, class: &str)
        -> Result<Box<dyn InstanceEnumerator>, WbemError>;

    /// Execute `method` against the object (or class) at `path`.
    fn exec_method(
        &self,
        path: &str,
        method: &str,
        input: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, WbemError>;

    /// Write a modified instance back to the subsystem.
    fn put_instance(&self, instance: &ObjectHandle) -> Result<(), WbemError>;
}

/// Entry point of the subsystem.
pub trait WbemLocator {
    fn connect_server(&self, namespace: &str) -> Result<Box<dyn WbemServices>, WbemError>;
}

/// Per-thread context (apartment + security).  Dropping it tears the
/// context down when this scope was the one that established it.
pub trait ApartmentScope {
    /// `false` when the thread already had an incompatible context and this
    /// scope merely joined it.
    fn owns_context(&self) -> bool;
}

/// Factory for the native objects above.
///
/// Providers are shareable across threads; what they produce is not.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Initialise the calling thread's context.
    fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError>;

    fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError>;
}

impl<P: Provider + ?Sized> Provider for std::sync::Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError> {
        (**self).initialize()
    }

    fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError> {
        (**self).locator()
    }
}

// ---------------------------------------------------------------------------
// DefaultProvider
// ---------------------------------------------------------------------------

/// The provider the binaries and the FFI layer run against.
#[derive(Clone)]
pub enum DefaultProvider {
    /// COM-backed subsystem.
    #[cfg(windows)]
    Native(crate::com::ComProvider),
    /// In-memory repository loaded from a fixture.
    Memory(MemoryProvider),
}

impl DefaultProvider {
    /// The real subsystem; only available on Windows.
    pub fn native() -> Result<Self, WbemError> {
        #[cfg(windows)]
        {
            Ok(DefaultProvider::Native(crate::com::ComProvider::new()))
        }
        #[cfg(not(windows))]
        {
            Err(WbemError::Config(
                "the native provider requires Windows; pass a fixture instead".to_owned(),
            ))
        }
    }

    /// In-memory provider seeded from a JSON fixture file.
    pub fn from_fixture(path: &Path) -> Result<Self, WbemError> {
        Ok(DefaultProvider::Memory(MemoryProvider::from_fixture_path(path)?))
    }

    /// Fixture when one is given, the native subsystem otherwise.
    pub fn select(fixture: Option<&Path>) -> Result<Self, WbemError> {
        match fixture {
            Some(path) => Self::from_fixture(path),
            None => Self::native(),
        }
    }

    fn inner(&self) -> &dyn Provider {
        match self {
            #[cfg(windows)]
            DefaultProvider::Native(p) => p,
            DefaultProvider::Memory(p) => p,
        }
    }
}

impl Provider for DefaultProvider {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError> {
        self.inner().initialize()
    }

    fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError> {
        self.inner().locator()
    }
}
