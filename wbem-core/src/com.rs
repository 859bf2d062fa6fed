//! COM backend over `IWbemLocator` / `IWbemServices`.
//!
//! [`ComApartment`] wraps `CoInitializeEx` / `CoUninitialize` in an RAII
//! guard and sets process-wide security once; the remaining types adapt the
//! WMI interfaces to the traits in [`crate::provider`].
//!
//! Every interface pointer here is apartment-bound.  The `PhantomData<*const
//! ()>` on the guard and the `Rc` inside [`ObjectHandle`] keep all of it on
//! the thread that initialised COM.

use std::any::Any;

use log::{debug, warn};
use windows::core::{Interface, BSTR, HRESULT, HSTRING, IUnknown, PCWSTR, VARIANT};
use windows::Win32::Foundation::{RPC_E_CHANGED_MODE, RPC_E_TOO_LATE};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket, CoUninitialize,
    CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE, SAFEARRAY,
};
use windows::Win32::System::Ole::{
    SafeArrayAccessData, SafeArrayGetLBound, SafeArrayGetUBound, SafeArrayUnaccessData,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::InitVariantFromBuffer;
use windows::Win32::System::Wmi::{
    IEnumWbemClassObject, IWbemClassObject, IWbemLocator, IWbemServices, IWbemStatusCodeText,
    WbemLocator as WbemLocatorClass, WbemStatusCodeText, WBEM_FLAG_CREATE_OR_UPDATE,
    WBEM_FLAG_FORWARD_ONLY,
    WBEM_FLAG_NONSYSTEM_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY, WBEM_FLAG_RETURN_WBEM_COMPLETE,
    WBEM_GENERIC_FLAG_TYPE, WBEM_INFINITE,
};

use crate::errors::{Direction, NativeStatus, WbemError, WBEM_E_NOT_FOUND};
use crate::native::{NativeValue, WideString};
use crate::provider::{
    ApartmentScope, InstanceEnumerator, MethodEntry, ObjectHandle, Provider, WbemLocator,
    WbemObject, WbemServices,
};
use crate::value::CimType;

// VARENUM tags as read from the raw `vt` field.
const VT_EMPTY: u16 = 0;
const VT_NULL: u16 = 1;
const VT_I2: u16 = 2;
const VT_I4: u16 = 3;
const VT_R4: u16 = 4;
const VT_R8: u16 = 5;
const VT_BSTR: u16 = 8;
const VT_BOOL: u16 = 11;
const VT_UNKNOWN: u16 = 13;
const VT_I1: u16 = 16;
const VT_UI1: u16 = 17;
const VT_UI2: u16 = 18;
const VT_UI4: u16 = 19;
const VT_I8: u16 = 20;
const VT_UI8: u16 = 21;
const VT_ARRAY: u16 = 0x2000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Text of a WMI status from `IWbemStatusCodeText`, when available.
fn status_text(code: HRESULT) -> Option<String> {
    unsafe {
        let status: IWbemStatusCodeText =
            CoCreateInstance(&WbemStatusCodeText, None, CLSCTX_INPROC_SERVER).ok()?;
        status
            .GetErrorCodeText(code, 0, 0)
            .ok()
            .map(|text| text.to_string())
    }
}

fn native_error(call: &str, err: windows::core::Error) -> WbemError {
    let code = err.code();
    let text = status_text(code).unwrap_or_else(|| err.message().to_string());
    WbemError::native(call, NativeStatus::with_text(code.0, text))
}

fn check<T>(call: &str, result: windows::core::Result<T>) -> Result<T, WbemError> {
    result.map_err(|e| native_error(call, e))
}

// ---------------------------------------------------------------------------
// Apartment
// ---------------------------------------------------------------------------

/// RAII wrapper that calls `CoUninitialize` on `Drop` when appropriate.
#[must_use = "ComApartment must be kept alive for the duration of COM usage"]
pub struct ComApartment {
    should_uninit: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ComApartment {
    /// Initialise (or join) the thread's MTA and set default security.
    ///
    /// `RPC_E_CHANGED_MODE` (the thread already has an STA) is tolerated:
    /// COM is usable but no balancing `CoUninitialize` is owed.
    /// `RPC_E_TOO_LATE` from `CoInitializeSecurity` means security was
    /// already set for the process and is likewise tolerated.
    pub fn init() -> Result<Self, WbemError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        let should_uninit = if hr == RPC_E_CHANGED_MODE {
            warn!(
                "CoInitializeEx: RPC_E_CHANGED_MODE -- thread already has STA apartment, \
                 using existing apartment instead of MTA"
            );
            false
        } else {
            check("CoInitializeEx", hr.ok())?;
            true
        };
        let guard = Self {
            should_uninit,
            _not_send: std::marker::PhantomData,
        };

        let security = unsafe {
            CoInitializeSecurity(
                None,
                -1,
                None,
                None,
                RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
                None,
            )
        };
        match security {
            Ok(()) => {}
            Err(e) if e.code() == RPC_E_TOO_LATE => debug!("CoInitializeSecurity: already set"),
            Err(e) => return Err(native_error("CoInitializeSecurity", e)),
        }
        Ok(guard)
    }
}

impl ApartmentScope for ComApartment {
    fn owns_context(&self) -> bool {
        self.should_uninit
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.should_uninit {
            unsafe { CoUninitialize() };
        }
    }
}

// ---------------------------------------------------------------------------
// Provider, locator, services
// ---------------------------------------------------------------------------

/// The real subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComProvider;

impl ComProvider {
    pub fn new() -> Self {
        ComProvider
    }
}

impl Provider for ComProvider {
    fn name(&self) -> &'static str {
        "com"
    }

    fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError> {
        Ok(Box::new(ComApartment::init()?))
    }

    fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError> {
        let locator: IWbemLocator = check("CoCreateInstance(WbemLocator)", unsafe {
            CoCreateInstance(&WbemLocatorClass, None, CLSCTX_INPROC_SERVER)
        })?;
        Ok(Box::new(ComLocator { locator }))
    }
}

struct ComLocator {
    locator: IWbemLocator,
}

impl WbemLocator for ComLocator {
    fn connect_server(&self, namespace: &str) -> Result<Box<dyn WbemServices>, WbemError> {
        let services = check("ConnectServer", unsafe {
            self.locator.ConnectServer(
                &BSTR::from(namespace),
                &BSTR::new(),
                &BSTR::new(),
                &BSTR::new(),
                0,
                &BSTR::new(),
                None,
            )
        })?;
        check("CoSetProxyBlanket", unsafe {
            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                PCWSTR::null(),
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
        })?;
        Ok(Box::new(ComServices { services }))
    }
}

struct ComServices {
    services: IWbemServices,
}

/// The `IWbemClassObject` behind a handle this backend produced.
fn class_object<'a>(handle: &'a ObjectHandle, call: &str) -> Result<&'a IWbemClassObject, WbemError> {
    handle
        .as_any()
        .downcast_ref::<ComObject>()
        .map(|o| &o.inner)
        .ok_or_else(|| WbemError::Config(format!("{call}: object does not belong to the COM backend")))
}

impl WbemServices for ComServices {
    fn get_object(&self, path: &str) -> Result<ObjectHandle, WbemError> {
        let mut object: Option<IWbemClassObject> = None;
        check("GetObject", unsafe {
            self.services.GetObject(
                &BSTR::from(path),
                WBEM_FLAG_RETURN_WBEM_COMPLETE,
                None,
                Some(&mut object as *mut _),
                None,
            )
        })?;
        object
            .map(ComObject::handle)
            .ok_or_else(|| WbemError::native("GetObject", NativeStatus::new(WBEM_E_NOT_FOUND)))
    }

    fn create_instance_enum(
        &self,
        class: &str,
    ) -> Result<Box<dyn InstanceEnumerator>, WbemError> {
        let enumerator = check("CreateInstanceEnum", unsafe {
            self.services.CreateInstanceEnum(
                &BSTR::from(class),
                WBEM_FLAG_FORWARD_ONLY | WBEM_FLAG_RETURN_IMMEDIATELY,
                None,
            )
        })?;
        Ok(Box::new(ComEnumerator { enumerator }))
    }

    fn exec_method(
        &self,
        path: &str,
        method: &str,
        input: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, WbemError> {
        let input = input.map(|h| class_object(h, "ExecMethod")).transpose()?;
        let mut output: Option<IWbemClassObject> = None;
        check("ExecMethod", unsafe {
            self.services.ExecMethod(
                &BSTR::from(path),
                &BSTR::from(method),
                WBEM_GENERIC_FLAG_TYPE(0),
                None,
                input,
                Some(&mut output as *mut _),
                None,
            )
        })?;
        Ok(output.map(ComObject::handle))
    }

    fn put_instance(&self, instance: &ObjectHandle) -> Result<(), WbemError> {
        let object = class_object(instance, "PutInstance")?;
        check("PutInstance", unsafe {
            self.services.PutInstance(
                object,
                WBEM_GENERIC_FLAG_TYPE(WBEM_FLAG_CREATE_OR_UPDATE.0),
                None,
                None,
            )
        })
    }
}

struct ComEnumerator {
    enumerator: IEnumWbemClassObject,
}

impl InstanceEnumerator for ComEnumerator {
    fn next(&mut self) -> Result<Option<ObjectHandle>, WbemError> {
        let mut row = [None; 1];
        let mut returned = 0;
        let hr = unsafe { self.enumerator.Next(WBEM_INFINITE, &mut row, &mut returned) };
        check("IEnumWbemClassObject::Next", hr.ok())?;
        if returned == 0 {
            return Ok(None);
        }
        let [object] = row;
        Ok(object.map(ComObject::handle))
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

struct ComObject {
    inner: IWbemClassObject,
}

impl ComObject {
    fn handle(inner: IWbemClassObject) -> ObjectHandle {
        ObjectHandle::new(ComObject { inner })
    }
}

impl WbemObject for ComObject {
    fn get(&self, name: &str) -> Result<(NativeValue, CimType), WbemError> {
        let wide = HSTRING::from(name);
        let mut value = VARIANT::default();
        let mut cim = 0i32;
        check("IWbemClassObject::Get", unsafe {
            self.inner
                .Get(PCWSTR(wide.as_ptr()), 0, &mut value, Some(&mut cim), None)
        })?;
        Ok((from_variant(&value)?, CimType::from_raw(cim)))
    }

    fn put(&self, name: &str, value: NativeValue, cim: CimType) -> Result<(), WbemError> {
        let wide = HSTRING::from(name);
        // A null pointer sets the property to NULL.
        if value.is_null() {
            return check("IWbemClassObject::Put", unsafe {
                self.inner.Put(PCWSTR(wide.as_ptr()), 0, std::ptr::null(), 0)
            });
        }
        let variant = to_variant(value, cim)?;
        check("IWbemClassObject::Put", unsafe {
            self.inner.Put(PCWSTR(wide.as_ptr()), 0, &variant, 0)
        })
    }

    fn begin_enumeration(&self, include_system: bool) -> Result<(), WbemError> {
        let flags = if include_system {
            0
        } else {
            WBEM_FLAG_NONSYSTEM_ONLY.0
        };
        check("BeginEnumeration", unsafe {
            self.inner.BeginEnumeration(flags)
        })
    }

    fn next(&self) -> Result<Option<(String, CimType)>, WbemError> {
        let mut name = BSTR::new();
        let mut cim = 0i32;
        check("IWbemClassObject::Next", unsafe {
            self.inner.Next(
                0,
                &mut name,
                std::ptr::null_mut(),
                &mut cim,
                std::ptr::null_mut(),
            )
        })?;
        // WBEM_S_NO_MORE_DATA is a success code; it leaves the name unset.
        if name.is_empty() {
            return Ok(None);
        }
        Ok(Some((name.to_string(), CimType::from_raw(cim))))
    }

    fn end_enumeration(&self) -> Result<(), WbemError> {
        check("EndEnumeration", unsafe { self.inner.EndEnumeration() })
    }

    fn begin_method_enumeration(&self) -> Result<(), WbemError> {
        check("BeginMethodEnumeration", unsafe {
            self.inner.BeginMethodEnumeration(0)
        })
    }

    fn next_method(&self) -> Result<Option<MethodEntry>, WbemError> {
        let mut name = BSTR::new();
        let mut inputs: Option<IWbemClassObject> = None;
        let mut outputs: Option<IWbemClassObject> = None;
        check("NextMethod", unsafe {
            self.inner.NextMethod(0, &mut name, &mut inputs, &mut outputs)
        })?;
        if name.is_empty() {
            return Ok(None);
        }
        Ok(Some(MethodEntry {
            name: name.to_string(),
            inputs: inputs.map(ComObject::handle),
            outputs: outputs.map(ComObject::handle),
        }))
    }

    fn end_method_enumeration(&self) -> Result<(), WbemError> {
        check("EndMethodEnumeration", unsafe {
            self.inner.EndMethodEnumeration()
        })
    }

    fn get_method(
        &self,
        name: &str,
    ) -> Result<(Option<ObjectHandle>, Option<ObjectHandle>), WbemError> {
        let wide = HSTRING::from(name);
        let mut inputs: Option<IWbemClassObject> = None;
        let mut outputs: Option<IWbemClassObject> = None;
        check("GetMethod", unsafe {
            self.inner
                .GetMethod(PCWSTR(wide.as_ptr()), 0, &mut inputs, &mut outputs)
        })?;
        Ok((
            inputs.map(ComObject::handle),
            outputs.map(ComObject::handle),
        ))
    }

    fn spawn_instance(&self) -> Result<ObjectHandle, WbemError> {
        let spawned = check("SpawnInstance", unsafe { self.inner.SpawnInstance(0) })?;
        Ok(ComObject::handle(spawned))
    }

    fn object_text(&self) -> Result<String, WbemError> {
        let text = check("GetObjectText", unsafe { self.inner.GetObjectText(0) })?;
        Ok(text.to_string())
    }

    fn property_qualifier(
        &self,
        property: &str,
        qualifier: &str,
    ) -> Result<Option<NativeValue>, WbemError> {
        let property = HSTRING::from(property);
        let qualifiers = check("GetPropertyQualifierSet", unsafe {
            self.inner
                .GetPropertyQualifierSet(PCWSTR(property.as_ptr()))
        })?;
        let qualifier = HSTRING::from(qualifier);
        let mut value = VARIANT::default();
        let result = unsafe {
            qualifiers.Get(
                PCWSTR(qualifier.as_ptr()),
                0,
                &mut value,
                std::ptr::null_mut(),
            )
        };
        match result {
            Ok(()) => from_variant(&value).map(Some),
            Err(e) if e.code().0 == WBEM_E_NOT_FOUND => Ok(None),
            Err(e) => Err(native_error("IWbemQualifierSet::Get", e)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// VARIANT conversion
// ---------------------------------------------------------------------------

fn variant_error(call: &str) -> impl Fn(windows::core::Error) -> WbemError + '_ {
    move |e| native_error(call, e)
}

fn from_variant(variant: &VARIANT) -> Result<NativeValue, WbemError> {
    let conv = variant_error("VariantToValue");
    let raw = variant.as_raw();
    let value = match unsafe { raw.Anonymous.Anonymous.vt } {
        VT_EMPTY => NativeValue::Empty,
        VT_NULL => NativeValue::Null,
        VT_I1 => NativeValue::I1(i32::try_from(variant).map_err(&conv)? as i8),
        VT_I2 => NativeValue::I2(i16::try_from(variant).map_err(&conv)?),
        VT_I4 => NativeValue::I4(i32::try_from(variant).map_err(&conv)?),
        VT_I8 => NativeValue::I8(i64::try_from(variant).map_err(&conv)?),
        VT_UI1 => NativeValue::UI1(u32::try_from(variant).map_err(&conv)? as u8),
        VT_UI2 => NativeValue::UI2(u16::try_from(variant).map_err(&conv)?),
        VT_UI4 => NativeValue::UI4(u32::try_from(variant).map_err(&conv)?),
        VT_UI8 => NativeValue::UI8(u64::try_from(variant).map_err(&conv)?),
        VT_R4 => NativeValue::R4(unsafe { raw.Anonymous.Anonymous.Anonymous.fltVal }),
        VT_R8 => NativeValue::R8(f64::try_from(variant).map_err(&conv)?),
        VT_BOOL => NativeValue::Bool(bool::try_from(variant).map_err(&conv)?),
        VT_BSTR => {
            let bstr = BSTR::try_from(variant).map_err(&conv)?;
            NativeValue::Bstr(WideString::from_wide(&bstr))
        }
        VT_UNKNOWN => {
            let object = IUnknown::try_from(variant)
                .ok()
                .and_then(|unknown| unknown.cast::<IWbemClassObject>().ok());
            NativeValue::Object(object.map(ComObject::handle))
        }
        vt if vt == VT_ARRAY | VT_UI1 => NativeValue::ByteArray(byte_array(variant)?),
        vt => {
            return Err(WbemError::UnsupportedConversion {
                cim: CimType::Unsupported(i32::from(vt)),
                direction: Direction::FromNative,
            })
        }
    };
    Ok(value)
}

fn byte_array(variant: &VARIANT) -> Result<Vec<u8>, WbemError> {
    let psa = unsafe { variant.as_raw().Anonymous.Anonymous.Anonymous.parray } as *const SAFEARRAY;
    if psa.is_null() {
        return Ok(Vec::new());
    }
    unsafe {
        let lower = check("SafeArrayGetLBound", SafeArrayGetLBound(psa, 1))?;
        let upper = check("SafeArrayGetUBound", SafeArrayGetUBound(psa, 1))?;
        let len = usize::try_from(upper - lower + 1).unwrap_or(0);
        let mut data = std::ptr::null_mut();
        check("SafeArrayAccessData", SafeArrayAccessData(psa, &mut data))?;
        let bytes = std::slice::from_raw_parts(data as *const u8, len).to_vec();
        check("SafeArrayUnaccessData", SafeArrayUnaccessData(psa))?;
        Ok(bytes)
    }
}

/// `VT_ARRAY | VT_UI1` over a copy of `bytes`.
fn byte_array_variant(bytes: &[u8], cim: CimType) -> Result<VARIANT, WbemError> {
    let len = u32::try_from(bytes.len()).map_err(|_| WbemError::OutOfRange {
        cim,
        value: format!("{} bytes", bytes.len()),
    })?;
    check("InitVariantFromBuffer", unsafe {
        InitVariantFromBuffer(bytes.as_ptr().cast(), len)
    })
}

/// Build the `VARIANT` WMI expects for a property of type `cim`: 64-bit
/// integers travel as strings, unsigned 16/32-bit ones in `VT_I4`.
fn to_variant(value: NativeValue, cim: CimType) -> Result<VARIANT, WbemError> {
    let variant = match value {
        NativeValue::I1(v) => VARIANT::from(i16::from(v)),
        NativeValue::I2(v) => VARIANT::from(v),
        NativeValue::I4(v) => VARIANT::from(v),
        NativeValue::I8(v) => VARIANT::from(BSTR::from(v.to_string())),
        NativeValue::UI1(v) => VARIANT::from(v),
        NativeValue::UI2(v) => VARIANT::from(i32::from(v)),
        NativeValue::UI4(v) => VARIANT::from(v as i32),
        NativeValue::UI8(v) => VARIANT::from(BSTR::from(v.to_string())),
        NativeValue::R4(v) => VARIANT::from(v),
        NativeValue::R8(v) => VARIANT::from(v),
        NativeValue::Bool(v) => VARIANT::from(v),
        NativeValue::Bstr(w) => VARIANT::from(check("SysAllocString", BSTR::from_wide(w.as_wide()))?),
        NativeValue::Object(Some(handle)) => {
            let unknown: IUnknown = check("QueryInterface", class_object(&handle, "Put")?.cast())?;
            VARIANT::from(unknown)
        }
        NativeValue::Empty | NativeValue::Null | NativeValue::Object(None) => VARIANT::default(),
        NativeValue::ByteArray(bytes) => byte_array_variant(&bytes, cim)?,
    };
    Ok(variant)
}
