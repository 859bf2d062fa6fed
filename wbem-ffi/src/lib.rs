//! C ABI DLL for wbem-core -- loadable by ctypes, C#, or any FFI consumer.
//!
//! All exported functions follow the convention:
//! - Return `i32` status code: `WBEM_OK=0`, `WBEM_ERROR=-1`
//! - String outputs allocated by Rust, freed via `wbem_free_string()`
//! - Last error retrievable via `wbem_last_error()`
//! - `fixture` may be null (live subsystem) or a path to a JSON fixture
//!
//! Each call opens a connection on the calling thread and closes it before
//! returning; nothing apartment-bound outlives the call.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::ptr;
use std::rc::Rc;

use serde_json::{json, Value};
use wbem_core::connection::{Connection, ConnectionHandle};
use wbem_core::enumerate::enumerate;
use wbem_core::proxy::ObjectProxy;
use wbem_core::service::ServiceProxy;
use wbem_core::value::DynamicValue;
use wbem_core::{BindingConfig, DefaultProvider, WbemError};

pub const WBEM_OK: i32 = 0;
pub const WBEM_ERROR: i32 = -1;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Retrieve the last error message (thread-local).
///
/// Returns a pointer valid until the next wbem_* call on this thread.
/// Returns null if no error has occurred.
#[no_mangle]
pub extern "C" fn wbem_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Free a string previously allocated by a wbem_* function.
///
/// # Safety
///
/// `ptr` must be a pointer returned by a wbem_* function or null.
#[no_mangle]
pub unsafe extern "C" fn wbem_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Borrow a required C string argument.
unsafe fn required<'a>(arg: *const c_char, what: &str) -> Result<&'a str, String> {
    if arg.is_null() {
        return Err(format!("{what} is null"));
    }
    unsafe { CStr::from_ptr(arg) }
        .to_str()
        .map_err(|e| format!("{what}: invalid UTF-8: {e}"))
}

unsafe fn optional<'a>(arg: *const c_char, what: &str) -> Result<Option<&'a str>, String> {
    if arg.is_null() {
        Ok(None)
    } else {
        unsafe { required(arg, what) }.map(Some)
    }
}

fn with_connection(
    fixture: Option<&str>,
    f: impl FnOnce(&ConnectionHandle) -> Result<Value, WbemError>,
) -> Result<Value, String> {
    let provider = DefaultProvider::select(fixture.map(Path::new)).map_err(|e| e.to_string())?;
    let conn = Rc::new(
        Connection::open(&provider, &BindingConfig::default()).map_err(|e| e.to_string())?,
    );
    f(&conn).map_err(|e| e.to_string())
}

/// Store `result` into `*out_json`, or record the error.
unsafe fn finish(result: Result<Value, String>, out_json: *mut *mut c_char) -> i32 {
    let json = match result.and_then(|v| {
        serde_json::to_string(&v).map_err(|e| format!("JSON serialization failed: {e}"))
    }) {
        Ok(json) => json,
        Err(e) => {
            set_last_error(&e);
            return WBEM_ERROR;
        }
    };
    match CString::new(json) {
        Ok(cstr) => {
            unsafe { *out_json = cstr.into_raw() };
            WBEM_OK
        }
        Err(e) => {
            set_last_error(&format!("CString conversion failed: {e}"));
            WBEM_ERROR
        }
    }
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// Enumerate a logical entity (`"service"`) as a JSON array of
/// `{class, path, properties}` objects.
///
/// # Safety
///
/// `entity` must be a valid null-terminated UTF-8 C string; `fixture` must
/// be one or null.  `out_json` must be a valid pointer to a `*mut c_char`;
/// on success it receives a string to free with `wbem_free_string()`.
#[no_mangle]
pub unsafe extern "C" fn wbem_enumerate_json(
    entity: *const c_char,
    fixture: *const c_char,
    out_json: *mut *mut c_char,
) -> i32 {
    if out_json.is_null() {
        set_last_error("out_json is null");
        return WBEM_ERROR;
    }
    let result = (|| {
        let entity = unsafe { required(entity, "entity") }?;
        let fixture = unsafe { optional(fixture, "fixture") }?;
        with_connection(fixture, |conn| {
            let mut out = Vec::new();
            for proxy in enumerate(conn, entity)? {
                let proxy = proxy?;
                let properties: serde_json::Map<String, Value> = proxy
                    .property_snapshot()
                    .into_iter()
                    .map(|(name, value)| (name, value.to_json()))
                    .collect();
                out.push(json!({
                    "class": proxy.class_name(),
                    "path": proxy.path(),
                    "properties": properties,
                }));
            }
            Ok(Value::Array(out))
        })
    })();
    unsafe { finish(result, out_json) }
}

/// State of a service as a JSON string (`"Running"`), or `null` when the
/// service is not installed.
///
/// # Safety
///
/// Same contract as [`wbem_enumerate_json`], with `name` in place of
/// `entity`.
#[no_mangle]
pub unsafe extern "C" fn wbem_service_state(
    name: *const c_char,
    fixture: *const c_char,
    out_json: *mut *mut c_char,
) -> i32 {
    if out_json.is_null() {
        set_last_error("out_json is null");
        return WBEM_ERROR;
    }
    let result = (|| {
        let name = unsafe { required(name, "name") }?;
        let fixture = unsafe { optional(fixture, "fixture") }?;
        with_connection(fixture, |conn| match ServiceProxy::find(conn, name)? {
            Some(mut service) => Ok(Value::String(service.state()?.as_str().to_owned())),
            None => Ok(Value::Null),
        })
    })();
    unsafe { finish(result, out_json) }
}

/// Invoke a method on the instance at `path`.  `args_json` is a JSON array
/// of positional inputs (null means none).  The result is
/// `{"return_code": n, "outputs": [...]}`.
///
/// # Safety
///
/// `path` and `signature` must be valid null-terminated UTF-8 C strings;
/// `args_json` and `fixture` must be one or null.  `out_json` as in
/// [`wbem_enumerate_json`].
#[no_mangle]
pub unsafe extern "C" fn wbem_invoke_json(
    path: *const c_char,
    signature: *const c_char,
    args_json: *const c_char,
    fixture: *const c_char,
    out_json: *mut *mut c_char,
) -> i32 {
    if out_json.is_null() {
        set_last_error("out_json is null");
        return WBEM_ERROR;
    }
    let result = (|| {
        let path = unsafe { required(path, "path") }?;
        let signature = unsafe { required(signature, "signature") }?;
        let args: Vec<Value> = match unsafe { optional(args_json, "args_json") }? {
            Some(text) => serde_json::from_str(text).map_err(|e| format!("args_json: {e}"))?,
            None => Vec::new(),
        };
        let fixture = unsafe { optional(fixture, "fixture") }?;
        with_connection(fixture, |conn| {
            let proxy = ObjectProxy::from_path(conn, path)?;
            let method = proxy
                .method(signature)
                .ok_or_else(|| WbemError::MethodNotFound(signature.to_owned()))?;
            if method.inputs.len() != args.len() {
                return Err(WbemError::ArgumentCount {
                    signature: method.signature(),
                    expected: method.inputs.len(),
                    actual: args.len(),
                });
            }
            let values = method
                .inputs
                .iter()
                .zip(&args)
                .map(|(def, arg)| DynamicValue::from_json(def.cim, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let result = proxy.invoke(signature, &values)?;
            Ok(json!({
                "return_code": result.return_code,
                "outputs": result.outputs.iter().map(DynamicValue::to_json).collect::<Vec<_>>(),
            }))
        })
    })();
    unsafe { finish(result, out_json) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> CString {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../wbem-core/tests/fixtures/cimv2.json");
        CString::new(path.to_string_lossy().into_owned()).unwrap()
    }

    fn take(out: *mut c_char) -> Value {
        let text = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_owned();
        unsafe { wbem_free_string(out) };
        serde_json::from_str(&text).unwrap()
    }

    fn last_error() -> String {
        let ptr = wbem_last_error();
        assert!(!ptr.is_null());
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    #[test]
    fn test_enumerate_json() {
        let entity = CString::new("service").unwrap();
        let fixture = fixture();
        let mut out = ptr::null_mut();
        let rc = unsafe { wbem_enumerate_json(entity.as_ptr(), fixture.as_ptr(), &mut out) };
        assert_eq!(rc, WBEM_OK);
        let value = take(out);
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["class"], "Win32_Service");
    }

    #[test]
    fn test_service_state() {
        let fixture = fixture();
        let mut out = ptr::null_mut();
        let name = CString::new("Spooler").unwrap();
        let rc = unsafe { wbem_service_state(name.as_ptr(), fixture.as_ptr(), &mut out) };
        assert_eq!(rc, WBEM_OK);
        assert_eq!(take(out), json!("Running"));

        let name = CString::new("NoSuchService").unwrap();
        let rc = unsafe { wbem_service_state(name.as_ptr(), fixture.as_ptr(), &mut out) };
        assert_eq!(rc, WBEM_OK);
        assert_eq!(take(out), Value::Null);
    }

    #[test]
    fn test_invoke_json() {
        let fixture = fixture();
        let path = CString::new(r#"Win32_Process.Handle="1312""#).unwrap();
        let signature = CString::new("Terminate(uint)").unwrap();
        let args = CString::new("[0]").unwrap();
        let mut out = ptr::null_mut();
        let rc = unsafe {
            wbem_invoke_json(
                path.as_ptr(),
                signature.as_ptr(),
                args.as_ptr(),
                fixture.as_ptr(),
                &mut out,
            )
        };
        assert_eq!(rc, WBEM_OK);
        assert_eq!(take(out)["return_code"], 0);
    }

    #[test]
    fn test_errors_are_reported() {
        let mut out = ptr::null_mut();
        let rc = unsafe { wbem_enumerate_json(ptr::null(), ptr::null(), &mut out) };
        assert_eq!(rc, WBEM_ERROR);
        assert_eq!(last_error(), "entity is null");

        let fixture = fixture();
        let path = CString::new(r#"Win32_Service.Name="Spooler""#).unwrap();
        let signature = CString::new("StopService()").unwrap();
        let args = CString::new("[1]").unwrap();
        let rc = unsafe {
            wbem_invoke_json(
                path.as_ptr(),
                signature.as_ptr(),
                args.as_ptr(),
                fixture.as_ptr(),
                &mut out,
            )
        };
        assert_eq!(rc, WBEM_ERROR);
        assert!(last_error().contains("takes 0 argument"));

        let entity = CString::new("service").unwrap();
        let rc = unsafe { wbem_enumerate_json(entity.as_ptr(), fixture.as_ptr(), ptr::null_mut()) };
        assert_eq!(rc, WBEM_ERROR);
    }
}
