//! The native value representation exchanged with the management subsystem.
//!
//! [`NativeValue`] mirrors the subsystem's tagged union (a `VARIANT` on
//! Windows) closely enough that the COM backend converts it one-to-one.
//! Strings travel as a [`WideString`], a length-prefixed UTF-16 buffer owned
//! by the value; whoever receives the value owns (and frees) the buffer.

use std::fmt;

use crate::provider::ObjectHandle;

/// Length-prefixed UTF-16 buffer, the transport form of strings and `char16`.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct WideString(Vec<u16>);

impl WideString {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_wide(units: &[u16]) -> Self {
        Self(units.to_vec())
    }

    pub fn as_wide(&self) -> &[u16] {
        &self.0
    }

    /// Number of UTF-16 code units (the length prefix).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode to UTF-8, replacing unpaired surrogates.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for WideString {
    fn from(s: &str) -> Self {
        Self(s.encode_utf16().collect())
    }
}

impl From<String> for WideString {
    fn from(s: String) -> Self {
        WideString::from(s.as_str())
    }
}

impl fmt::Debug for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl fmt::Display for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// A value in the subsystem's own representation.
#[derive(Clone)]
pub enum NativeValue {
    /// No value at all (`VT_EMPTY`).
    Empty,
    /// Explicit null (`VT_NULL`), what unset properties read as.
    Null,
    I1(i8),
    I2(i16),
    I4(i32),
    I8(i64),
    UI1(u8),
    UI2(u16),
    UI4(u32),
    UI8(u64),
    R4(f32),
    R8(f64),
    Bool(bool),
    Bstr(WideString),
    /// One-dimensional array of bytes (`VT_ARRAY | VT_UI1`).
    ByteArray(Vec<u8>),
    /// Embedded object (`VT_UNKNOWN`); `None` is a null object pointer.
    Object(Option<ObjectHandle>),
}

impl NativeValue {
    /// Short name of the variant, used in mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            NativeValue::Empty => "empty",
            NativeValue::Null => "null",
            NativeValue::I1(_) => "i1",
            NativeValue::I2(_) => "i2",
            NativeValue::I4(_) => "i4",
            NativeValue::I8(_) => "i8",
            NativeValue::UI1(_) => "ui1",
            NativeValue::UI2(_) => "ui2",
            NativeValue::UI4(_) => "ui4",
            NativeValue::UI8(_) => "ui8",
            NativeValue::R4(_) => "r4",
            NativeValue::R8(_) => "r8",
            NativeValue::Bool(_) => "bool",
            NativeValue::Bstr(_) => "bstr",
            NativeValue::ByteArray(_) => "ui1[]",
            NativeValue::Object(_) => "unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Empty | NativeValue::Null)
    }

    pub fn bstr(s: &str) -> Self {
        NativeValue::Bstr(WideString::from(s))
    }

    /// The string payload of a `Bstr`, if any.
    pub fn as_string(&self) -> Option<String> {
        match self {
            NativeValue::Bstr(w) => Some(w.to_string_lossy()),
            _ => None,
        }
    }
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Empty => f.write_str("Empty"),
            NativeValue::Null => f.write_str("Null"),
            NativeValue::I1(v) => write!(f, "I1({v})"),
            NativeValue::I2(v) => write!(f, "I2({v})"),
            NativeValue::I4(v) => write!(f, "I4({v})"),
            NativeValue::I8(v) => write!(f, "I8({v})"),
            NativeValue::UI1(v) => write!(f, "UI1({v})"),
            NativeValue::UI2(v) => write!(f, "UI2({v})"),
            NativeValue::UI4(v) => write!(f, "UI4({v})"),
            NativeValue::UI8(v) => write!(f, "UI8({v})"),
            NativeValue::R4(v) => write!(f, "R4({v})"),
            NativeValue::R8(v) => write!(f, "R8({v})"),
            NativeValue::Bool(v) => write!(f, "Bool({v})"),
            NativeValue::Bstr(v) => write!(f, "Bstr({v:?})"),
            NativeValue::ByteArray(v) => write!(f, "ByteArray({v:?})"),
            NativeValue::Object(Some(_)) => f.write_str("Object(<object>)"),
            NativeValue::Object(None) => f.write_str("Object(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_string_length_prefix_counts_units() {
        let w = WideString::from("a\u{1F600}");
        // one BMP unit + a surrogate pair
        assert_eq!(w.len(), 3);
        assert_eq!(w.to_string_lossy(), "a\u{1F600}");
    }

    #[test]
    fn test_null_kinds() {
        assert!(NativeValue::Empty.is_null());
        assert!(NativeValue::Null.is_null());
        assert!(!NativeValue::I4(0).is_null());
        assert_eq!(NativeValue::bstr("x").as_string().as_deref(), Some("x"));
    }
}
