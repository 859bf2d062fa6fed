//! Type tags and the dynamic value type handed to callers.
//!
//! [`CimType`] is the subsystem's primitive type with exact widths;
//! [`TypeTag`] is the closed, width-free classification callers see, and
//! [`DynamicValue`] carries one payload per tag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as Json;

use crate::errors::WbemError;
use crate::provider::ObjectHandle;

// ---------------------------------------------------------------------------
// TypeTag
// ---------------------------------------------------------------------------

/// Width-free classification of a property or parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    SignedInt,
    UnsignedInt,
    Real,
    Boolean,
    String,
    DateTime,
    Char16,
    ByteArray,
    ObjectReference,
    Invalid,
}

impl TypeTag {
    pub const ALL: [TypeTag; 10] = [
        TypeTag::SignedInt,
        TypeTag::UnsignedInt,
        TypeTag::Real,
        TypeTag::Boolean,
        TypeTag::String,
        TypeTag::DateTime,
        TypeTag::Char16,
        TypeTag::ByteArray,
        TypeTag::ObjectReference,
        TypeTag::Invalid,
    ];

    /// Type name used inside method signatures, e.g. `Terminate(uint)`.
    pub fn signature_name(self) -> &'static str {
        match self {
            TypeTag::SignedInt => "int",
            TypeTag::UnsignedInt => "uint",
            TypeTag::Real => "double",
            TypeTag::Boolean => "bool",
            TypeTag::String => "string",
            TypeTag::DateTime => "datetime",
            TypeTag::Char16 => "char16",
            TypeTag::ByteArray => "bytes",
            TypeTag::ObjectReference => "object",
            TypeTag::Invalid => "variant",
        }
    }

    /// Widest native slot for the tag.
    pub fn canonical_cim(self) -> CimType {
        match self {
            TypeTag::SignedInt => CimType::SInt64,
            TypeTag::UnsignedInt => CimType::UInt64,
            TypeTag::Real => CimType::Real64,
            TypeTag::Boolean => CimType::Boolean,
            TypeTag::String => CimType::String,
            TypeTag::DateTime => CimType::DateTime,
            TypeTag::Char16 => CimType::Char16,
            TypeTag::ByteArray => CimType::ByteArray,
            TypeTag::ObjectReference => CimType::Object,
            TypeTag::Invalid => CimType::Empty,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signature_name())
    }
}

// ---------------------------------------------------------------------------
// CimType
// ---------------------------------------------------------------------------

const CIM_EMPTY: i32 = 0;
const CIM_SINT8: i32 = 16;
const CIM_UINT8: i32 = 17;
const CIM_SINT16: i32 = 2;
const CIM_UINT16: i32 = 18;
const CIM_SINT32: i32 = 3;
const CIM_UINT32: i32 = 19;
const CIM_SINT64: i32 = 20;
const CIM_UINT64: i32 = 21;
const CIM_REAL32: i32 = 4;
const CIM_REAL64: i32 = 5;
const CIM_BOOLEAN: i32 = 11;
const CIM_STRING: i32 = 8;
const CIM_DATETIME: i32 = 101;
const CIM_REFERENCE: i32 = 102;
const CIM_CHAR16: i32 = 103;
const CIM_OBJECT: i32 = 13;
const CIM_FLAG_ARRAY: i32 = 0x2000;

/// The subsystem's primitive type, with exact bit widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CimType {
    SInt8,
    SInt16,
    SInt32,
    SInt64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    Real64,
    Boolean,
    String,
    DateTime,
    /// Object path of another instance (`REF`); travels as a string.
    Reference,
    Char16,
    /// Embedded object.
    Object,
    /// `uint8[]`.
    ByteArray,
    Empty,
    /// Any other raw type code (arrays of non-byte types, the illegal 0xfff).
    Unsupported(i32),
}

impl CimType {
    /// Decode a raw `CIMTYPE` code.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            CIM_EMPTY => CimType::Empty,
            CIM_SINT8 => CimType::SInt8,
            CIM_UINT8 => CimType::UInt8,
            CIM_SINT16 => CimType::SInt16,
            CIM_UINT16 => CimType::UInt16,
            CIM_SINT32 => CimType::SInt32,
            CIM_UINT32 => CimType::UInt32,
            CIM_SINT64 => CimType::SInt64,
            CIM_UINT64 => CimType::UInt64,
            CIM_REAL32 => CimType::Real32,
            CIM_REAL64 => CimType::Real64,
            CIM_BOOLEAN => CimType::Boolean,
            CIM_STRING => CimType::String,
            CIM_DATETIME => CimType::DateTime,
            CIM_REFERENCE => CimType::Reference,
            CIM_CHAR16 => CimType::Char16,
            CIM_OBJECT => CimType::Object,
            x if x == CIM_UINT8 | CIM_FLAG_ARRAY => CimType::ByteArray,
            other => CimType::Unsupported(other),
        }
    }

    /// Encode back to the raw `CIMTYPE` code.
    pub fn to_raw(self) -> i32 {
        match self {
            CimType::Empty => CIM_EMPTY,
            CimType::SInt8 => CIM_SINT8,
            CimType::UInt8 => CIM_UINT8,
            CimType::SInt16 => CIM_SINT16,
            CimType::UInt16 => CIM_UINT16,
            CimType::SInt32 => CIM_SINT32,
            CimType::UInt32 => CIM_UINT32,
            CimType::SInt64 => CIM_SINT64,
            CimType::UInt64 => CIM_UINT64,
            CimType::Real32 => CIM_REAL32,
            CimType::Real64 => CIM_REAL64,
            CimType::Boolean => CIM_BOOLEAN,
            CimType::String => CIM_STRING,
            CimType::DateTime => CIM_DATETIME,
            CimType::Reference => CIM_REFERENCE,
            CimType::Char16 => CIM_CHAR16,
            CimType::Object => CIM_OBJECT,
            CimType::ByteArray => CIM_UINT8 | CIM_FLAG_ARRAY,
            CimType::Unsupported(raw) => raw,
        }
    }

    /// Collapse widths onto the caller-facing tag.
    pub fn tag(self) -> TypeTag {
        match self {
            CimType::SInt8 | CimType::SInt16 | CimType::SInt32 | CimType::SInt64 => {
                TypeTag::SignedInt
            }
            CimType::UInt8 | CimType::UInt16 | CimType::UInt32 | CimType::UInt64 => {
                TypeTag::UnsignedInt
            }
            CimType::Real32 | CimType::Real64 => TypeTag::Real,
            CimType::Boolean => TypeTag::Boolean,
            CimType::String | CimType::Reference => TypeTag::String,
            CimType::DateTime => TypeTag::DateTime,
            CimType::Char16 => TypeTag::Char16,
            CimType::ByteArray => TypeTag::ByteArray,
            CimType::Object => TypeTag::ObjectReference,
            CimType::Empty | CimType::Unsupported(_) => TypeTag::Invalid,
        }
    }

    fn name(self) -> std::borrow::Cow<'static, str> {
        let name = match self {
            CimType::SInt8 => "sint8",
            CimType::SInt16 => "sint16",
            CimType::SInt32 => "sint32",
            CimType::SInt64 => "sint64",
            CimType::UInt8 => "uint8",
            CimType::UInt16 => "uint16",
            CimType::UInt32 => "uint32",
            CimType::UInt64 => "uint64",
            CimType::Real32 => "real32",
            CimType::Real64 => "real64",
            CimType::Boolean => "boolean",
            CimType::String => "string",
            CimType::DateTime => "datetime",
            CimType::Reference => "reference",
            CimType::Char16 => "char16",
            CimType::Object => "object",
            CimType::ByteArray => "uint8[]",
            CimType::Empty => "empty",
            CimType::Unsupported(raw) => return format!("cim:{raw}").into(),
        };
        name.into()
    }
}

impl fmt::Display for CimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for CimType {
    type Err = WbemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let cim = match lowered.as_str() {
            "sint8" => CimType::SInt8,
            "sint16" => CimType::SInt16,
            "sint32" => CimType::SInt32,
            "sint64" => CimType::SInt64,
            "uint8" => CimType::UInt8,
            "uint16" => CimType::UInt16,
            "uint32" => CimType::UInt32,
            "uint64" => CimType::UInt64,
            "real32" => CimType::Real32,
            "real64" => CimType::Real64,
            "boolean" | "bool" => CimType::Boolean,
            "string" => CimType::String,
            "datetime" => CimType::DateTime,
            "reference" | "ref" => CimType::Reference,
            "char16" => CimType::Char16,
            "object" => CimType::Object,
            "uint8[]" | "bytes" => CimType::ByteArray,
            "empty" => CimType::Empty,
            other => match other.strip_prefix("cim:").map(str::parse::<i32>) {
                Some(Ok(raw)) => CimType::from_raw(raw),
                _ => return Err(WbemError::Config(format!("unknown CIM type name: {s}"))),
            },
        };
        Ok(cim)
    }
}

impl TryFrom<String> for CimType {
    type Error = WbemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CimType> for String {
    fn from(cim: CimType) -> Self {
        cim.to_string()
    }
}

// ---------------------------------------------------------------------------
// CimDateTime
// ---------------------------------------------------------------------------

/// A DMTF datetime string, validated but kept verbatim.
///
/// Timestamps look like `yyyymmddHHMMSS.mmmmmmsUUU` (sign `+`/`-`, UTC
/// offset in minutes); intervals like `ddddddddHHMMSS.mmmmmm:000`.  Any
/// digit may be replaced by `*` to mark an unused field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CimDateTime(String);

impl CimDateTime {
    const LEN: usize = 25;

    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != Self::LEN {
            return None;
        }
        let field = |range: std::ops::Range<usize>| {
            bytes[range].iter().all(|b| b.is_ascii_digit() || *b == b'*')
        };
        let sign = bytes[21];
        let valid = field(0..14)
            && bytes[14] == b'.'
            && field(15..21)
            && matches!(sign, b'+' | b'-' | b':')
            && field(22..25);
        valid.then(|| CimDateTime(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_interval(&self) -> bool {
        self.0.as_bytes()[21] == b':'
    }
}

impl fmt::Display for CimDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// DynamicValue
// ---------------------------------------------------------------------------

/// The universal currency between callers and proxies.
///
/// `Invalid` means "absent/unreadable" -- a null property, not an error.
#[derive(Clone)]
pub enum DynamicValue {
    SignedInt(i64),
    UnsignedInt(u64),
    Real(f64),
    Boolean(bool),
    String(String),
    DateTime(CimDateTime),
    /// One UTF-16 code unit.
    Char16(u16),
    ByteArray(Vec<u8>),
    /// Write-only reference to another object; `None` passes a null object.
    ObjectReference(Option<ObjectHandle>),
    Invalid,
}

impl DynamicValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            DynamicValue::SignedInt(_) => TypeTag::SignedInt,
            DynamicValue::UnsignedInt(_) => TypeTag::UnsignedInt,
            DynamicValue::Real(_) => TypeTag::Real,
            DynamicValue::Boolean(_) => TypeTag::Boolean,
            DynamicValue::String(_) => TypeTag::String,
            DynamicValue::DateTime(_) => TypeTag::DateTime,
            DynamicValue::Char16(_) => TypeTag::Char16,
            DynamicValue::ByteArray(_) => TypeTag::ByteArray,
            DynamicValue::ObjectReference(_) => TypeTag::ObjectReference,
            DynamicValue::Invalid => TypeTag::Invalid,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, DynamicValue::Invalid)
    }

    /// Integer payload as `i64`, converting unsigned values that fit.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::SignedInt(v) => Some(*v),
            DynamicValue::UnsignedInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Integer payload as `u64`, converting non-negative signed values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DynamicValue::UnsignedInt(v) => Some(*v),
            DynamicValue::SignedInt(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            DynamicValue::DateTime(dt) => Some(dt.as_str()),
            _ => None,
        }
    }

    /// String payload, or an empty string for anything else.
    pub fn to_string_or_empty(&self) -> String {
        self.as_str().map(str::to_owned).unwrap_or_default()
    }

    /// Plain JSON projection.  Object references have no JSON form and
    /// project to `null`; use [`Serialize`] to have that reported instead.
    pub fn to_json(&self) -> Json {
        match self {
            DynamicValue::SignedInt(v) => Json::from(*v),
            DynamicValue::UnsignedInt(v) => Json::from(*v),
            DynamicValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            DynamicValue::Boolean(v) => Json::Bool(*v),
            DynamicValue::String(s) => Json::String(s.clone()),
            DynamicValue::DateTime(dt) => Json::String(dt.as_str().to_owned()),
            DynamicValue::Char16(c) => Json::String(String::from_utf16_lossy(&[*c])),
            DynamicValue::ByteArray(bytes) => {
                Json::Array(bytes.iter().map(|b| Json::from(*b)).collect())
            }
            DynamicValue::ObjectReference(_) | DynamicValue::Invalid => Json::Null,
        }
    }

    /// Build a value of the given native type from its JSON projection.
    ///
    /// `null` always yields `Invalid`.  Integers may be given as JSON
    /// numbers or decimal strings (64-bit values often arrive as strings).
    pub fn from_json(cim: CimType, json: &Json) -> Result<DynamicValue, WbemError> {
        if json.is_null() {
            return Ok(DynamicValue::Invalid);
        }
        let mismatch = || WbemError::TypeMismatch {
            name: "json".to_owned(),
            expected: cim.to_string(),
            actual: json.to_string(),
        };
        let value = match cim.tag() {
            TypeTag::SignedInt => match json {
                Json::Number(n) => n.as_i64().map(DynamicValue::SignedInt),
                Json::String(s) => s.trim().parse().ok().map(DynamicValue::SignedInt),
                _ => None,
            },
            TypeTag::UnsignedInt => match json {
                Json::Number(n) => n.as_u64().map(DynamicValue::UnsignedInt),
                Json::String(s) => s.trim().parse().ok().map(DynamicValue::UnsignedInt),
                _ => None,
            },
            TypeTag::Real => json.as_f64().map(DynamicValue::Real),
            TypeTag::Boolean => json.as_bool().map(DynamicValue::Boolean),
            TypeTag::String => json.as_str().map(|s| DynamicValue::String(s.to_owned())),
            TypeTag::DateTime => json
                .as_str()
                .and_then(CimDateTime::parse)
                .map(DynamicValue::DateTime),
            TypeTag::Char16 => match json {
                Json::String(s) => {
                    let mut units = s.encode_utf16();
                    match (units.next(), units.next()) {
                        (Some(unit), None) => Some(DynamicValue::Char16(unit)),
                        _ => None,
                    }
                }
                Json::Number(n) => n
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .map(DynamicValue::Char16),
                _ => None,
            },
            TypeTag::ByteArray => match json {
                Json::Array(items) => items
                    .iter()
                    .map(|item| item.as_u64().and_then(|v| u8::try_from(v).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(DynamicValue::ByteArray),
                _ => None,
            },
            TypeTag::ObjectReference | TypeTag::Invalid => {
                return Err(WbemError::UnsupportedConversion {
                    cim,
                    direction: crate::errors::Direction::ToNative,
                })
            }
        };
        value.ok_or_else(mismatch)
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::SignedInt(v) => write!(f, "SignedInt({v})"),
            DynamicValue::UnsignedInt(v) => write!(f, "UnsignedInt({v})"),
            DynamicValue::Real(v) => write!(f, "Real({v})"),
            DynamicValue::Boolean(v) => write!(f, "Boolean({v})"),
            DynamicValue::String(v) => write!(f, "String({v:?})"),
            DynamicValue::DateTime(v) => write!(f, "DateTime({v})"),
            DynamicValue::Char16(v) => write!(f, "Char16({v:#06x})"),
            DynamicValue::ByteArray(v) => write!(f, "ByteArray({v:?})"),
            DynamicValue::ObjectReference(Some(_)) => f.write_str("ObjectReference(<object>)"),
            DynamicValue::ObjectReference(None) => f.write_str("ObjectReference(null)"),
            DynamicValue::Invalid => f.write_str("Invalid"),
        }
    }
}

impl fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::ObjectReference(_) => f.write_str("<object>"),
            DynamicValue::Invalid => f.write_str("<invalid>"),
            DynamicValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Reals compare NaN-equal so that round trips of any bit pattern hold.
impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DynamicValue::SignedInt(a), DynamicValue::SignedInt(b)) => a == b,
            (DynamicValue::UnsignedInt(a), DynamicValue::UnsignedInt(b)) => a == b,
            (DynamicValue::Real(a), DynamicValue::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            (DynamicValue::Boolean(a), DynamicValue::Boolean(b)) => a == b,
            (DynamicValue::String(a), DynamicValue::String(b)) => a == b,
            (DynamicValue::DateTime(a), DynamicValue::DateTime(b)) => a == b,
            (DynamicValue::Char16(a), DynamicValue::Char16(b)) => a == b,
            (DynamicValue::ByteArray(a), DynamicValue::ByteArray(b)) => a == b,
            (DynamicValue::ObjectReference(a), DynamicValue::ObjectReference(b)) => match (a, b) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            },
            (DynamicValue::Invalid, DynamicValue::Invalid) => true,
            _ => false,
        }
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let DynamicValue::ObjectReference(Some(_)) = self {
            return Err(serde::ser::Error::custom(
                "object references cannot be serialized",
            ));
        }
        self.to_json().serialize(serializer)
    }
}

impl From<i32> for DynamicValue {
    fn from(v: i32) -> Self {
        DynamicValue::SignedInt(v.into())
    }
}

impl From<i64> for DynamicValue {
    fn from(v: i64) -> Self {
        DynamicValue::SignedInt(v)
    }
}

impl From<u32> for DynamicValue {
    fn from(v: u32) -> Self {
        DynamicValue::UnsignedInt(v.into())
    }
}

impl From<u64> for DynamicValue {
    fn from(v: u64) -> Self {
        DynamicValue::UnsignedInt(v)
    }
}

impl From<f64> for DynamicValue {
    fn from(v: f64) -> Self {
        DynamicValue::Real(v)
    }
}

impl From<bool> for DynamicValue {
    fn from(v: bool) -> Self {
        DynamicValue::Boolean(v)
    }
}

impl From<&str> for DynamicValue {
    fn from(v: &str) -> Self {
        DynamicValue::String(v.to_owned())
    }
}

impl From<String> for DynamicValue {
    fn from(v: String) -> Self {
        DynamicValue::String(v)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cim_raw_codes_round_trip() {
        for raw in [0, 2, 3, 4, 5, 8, 11, 13, 16, 17, 18, 19, 20, 21, 101, 102, 103, 0x2011] {
            assert_eq!(CimType::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(CimType::from_raw(0x2008), CimType::Unsupported(0x2008));
    }

    #[test]
    fn test_widths_collapse_onto_tags() {
        assert_eq!(CimType::SInt8.tag(), TypeTag::SignedInt);
        assert_eq!(CimType::SInt64.tag(), TypeTag::SignedInt);
        assert_eq!(CimType::UInt16.tag(), TypeTag::UnsignedInt);
        assert_eq!(CimType::Real32.tag(), TypeTag::Real);
        assert_eq!(CimType::Reference.tag(), TypeTag::String);
        assert_eq!(CimType::Object.tag(), TypeTag::ObjectReference);
        assert_eq!(CimType::Unsupported(0x2008).tag(), TypeTag::Invalid);
    }

    #[test]
    fn test_cim_names_parse_back() {
        for cim in [CimType::UInt16, CimType::ByteArray, CimType::DateTime, CimType::Unsupported(0xfff)] {
            assert_eq!(cim.to_string().parse::<CimType>().unwrap(), cim);
        }
        assert!("uint128".parse::<CimType>().is_err());
    }

    #[test]
    fn test_cim_type_serde_uses_names() {
        let json = serde_json::to_string(&CimType::UInt32).unwrap();
        assert_eq!(json, "\"uint32\"");
        let back: CimType = serde_json::from_str("\"Boolean\"").unwrap();
        assert_eq!(back, CimType::Boolean);
    }

    #[test]
    fn test_datetime_validation() {
        assert!(CimDateTime::parse("20240131120000.000000+060").is_some());
        assert!(CimDateTime::parse("00000001020304.000000:000").unwrap().is_interval());
        assert!(CimDateTime::parse("2024********.******+***").is_none());
        assert!(CimDateTime::parse("2024013112000.0000000+060").is_none());
        assert!(CimDateTime::parse("20240131120000.000000+06").is_none());
    }

    #[test]
    fn test_signature_names() {
        assert_eq!(TypeTag::UnsignedInt.signature_name(), "uint");
        assert_eq!(TypeTag::ObjectReference.signature_name(), "object");
        assert_eq!(TypeTag::Invalid.signature_name(), "variant");
    }

    #[test]
    fn test_cross_sign_accessors() {
        assert_eq!(DynamicValue::SignedInt(5).as_u64(), Some(5));
        assert_eq!(DynamicValue::SignedInt(-5).as_u64(), None);
        assert_eq!(DynamicValue::UnsignedInt(u64::MAX).as_i64(), None);
    }

    #[test]
    fn test_from_json_per_tag() {
        assert_eq!(
            DynamicValue::from_json(CimType::UInt64, &json!("18446744073709551615")).unwrap(),
            DynamicValue::UnsignedInt(u64::MAX)
        );
        assert_eq!(
            DynamicValue::from_json(CimType::Char16, &json!("A")).unwrap(),
            DynamicValue::Char16(0x41)
        );
        assert_eq!(
            DynamicValue::from_json(CimType::ByteArray, &json!([1, 2, 255])).unwrap(),
            DynamicValue::ByteArray(vec![1, 2, 255])
        );
        assert!(DynamicValue::from_json(CimType::SInt32, &json!(null)).unwrap().is_invalid());
        assert!(DynamicValue::from_json(CimType::Boolean, &json!("yes")).is_err());
        assert!(DynamicValue::from_json(CimType::ByteArray, &json!([256])).is_err());
    }

    #[test]
    fn test_json_projection() {
        assert_eq!(DynamicValue::from("Running").to_json(), json!("Running"));
        assert_eq!(DynamicValue::from(7u32).to_json(), json!(7));
        assert_eq!(DynamicValue::Invalid.to_json(), json!(null));
        let text = serde_json::to_string(&DynamicValue::Boolean(true)).unwrap();
        assert_eq!(text, "true");
    }

    #[test]
    fn test_nan_reals_compare_equal() {
        assert_eq!(DynamicValue::Real(f64::NAN), DynamicValue::Real(f64::NAN));
        assert_ne!(DynamicValue::Real(0.0), DynamicValue::SignedInt(0));
    }
}
