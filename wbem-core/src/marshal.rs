//! Conversions between [`DynamicValue`] and [`NativeValue`].
//!
//! Every numeric CIM type gets its exact-width native slot; in particular
//! `uint16` travels as `UI2`, never as the 8-bit slot.  Integer writes are
//! range-checked and never truncated.  Reads are lenient about the widened
//! transport forms the subsystem actually hands back (`uint32` as `I4`,
//! `sint8` as `I2`, 64-bit integers as decimal strings) but still range-check
//! against the declared type.

use crate::errors::{Direction, WbemError};
use crate::native::NativeValue;
use crate::value::{CimDateTime, CimType, DynamicValue, TypeTag};

// ---------------------------------------------------------------------------
// DynamicValue -> NativeValue
// ---------------------------------------------------------------------------

/// Marshal `value` into the native slot for `cim`.
pub fn to_native(cim: CimType, value: &DynamicValue) -> Result<NativeValue, WbemError> {
    if value.is_invalid() {
        return Ok(if cim == CimType::Empty {
            NativeValue::Empty
        } else {
            NativeValue::Null
        });
    }

    let native = match cim {
        CimType::SInt8 => NativeValue::I1(fit(cim, integer(cim, value)?)?),
        CimType::SInt16 => NativeValue::I2(fit(cim, integer(cim, value)?)?),
        CimType::SInt32 => NativeValue::I4(fit(cim, integer(cim, value)?)?),
        CimType::SInt64 => NativeValue::I8(fit(cim, integer(cim, value)?)?),
        CimType::UInt8 => NativeValue::UI1(fit(cim, integer(cim, value)?)?),
        CimType::UInt16 => NativeValue::UI2(fit(cim, integer(cim, value)?)?),
        CimType::UInt32 => NativeValue::UI4(fit(cim, integer(cim, value)?)?),
        CimType::UInt64 => NativeValue::UI8(fit(cim, integer(cim, value)?)?),
        CimType::Real32 => {
            let v = real(cim, value)?;
            let narrowed = v as f32;
            if !v.is_nan() && f64::from(narrowed) != v {
                return Err(WbemError::OutOfRange {
                    cim,
                    value: v.to_string(),
                });
            }
            NativeValue::R4(narrowed)
        }
        CimType::Real64 => NativeValue::R8(real(cim, value)?),
        CimType::Boolean => match value {
            DynamicValue::Boolean(b) => NativeValue::Bool(*b),
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        CimType::String | CimType::Reference => match value {
            DynamicValue::String(s) => NativeValue::bstr(s),
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        CimType::DateTime => match value {
            DynamicValue::DateTime(dt) => NativeValue::bstr(dt.as_str()),
            DynamicValue::String(s) => match CimDateTime::parse(s) {
                Some(dt) => NativeValue::bstr(dt.as_str()),
                None => return Err(mismatch(cim, "string")),
            },
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        // char16 travels in the signed 16-bit slot, bit for bit.
        CimType::Char16 => match value {
            DynamicValue::Char16(c) => NativeValue::I2(*c as i16),
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        CimType::ByteArray => match value {
            DynamicValue::ByteArray(bytes) => NativeValue::ByteArray(bytes.clone()),
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        CimType::Object => match value {
            DynamicValue::ObjectReference(handle) => NativeValue::Object(handle.clone()),
            other => return Err(mismatch(cim, other.tag().signature_name())),
        },
        CimType::Empty | CimType::Unsupported(_) => {
            return Err(WbemError::UnsupportedConversion {
                cim,
                direction: Direction::ToNative,
            })
        }
    };
    Ok(native)
}

fn integer(cim: CimType, value: &DynamicValue) -> Result<i128, WbemError> {
    match value {
        DynamicValue::SignedInt(v) => Ok(i128::from(*v)),
        DynamicValue::UnsignedInt(v) => Ok(i128::from(*v)),
        other => Err(mismatch(cim, other.tag().signature_name())),
    }
}

fn real(cim: CimType, value: &DynamicValue) -> Result<f64, WbemError> {
    match value {
        DynamicValue::Real(v) => Ok(*v),
        other => Err(mismatch(cim, other.tag().signature_name())),
    }
}

fn fit<T: TryFrom<i128>>(cim: CimType, v: i128) -> Result<T, WbemError> {
    T::try_from(v).map_err(|_| WbemError::OutOfRange {
        cim,
        value: v.to_string(),
    })
}

// ---------------------------------------------------------------------------
// NativeValue -> DynamicValue
// ---------------------------------------------------------------------------

/// Marshal a native value read from a slot declared as `cim`.
pub fn from_native(cim: CimType, native: NativeValue) -> Result<DynamicValue, WbemError> {
    if cim == CimType::Object || matches!(cim, CimType::Empty | CimType::Unsupported(_)) {
        if native.is_null() && cim != CimType::Object {
            return Ok(DynamicValue::Invalid);
        }
        return Err(WbemError::UnsupportedConversion {
            cim,
            direction: Direction::FromNative,
        });
    }
    if native.is_null() {
        return Ok(DynamicValue::Invalid);
    }

    let value = match cim.tag() {
        TypeTag::SignedInt => {
            let v = read_integer(cim, &native)?;
            DynamicValue::SignedInt(fit::<i64>(cim, v).and_then(|v| check_bounds(cim, v))?)
        }
        TypeTag::UnsignedInt => {
            let v = read_integer(cim, &native)?;
            DynamicValue::UnsignedInt(fit::<u64>(cim, v).and_then(|v| check_bounds(cim, v))?)
        }
        TypeTag::Real => match native {
            NativeValue::R8(v) if cim == CimType::Real64 => DynamicValue::Real(v),
            NativeValue::R4(v) => DynamicValue::Real(f64::from(v)),
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::Boolean => match native {
            NativeValue::Bool(b) => DynamicValue::Boolean(b),
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::String => match native {
            NativeValue::Bstr(w) => DynamicValue::String(w.to_string_lossy()),
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::DateTime => match native {
            NativeValue::Bstr(w) => match CimDateTime::parse(&w.to_string_lossy()) {
                Some(dt) => DynamicValue::DateTime(dt),
                None => {
                    return Err(WbemError::UnsupportedConversion {
                        cim,
                        direction: Direction::FromNative,
                    })
                }
            },
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::Char16 => match native {
            NativeValue::I2(v) => DynamicValue::Char16(v as u16),
            NativeValue::UI2(v) => DynamicValue::Char16(v),
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::ByteArray => match native {
            NativeValue::ByteArray(bytes) => DynamicValue::ByteArray(bytes),
            other => return Err(mismatch(cim, other.kind())),
        },
        TypeTag::ObjectReference | TypeTag::Invalid => {
            return Err(WbemError::UnsupportedConversion {
                cim,
                direction: Direction::FromNative,
            })
        }
    };
    Ok(value)
}

fn read_integer(cim: CimType, native: &NativeValue) -> Result<i128, WbemError> {
    let v = match native {
        // uint32 comes back in the signed 32-bit slot; reinterpret the bits.
        NativeValue::I4(v) if cim == CimType::UInt32 => i128::from(*v as u32),
        NativeValue::I1(v) => i128::from(*v),
        NativeValue::I2(v) => i128::from(*v),
        NativeValue::I4(v) => i128::from(*v),
        NativeValue::I8(v) => i128::from(*v),
        NativeValue::UI1(v) => i128::from(*v),
        NativeValue::UI2(v) => i128::from(*v),
        NativeValue::UI4(v) => i128::from(*v),
        NativeValue::UI8(v) => i128::from(*v),
        NativeValue::Bstr(w) => {
            let text = w.to_string_lossy();
            text.trim()
                .parse::<i128>()
                .map_err(|_| mismatch(cim, "bstr"))?
        }
        other => return Err(mismatch(cim, other.kind())),
    };
    Ok(v)
}

/// Range-check a widened read against the declared width.
fn check_bounds<T: Into<i128> + Copy>(cim: CimType, v: T) -> Result<T, WbemError> {
    let (min, max): (i128, i128) = match cim {
        CimType::SInt8 => (i8::MIN.into(), i8::MAX.into()),
        CimType::SInt16 => (i16::MIN.into(), i16::MAX.into()),
        CimType::SInt32 => (i32::MIN.into(), i32::MAX.into()),
        CimType::SInt64 => (i64::MIN.into(), i64::MAX.into()),
        CimType::UInt8 => (0, u8::MAX.into()),
        CimType::UInt16 => (0, u16::MAX.into()),
        CimType::UInt32 => (0, u32::MAX.into()),
        _ => (0, u64::MAX.into()),
    };
    let wide: i128 = v.into();
    if wide < min || wide > max {
        return Err(WbemError::OutOfRange {
            cim,
            value: wide.to_string(),
        });
    }
    Ok(v)
}

fn mismatch(cim: CimType, actual: &str) -> WbemError {
    WbemError::TypeMismatch {
        name: "value".to_owned(),
        expected: cim.to_string(),
        actual: actual.to_owned(),
    }
}

/// Attach the property or parameter name to a marshalling error.
pub fn named(err: WbemError, name: &str) -> WbemError {
    match err {
        WbemError::TypeMismatch {
            expected, actual, ..
        } => WbemError::TypeMismatch {
            name: name.to_owned(),
            expected,
            actual,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::WideString;

    #[test]
    fn test_uint16_uses_its_own_slot() {
        let native = to_native(CimType::UInt16, &DynamicValue::UnsignedInt(65535)).unwrap();
        assert!(matches!(native, NativeValue::UI2(65535)));
        let back = from_native(CimType::UInt16, native).unwrap();
        assert_eq!(back, DynamicValue::UnsignedInt(65535));
    }

    #[test]
    fn test_integer_writes_are_range_checked() {
        let err = to_native(CimType::UInt8, &DynamicValue::UnsignedInt(256)).unwrap_err();
        assert!(matches!(err, WbemError::OutOfRange { .. }));
        let err = to_native(CimType::UInt32, &DynamicValue::SignedInt(-1)).unwrap_err();
        assert!(matches!(err, WbemError::OutOfRange { .. }));
        let native = to_native(CimType::UInt32, &DynamicValue::SignedInt(7)).unwrap();
        assert!(matches!(native, NativeValue::UI4(7)));
    }

    #[test]
    fn test_uint32_read_from_signed_slot() {
        let v = from_native(CimType::UInt32, NativeValue::I4(-1)).unwrap();
        assert_eq!(v, DynamicValue::UnsignedInt(u64::from(u32::MAX)));
    }

    #[test]
    fn test_widened_read_is_bounds_checked() {
        let err = from_native(CimType::UInt8, NativeValue::I4(300)).unwrap_err();
        assert!(matches!(err, WbemError::OutOfRange { .. }));
        let v = from_native(CimType::SInt8, NativeValue::I2(-128)).unwrap();
        assert_eq!(v, DynamicValue::SignedInt(-128));
    }

    #[test]
    fn test_64_bit_integers_from_strings() {
        let v = from_native(CimType::UInt64, NativeValue::bstr("18446744073709551615")).unwrap();
        assert_eq!(v, DynamicValue::UnsignedInt(u64::MAX));
        let err = from_native(CimType::SInt64, NativeValue::bstr("twelve")).unwrap_err();
        assert!(matches!(err, WbemError::TypeMismatch { .. }));
    }

    #[test]
    fn test_null_reads_as_invalid() {
        assert!(from_native(CimType::String, NativeValue::Null).unwrap().is_invalid());
        assert!(matches!(
            to_native(CimType::UInt32, &DynamicValue::Invalid).unwrap(),
            NativeValue::Null
        ));
    }

    #[test]
    fn test_object_reads_are_unsupported() {
        let err = from_native(CimType::Object, NativeValue::Object(None)).unwrap_err();
        assert!(matches!(
            err,
            WbemError::UnsupportedConversion {
                direction: Direction::FromNative,
                ..
            }
        ));
    }

    #[test]
    fn test_unparsable_datetime_is_unsupported_not_invalid() {
        let err = from_native(CimType::DateTime, NativeValue::bstr("yesterday")).unwrap_err();
        assert!(matches!(err, WbemError::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_declared_type_mismatch() {
        let err = from_native(CimType::Boolean, NativeValue::I4(1)).unwrap_err();
        assert!(matches!(err, WbemError::TypeMismatch { .. }));
        let err = named(
            to_native(CimType::String, &DynamicValue::Boolean(true)).unwrap_err(),
            "Name",
        );
        assert!(err.to_string().contains("Name"));
    }

    #[test]
    fn test_real32_rejects_lossy_narrowing() {
        assert!(to_native(CimType::Real32, &DynamicValue::Real(0.5)).is_ok());
        assert!(to_native(CimType::Real32, &DynamicValue::Real(0.1)).is_err());
    }

    #[test]
    fn test_char16_bits_preserved() {
        let native = to_native(CimType::Char16, &DynamicValue::Char16(0xFFFF)).unwrap();
        assert!(matches!(native, NativeValue::I2(-1)));
        assert_eq!(
            from_native(CimType::Char16, native).unwrap(),
            DynamicValue::Char16(0xFFFF)
        );
    }

    #[test]
    fn test_string_buffer_is_wide() {
        let native = to_native(CimType::String, &DynamicValue::from("Spooler")).unwrap();
        match native {
            NativeValue::Bstr(w) => assert_eq!(w, WideString::from("Spooler")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
