//! Property tests for the marshaller: every in-range value survives the
//! trip to the native slot and back, and out-of-range values are refused.

mod common;

use proptest::prelude::*;
use wbem_core::errors::WbemError;
use wbem_core::marshal::{from_native, to_native};
use wbem_core::proxy::ObjectProxy;
use wbem_core::value::{CimType, DynamicValue};

fn through_native(cim: CimType, value: &DynamicValue) -> Result<DynamicValue, WbemError> {
    from_native(cim, to_native(cim, value)?)
}

fn signed_bounds() -> impl Strategy<Value = (CimType, i64)> {
    prop_oneof![
        any::<i8>().prop_map(|v| (CimType::SInt8, i64::from(v))),
        any::<i16>().prop_map(|v| (CimType::SInt16, i64::from(v))),
        any::<i32>().prop_map(|v| (CimType::SInt32, i64::from(v))),
        any::<i64>().prop_map(|v| (CimType::SInt64, v)),
    ]
}

fn unsigned_bounds() -> impl Strategy<Value = (CimType, u64)> {
    prop_oneof![
        any::<u8>().prop_map(|v| (CimType::UInt8, u64::from(v))),
        any::<u16>().prop_map(|v| (CimType::UInt16, u64::from(v))),
        any::<u32>().prop_map(|v| (CimType::UInt32, u64::from(v))),
        any::<u64>().prop_map(|v| (CimType::UInt64, v)),
    ]
}

proptest! {
    #[test]
    fn prop_signed_integers_survive((cim, v) in signed_bounds()) {
        let value = DynamicValue::SignedInt(v);
        prop_assert_eq!(through_native(cim, &value).unwrap(), value);
    }

    #[test]
    fn prop_unsigned_integers_survive((cim, v) in unsigned_bounds()) {
        let value = DynamicValue::UnsignedInt(v);
        prop_assert_eq!(through_native(cim, &value).unwrap(), value);
    }

    #[test]
    fn prop_uint32_wider_values_are_refused(v in (u64::from(u32::MAX) + 1)..u64::MAX) {
        let err = to_native(CimType::UInt32, &DynamicValue::UnsignedInt(v)).unwrap_err();
        let is_out_of_range = matches!(err, WbemError::OutOfRange { cim: CimType::UInt32, .. });
        prop_assert!(is_out_of_range);
    }

    #[test]
    fn prop_negative_values_never_fit_unsigned(v in i64::MIN..0i64) {
        for cim in [CimType::UInt8, CimType::UInt16, CimType::UInt32, CimType::UInt64] {
            prop_assert!(to_native(cim, &DynamicValue::SignedInt(v)).is_err());
        }
    }

    #[test]
    fn prop_strings_survive(s in ".*") {
        let value = DynamicValue::String(s);
        prop_assert_eq!(through_native(CimType::String, &value).unwrap(), value);
    }

    #[test]
    fn prop_reals_survive(v in any::<f64>()) {
        let value = DynamicValue::Real(v);
        prop_assert_eq!(through_native(CimType::Real64, &value).unwrap(), value);
    }

    #[test]
    fn prop_char16_survives(unit in any::<u16>()) {
        let value = DynamicValue::Char16(unit);
        prop_assert_eq!(through_native(CimType::Char16, &value).unwrap(), value);
    }

    #[test]
    fn prop_set_then_get_through_proxy(pid in any::<u32>()) {
        let p = common::provider();
        let conn = common::connect(&p);
        let spooler = ObjectProxy::from_path(&conn, common::SPOOLER).unwrap();
        spooler.set("ProcessId", DynamicValue::from(pid)).unwrap();
        prop_assert_eq!(spooler.get("ProcessId").unwrap(), DynamicValue::UnsignedInt(u64::from(pid)));
    }
}

#[test]
fn test_null_reads_as_invalid_for_every_scalar() {
    for cim in [
        CimType::SInt32,
        CimType::UInt64,
        CimType::Real32,
        CimType::Boolean,
        CimType::String,
        CimType::DateTime,
    ] {
        assert!(through_native(cim, &DynamicValue::Invalid).unwrap().is_invalid());
    }
}

#[test]
fn test_object_values_are_write_only() {
    let native = to_native(CimType::Object, &DynamicValue::ObjectReference(None)).unwrap();
    assert!(matches!(
        from_native(CimType::Object, native),
        Err(WbemError::UnsupportedConversion { .. })
    ));
}
