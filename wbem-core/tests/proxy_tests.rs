//! Integration tests for schema discovery and the dynamic object proxy.
//!
//! Everything runs against the in-memory repository in
//! `tests/fixtures/cimv2.json`.

mod common;

use common::{connect, provider, CHOOSER, POSTGRES, SPOOLER};
use wbem_core::errors::{WbemError, WBEM_E_ACCESS_DENIED};
use wbem_core::memory::Operation;
use wbem_core::proxy::ObjectProxy;
use wbem_core::value::{CimType, DynamicValue, TypeTag};

#[test]
fn test_schema_lists_every_declared_property() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    assert_eq!(spooler.class_name(), "Win32_Service");
    let names: Vec<&str> = spooler.schema().properties.keys().map(String::as_str).collect();
    assert!(names.contains(&"State"));
    assert!(names.contains(&"ProcessId"));
    assert!(!names.iter().any(|n| n.starts_with("__")));
    assert_eq!(spooler.schema().properties["ProcessId"].tag, TypeTag::UnsignedInt);
}

#[test]
fn test_schema_is_stable_across_binds() {
    let p = provider();
    let conn = connect(&p);
    let first = ObjectProxy::from_path(&conn, SPOOLER).unwrap();
    let second = ObjectProxy::from_path(&conn, POSTGRES).unwrap();
    assert_eq!(first.schema(), second.schema());
    assert_eq!(
        first.schema().signatures(),
        vec![
            "PauseService()".to_owned(),
            "ResumeService()".to_owned(),
            "StartService()".to_owned(),
            "StopService()".to_owned(),
        ]
    );
}

#[test]
fn test_method_signatures_follow_parameter_ids() {
    let p = provider();
    let conn = connect(&p);
    let class = ObjectProxy::class(&conn, "process").unwrap();
    assert!(class.has_method("Create(string,string,object,uint&)"));
    assert!(class.has_method("Terminate( uint )"));
    assert!(class.has_method("AttachDebugger()"));

    let create = class.method("Create(string,string,object,uint&)").unwrap();
    let inputs: Vec<&str> = create.inputs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(inputs, ["CommandLine", "CurrentDirectory", "ProcessStartupInformation"]);
    // ReturnValue is not an output parameter
    assert_eq!(create.outputs.len(), 1);
    assert_eq!(create.outputs[0].cim, CimType::UInt32);
}

#[test]
fn test_unknown_names_never_reach_the_subsystem() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    assert!(matches!(spooler.get("Colour"), Err(WbemError::PropertyNotFound(_))));
    assert!(matches!(
        spooler.set("Colour", DynamicValue::from("red")),
        Err(WbemError::PropertyNotFound(_))
    ));
    assert!(matches!(
        spooler.invoke("Explode()", &[]),
        Err(WbemError::MethodNotFound(_))
    ));
    // right name, wrong shape
    assert!(matches!(
        spooler.invoke("StopService(uint)", &[DynamicValue::from(1u32)]),
        Err(WbemError::MethodNotFound(_))
    ));
    assert!(p.calls().is_empty());
}

#[test]
fn test_argument_count_is_checked() {
    let p = provider();
    let conn = connect(&p);
    let chooser = ObjectProxy::from_path(&conn, CHOOSER).unwrap();
    let err = chooser.invoke("Terminate(uint)", &[]).unwrap_err();
    assert!(matches!(
        err,
        WbemError::ArgumentCount {
            expected: 1,
            actual: 0,
            ..
        }
    ));
    assert!(p.calls().is_empty());
}

#[test]
fn test_get_reads_typed_values() {
    let p = provider();
    let conn = connect(&p);
    let chooser = ObjectProxy::from_path(&conn, CHOOSER).unwrap();

    assert_eq!(chooser.get("ProcessId").unwrap(), DynamicValue::UnsignedInt(1312));
    assert_eq!(chooser.get("name").unwrap(), DynamicValue::from("qt_chooser.exe"));
    assert_eq!(
        chooser.get("WorkingSetSize").unwrap(),
        DynamicValue::UnsignedInt(5_368_709_120)
    );
    let created = chooser.get("CreationDate").unwrap();
    assert_eq!(created.tag(), TypeTag::DateTime);
    assert_eq!(created.as_str(), Some("20240105123000.000000+060"));
    assert!(chooser.get("CommandLine").unwrap().as_str().is_some());
    // unset property reads as Invalid
    let system = ObjectProxy::from_path(&conn, r#"Win32_Process.Handle="4""#).unwrap();
    assert!(system.get("CommandLine").unwrap().is_invalid());
}

#[test]
fn test_set_is_local_until_commit() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    spooler.set("Description", DynamicValue::from("patched")).unwrap();
    assert_eq!(spooler.get("Description").unwrap(), DynamicValue::from("patched"));
    assert_ne!(
        p.instance_property(SPOOLER, "Description"),
        Some(serde_json::json!("patched"))
    );

    spooler.commit().unwrap();
    assert_eq!(
        p.instance_property(SPOOLER, "Description"),
        Some(serde_json::json!("patched"))
    );
}

#[test]
fn test_set_rejects_mismatched_and_out_of_range_values() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    let err = spooler.set("ProcessId", DynamicValue::from("many")).unwrap_err();
    assert!(matches!(err, WbemError::TypeMismatch { ref name, .. } if name == "ProcessId"));
    let err = spooler.set("ProcessId", DynamicValue::SignedInt(-1)).unwrap_err();
    assert!(matches!(err, WbemError::OutOfRange { cim: CimType::UInt32, .. }));
    assert_eq!(spooler.get("ProcessId").unwrap(), DynamicValue::UnsignedInt(2144));
}

#[test]
fn test_invoke_returns_code_and_applies_effects() {
    let p = provider();
    let conn = connect(&p);
    let mut spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    let result = spooler.invoke("StopService()", &[]).unwrap();
    assert!(result.is_success());
    assert!(result.outputs.is_empty());

    // the bound copy is a snapshot until refreshed
    assert_eq!(spooler.get("State").unwrap(), DynamicValue::from("Running"));
    spooler.refresh().unwrap();
    assert_eq!(spooler.get("State").unwrap(), DynamicValue::from("Stopped"));

    let calls = p.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, SPOOLER);
    assert_eq!(calls[0].method, "StopService");
}

#[test]
fn test_invoke_propagates_native_failure() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    p.fail_next(Operation::ExecMethod, WBEM_E_ACCESS_DENIED);
    let err = spooler.invoke("StopService()", &[]).unwrap_err();
    assert_eq!(err.status_code(), Some(WBEM_E_ACCESS_DENIED));
    assert!(!err.is_transient());
    assert_eq!(
        p.instance_property(SPOOLER, "State"),
        Some(serde_json::json!("Running"))
    );
}

const ODD_METHODS: &str = r#"{
  "namespaces": ["ROOT\\CIMV2"],
  "classes": [
    {
      "name": "Win32_Service",
      "properties": [{"name": "Name", "type": "string", "key": true}],
      "methods": [
        {"name": "StartService", "behaviour": {"return_value": 7}},
        {"name": "StopService", "return_type": "real64", "behaviour": {"return_value": 7}},
        {"name": "PauseService", "behaviour": {"no_output": true}},
        {"name": "ResumeService", "behaviour": {"omits_return_value": true}}
      ]
    }
  ],
  "instances": [{"class": "Win32_Service", "properties": {"Name": "Spooler"}}]
}"#;

#[test]
fn test_invoke_never_invents_a_return_code() {
    let p = wbem_core::MemoryProvider::from_fixture_str(ODD_METHODS).unwrap();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();

    let result = spooler.invoke("StartService()", &[]).unwrap();
    assert_eq!(result.return_code, 7);
    assert!(!result.is_success());

    let err = spooler.invoke("StopService()", &[]).unwrap_err();
    assert!(
        matches!(&err, WbemError::TypeMismatch { name, .. } if name == "ReturnValue"),
        "{err}"
    );

    let err = spooler.invoke("PauseService()", &[]).unwrap_err();
    assert!(
        matches!(&err, WbemError::UnexpectedValue { property, .. } if property == "ReturnValue"),
        "{err}"
    );

    let err = spooler.invoke("ResumeService()", &[]).unwrap_err();
    assert!(
        matches!(&err, WbemError::UnexpectedValue { property, .. } if property == "ReturnValue"),
        "{err}"
    );
    assert_eq!(p.calls().len(), 4);
}

#[test]
fn test_refresh_of_removed_instance_is_object_gone() {
    let p = provider();
    let conn = connect(&p);
    let mut chooser = ObjectProxy::from_path(&conn, CHOOSER).unwrap();
    assert!(p.remove_instance(CHOOSER));
    assert!(matches!(chooser.refresh(), Err(WbemError::ObjectGone(_))));
}

#[test]
fn test_spawned_template_has_no_path() {
    let p = provider();
    let conn = connect(&p);
    let startup = ObjectProxy::class(&conn, "processStartup").unwrap();
    let template = startup.spawn_template().unwrap();
    assert_eq!(template.path(), None);
    assert!(template.get("Title").unwrap().is_invalid());
    template.set("Title", DynamicValue::from("demo")).unwrap();
    assert_eq!(template.get("Title").unwrap(), DynamicValue::from("demo"));
}

#[test]
fn test_bind_without_class_identity_needs_a_hint() {
    let p = provider();
    let conn = connect(&p);
    let instance = conn.services().get_object("Win32_Orphan.Id=1").unwrap();

    let err = ObjectProxy::bind(&conn, instance.clone(), None).unwrap_err();
    assert!(matches!(err, WbemError::ClassIdentity));

    let orphan = ObjectProxy::bind(&conn, instance, Some("Win32_Orphan")).unwrap();
    assert_eq!(orphan.get("Label").unwrap(), DynamicValue::from("no class identity"));
    // from_path supplies the hint itself
    assert!(ObjectProxy::from_path(&conn, "Win32_Orphan.Id=1").is_ok());
}

#[test]
fn test_property_snapshot_and_object_text() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();
    let snapshot = spooler.property_snapshot();
    assert_eq!(snapshot["Name"], DynamicValue::from("Spooler"));
    assert_eq!(snapshot["AcceptStop"], DynamicValue::Boolean(true));

    let text = spooler.object_text().unwrap();
    assert!(text.starts_with("instance of Win32_Service"));
    assert!(text.contains("Name = \"Spooler\";"));
}

#[test]
fn test_clone_shares_native_handles() {
    let p = provider();
    let conn = connect(&p);
    let spooler = ObjectProxy::from_path(&conn, SPOOLER).unwrap();
    let copy = spooler.clone();
    copy.set("Description", DynamicValue::from("shared")).unwrap();
    assert_eq!(spooler.get("Description").unwrap(), DynamicValue::from("shared"));
}
