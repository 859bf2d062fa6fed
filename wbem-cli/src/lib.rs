//! Shared plumbing for the `wbem-*` binaries: logging setup, provider
//! selection and the JSON-RPC dispatcher used by `wbem-worker`.

use std::path::PathBuf;

use clap::Args;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use wbem_core::config::BindingConfig;
use wbem_core::connection::{ConnectionHandle, ConnectionManager};
use wbem_core::enumerate::{enumerate_with, EnumerationPolicy};
use wbem_core::process::ProcessProxy;
use wbem_core::proxy::ObjectProxy;
use wbem_core::service::ServiceProxy;
use wbem_core::value::DynamicValue;
use wbem_core::{DefaultProvider, Provider, WbemError};

/// Route `log` records to stderr.  `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Connection options shared by every binary.
#[derive(Args, Debug, Clone, Default)]
pub struct BindingArgs {
    /// Serve from a JSON fixture instead of the live subsystem
    #[arg(long)]
    pub fixture: Option<PathBuf>,

    /// Namespace to connect to
    #[arg(long)]
    pub namespace: Option<String>,

    /// Skip instances that fail to bind instead of stopping
    #[arg(long)]
    pub skip_invalid: bool,
}

impl BindingArgs {
    pub fn provider(&self) -> Result<DefaultProvider, WbemError> {
        DefaultProvider::select(self.fixture.as_deref())
    }

    /// Overlay the flags onto `base`.
    pub fn apply(&self, mut base: BindingConfig) -> BindingConfig {
        if let Some(ns) = &self.namespace {
            base.namespace = ns.clone();
        }
        if self.skip_invalid {
            base.enumeration_policy = EnumerationPolicy::SkipInvalid;
        }
        base
    }

    pub fn binding(&self) -> BindingConfig {
        self.apply(BindingConfig::default())
    }
}

/// JSON view of a bound instance.
pub fn proxy_json(proxy: &ObjectProxy) -> Value {
    let properties: serde_json::Map<String, Value> = proxy
        .property_snapshot()
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect();
    json!({
        "class": proxy.class_name(),
        "path": proxy.path(),
        "properties": properties,
    })
}

/// Convert positional JSON arguments by the method's declared input types.
pub fn method_args(
    proxy: &ObjectProxy,
    signature: &str,
    args: &[Value],
) -> Result<Vec<DynamicValue>, WbemError> {
    let method = proxy
        .method(signature)
        .ok_or_else(|| WbemError::MethodNotFound(signature.to_owned()))?;
    if args.len() != method.inputs.len() {
        return Err(WbemError::ArgumentCount {
            signature: method.signature(),
            expected: method.inputs.len(),
            actual: args.len(),
        });
    }
    method
        .inputs
        .iter()
        .zip(args)
        .map(|(def, arg)| DynamicValue::from_json(def.cim, arg))
        .collect()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ClassParams {
    class: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PropertyParams {
    path: String,
    property: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct InvokeParams {
    path: String,
    #[serde(alias = "method")]
    signature: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct CreateParams {
    command_line: String,
    #[serde(default)]
    current_directory: Option<String>,
}

fn parse<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, String> {
    serde_json::from_value(params.clone()).map_err(|e| format!("invalid params: {e}"))
}

/// Request dispatcher holding one lazily opened connection.
///
/// The connection lives as long as the worker, so every request after the
/// first reuses it.
pub struct Worker<P: Provider> {
    manager: ConnectionManager<P>,
    conn: Option<ConnectionHandle>,
}

impl<P: Provider> Worker<P> {
    pub fn new(provider: P, binding: BindingConfig) -> Self {
        Self {
            manager: ConnectionManager::new(provider, binding),
            conn: None,
        }
    }

    fn connection(&mut self) -> Result<ConnectionHandle, WbemError> {
        if let Some(conn) = &self.conn {
            return Ok(ConnectionHandle::clone(conn));
        }
        let conn = self.manager.acquire()?;
        self.conn = Some(ConnectionHandle::clone(&conn));
        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_open()
    }

    pub fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, String> {
        debug!("dispatch {method}");
        if method == "ping" {
            return Ok(Value::String("pong".to_owned()));
        }
        let conn = self.connection().map_err(|e| e.to_string())?;
        self.call(&conn, method, params)
    }

    fn call(&self, conn: &ConnectionHandle, method: &str, params: &Value) -> Result<Value, String> {
        let err = |e: WbemError| e.to_string();
        match method {
            "enumerate" => {
                let p: ClassParams = parse(params)?;
                let policy = conn.config().enumeration_policy;
                let instances = enumerate_with(conn, &p.class, policy).map_err(err)?;
                let mut out = Vec::new();
                for proxy in instances.take(p.limit.unwrap_or(usize::MAX)) {
                    out.push(proxy_json(&proxy.map_err(err)?));
                }
                Ok(Value::Array(out))
            }
            "schema" => {
                let p: ClassParams = parse(params)?;
                let class = ObjectProxy::class(conn, &p.class).map_err(err)?;
                serde_json::to_value(class.schema()).map_err(|e| e.to_string())
            }
            "get" => {
                let p: PropertyParams = parse(params)?;
                let proxy = ObjectProxy::from_path(conn, &p.path).map_err(err)?;
                Ok(proxy.get(&p.property).map_err(err)?.to_json())
            }
            "set" => {
                // A worker-side proxy does not outlive the request, so the
                // write is committed straight away.
                let p: PropertyParams = parse(params)?;
                let proxy = ObjectProxy::from_path(conn, &p.path).map_err(err)?;
                let def = proxy
                    .schema()
                    .property(&p.property)
                    .ok_or_else(|| err(WbemError::PropertyNotFound(p.property.clone())))?;
                let value = DynamicValue::from_json(def.cim, &p.value).map_err(err)?;
                proxy.set(&p.property, value).map_err(err)?;
                proxy.commit().map_err(err)?;
                Ok(Value::Null)
            }
            "invoke" => {
                let p: InvokeParams = parse(params)?;
                let proxy = ObjectProxy::from_path(conn, &p.path).map_err(err)?;
                let args = method_args(&proxy, &p.signature, &p.args).map_err(err)?;
                let result = proxy.invoke(&p.signature, &args).map_err(err)?;
                Ok(json!({
                    "return_code": result.return_code,
                    "outputs": result.outputs.iter().map(DynamicValue::to_json).collect::<Vec<_>>(),
                }))
            }
            "service_state" => {
                let p: NameParams = parse(params)?;
                match ServiceProxy::find(conn, &p.name).map_err(err)? {
                    Some(mut service) => Ok(Value::String(
                        service.state().map_err(err)?.as_str().to_owned(),
                    )),
                    None => Ok(Value::Null),
                }
            }
            "create_process" => {
                let p: CreateParams = parse(params)?;
                let pid = ProcessProxy::create(
                    conn,
                    &p.command_line,
                    p.current_directory.as_deref(),
                    None,
                )
                .map_err(err)?;
                Ok(Value::from(pid))
            }
            _ => Err(format!("unknown method: {method}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wbem_core::MemoryProvider;

    fn worker() -> Worker<MemoryProvider> {
        let provider =
            MemoryProvider::from_fixture_str(include_str!("../demos/cimv2.json")).unwrap();
        Worker::new(provider, BindingConfig::default())
    }

    #[test]
    fn test_ping_does_not_connect() {
        let mut w = worker();
        assert_eq!(w.dispatch("ping", &Value::Null).unwrap(), json!("pong"));
        assert!(!w.is_connected());
    }

    #[test]
    fn test_enumerate_with_limit() {
        let mut w = worker();
        let out = w
            .dispatch("enumerate", &json!({"class": "service", "limit": 1}))
            .unwrap();
        let items = out.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["class"], "Win32_Service");
        assert!(w.is_connected());
    }

    #[test]
    fn test_set_commits_and_get_reads_back() {
        let mut w = worker();
        let path = r#"Win32_Service.Name="Spooler""#;
        w.dispatch(
            "set",
            &json!({"path": path, "property": "Description", "value": "patched"}),
        )
        .unwrap();
        let got = w
            .dispatch("get", &json!({"path": path, "property": "description"}))
            .unwrap();
        assert_eq!(got, json!("patched"));
    }

    #[test]
    fn test_invoke_converts_arguments() {
        let mut w = worker();
        let out = w
            .dispatch(
                "invoke",
                &json!({
                    "path": r#"Win32_Process.Handle="1312""#,
                    "signature": "Terminate(uint)",
                    "args": [0],
                }),
            )
            .unwrap();
        assert_eq!(out["return_code"], 0);
        let err = w
            .dispatch(
                "invoke",
                &json!({
                    "path": r#"Win32_Process.Handle="4""#,
                    "method": "Terminate(uint)",
                    "args": ["soon"],
                }),
            )
            .unwrap_err();
        assert!(err.starts_with("MarshalError"), "{err}");
    }

    #[test]
    fn test_service_state_and_missing_service() {
        let mut w = worker();
        assert_eq!(
            w.dispatch("service_state", &json!({"name": "spooler"})).unwrap(),
            json!("Running")
        );
        assert_eq!(
            w.dispatch("service_state", &json!({"name": "nope"})).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_schema_and_unknown_method() {
        let mut w = worker();
        let schema = w.dispatch("schema", &json!({"class": "process"})).unwrap();
        assert_eq!(schema["class_name"], "Win32_Process");
        assert!(schema["methods"].get("Terminate").is_some());
        assert!(w.dispatch("reboot", &Value::Null).unwrap_err().contains("unknown"));
        assert!(w.dispatch("get", &json!({})).unwrap_err().contains("invalid params"));
    }

    #[test]
    fn test_binding_args_overlay() {
        let args = BindingArgs {
            fixture: None,
            namespace: Some("ROOT\\Other".to_owned()),
            skip_invalid: true,
        };
        let binding = args.binding();
        assert_eq!(binding.namespace, "ROOT\\Other");
        assert_eq!(binding.enumeration_policy, EnumerationPolicy::SkipInvalid);
    }
}
