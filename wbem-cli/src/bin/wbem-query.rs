//! Standalone CLI tool for dumping instances (or a class schema) as JSON.

use std::process::ExitCode;

use clap::Parser;
use log::{error, warn};
use serde_json::Value;

use wbem_cli::{init_logging, proxy_json, BindingArgs};
use wbem_core::connection::Connection;
use wbem_core::enumerate::enumerate;
use wbem_core::proxy::ObjectProxy;
use wbem_core::WbemError;

#[derive(Parser)]
#[command(name = "wbem-query", about = "Enumerate management instances as JSON")]
struct Args {
    /// Logical entity name, e.g. `service` or `process`
    entity: String,

    /// Only print these properties
    #[arg(short, long)]
    property: Vec<String>,

    /// Stop after this many instances
    #[arg(long)]
    limit: Option<usize>,

    /// Print the discovered schema instead of instances
    #[arg(long)]
    schema: bool,

    /// Compact JSON output (no pretty-printing)
    #[arg(long)]
    compact: bool,

    #[command(flatten)]
    binding: BindingArgs,

    #[arg(short, long)]
    verbose: bool,
}

fn select(mut item: Value, properties: &[String]) -> Value {
    if properties.is_empty() {
        return item;
    }
    if let Some(Value::Object(all)) = item.get_mut("properties") {
        all.retain(|name, _| properties.iter().any(|p| p.eq_ignore_ascii_case(name)));
    }
    item
}

fn run(args: &Args) -> Result<Value, WbemError> {
    let provider = args.binding.provider()?;
    let conn = std::rc::Rc::new(Connection::open(&provider, &args.binding.binding())?);

    if args.schema {
        let class = ObjectProxy::class(&conn, &args.entity)?;
        return serde_json::to_value(class.schema())
            .map_err(|e| WbemError::Config(format!("schema serialization: {e}")));
    }

    let mut instances = enumerate(&conn, &args.entity)?;
    let mut out = Vec::new();
    for proxy in instances.by_ref().take(args.limit.unwrap_or(usize::MAX)) {
        out.push(select(proxy_json(&proxy?), &args.property));
    }
    if instances.skipped() > 0 {
        warn!("{} instance(s) skipped", instances.skipped());
    }
    Ok(Value::Array(out))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let value = match run(&args) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let json = if args.compact {
        serde_json::to_string(&value)
    } else {
        serde_json::to_string_pretty(&value)
    };
    match json {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("JSON serialization failed: {e}");
            ExitCode::FAILURE
        }
    }
}
