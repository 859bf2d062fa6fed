//! JSON-RPC IPC worker for subsystem-isolated operations.
//!
//! Reads line-delimited JSON requests from stdin, dispatches them against
//! one connection held for the life of the process, and writes JSON
//! responses to stdout.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use serde::{Deserialize, Serialize};

use wbem_cli::{init_logging, BindingArgs, Worker};

#[derive(Parser)]
#[command(name = "wbem-worker", about = "WBEM binding IPC worker process")]
struct Args {
    #[command(flatten)]
    binding: BindingArgs,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize)]
struct Request {
    id: u64,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Serialize)]
struct Response {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn write_response(stdout: &mut impl Write, resp: &Response) {
    match serde_json::to_string(resp) {
        Ok(json) => {
            let _ = writeln!(stdout, "{json}");
        }
        Err(_) => {
            let _ = writeln!(
                stdout,
                r#"{{"id":{},"error":"response serialization failed"}}"#,
                resp.id
            );
        }
    }
    let _ = stdout.flush();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let provider = match args.binding.provider() {
        Ok(p) => p,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut worker = Worker::new(provider, args.binding.binding());
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    info!("wbem-worker: ready");

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!("stdin read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                // id unknown
                write_response(
                    &mut stdout,
                    &Response {
                        id: 0,
                        result: None,
                        error: Some(format!("invalid JSON: {e}")),
                    },
                );
                continue;
            }
        };

        let resp = match worker.dispatch(&req.method, &req.params) {
            Ok(result) => Response {
                id: req.id,
                result: Some(result),
                error: None,
            },
            Err(error) => Response {
                id: req.id,
                result: None,
                error: Some(error),
            },
        };
        write_response(&mut stdout, &resp);
    }
    ExitCode::SUCCESS
}
