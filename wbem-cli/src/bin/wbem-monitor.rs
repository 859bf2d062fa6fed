//! Watch services and processes, printing one JSON event per line.
//!
//! Commands are read from stdin, one per line: `kill <pid>`,
//! `debug <pid>`, `toggle <service>`.  EOF (or `quit`) stops the monitors
//! unless `--duration-secs` is given.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};

use wbem_cli::{init_logging, BindingArgs};
use wbem_core::config::MonitorConfig;
use wbem_core::monitor::{MonitorCommand, MonitorEvent, ProcessMonitor, ServiceMonitor};
use wbem_core::WbemError;

#[derive(Parser)]
#[command(name = "wbem-monitor", about = "Poll services and processes, emit JSON events")]
struct Args {
    /// TOML monitor configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run for this many seconds, then stop
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Override the poll interval
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Do not start the service monitor
    #[arg(long)]
    no_services: bool,

    /// Do not start the process monitor
    #[arg(long)]
    no_processes: bool,

    #[command(flatten)]
    binding: BindingArgs,

    #[arg(short, long)]
    verbose: bool,
}

enum Input {
    Command(MonitorCommand),
    Quit,
}

fn spawn_stdin_reader(tx: mpsc::Sender<Input>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("quit") {
                let _ = tx.send(Input::Quit);
                return;
            }
            match line.parse::<MonitorCommand>() {
                Ok(command) => {
                    if tx.send(Input::Command(command)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
    });
}

fn spawn_printer(rx: mpsc::Receiver<MonitorEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stdout = io::stdout();
        for event in rx {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    let _ = writeln!(stdout, "{json}");
                    let _ = stdout.flush();
                }
                Err(e) => error!("event serialization failed: {e}"),
            }
        }
    })
}

fn run(args: Args) -> Result<(), WbemError> {
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    config.binding = args.binding.apply(config.binding);
    if let Some(ms) = args.poll_ms {
        config.poll_interval_ms = ms;
    }
    config.validate()?;
    let provider = args.binding.provider()?;

    let (events_tx, events_rx) = mpsc::channel();
    let printer = spawn_printer(events_rx);

    let services = if args.no_services || config.services.is_empty() {
        None
    } else {
        Some(ServiceMonitor::spawn(provider.clone(), config.clone(), events_tx.clone())?)
    };
    let processes = if args.no_processes {
        None
    } else {
        Some(ProcessMonitor::spawn(provider, config.clone(), events_tx.clone())?)
    };
    drop(events_tx);
    info!(
        "monitoring: services={} processes={}",
        services.is_some(),
        processes.is_some()
    );

    let (input_tx, input_rx) = mpsc::channel();
    spawn_stdin_reader(input_tx);
    let deadline = args.duration_secs.map(|s| Instant::now() + Duration::from_secs(s));
    let tick = (config.stall_after() / 2).max(Duration::from_millis(50));
    let mut stdin_open = true;

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if !stdin_open && deadline.is_none() {
            break;
        }
        let input = if stdin_open {
            input_rx.recv_timeout(tick)
        } else {
            thread::sleep(tick);
            Err(RecvTimeoutError::Timeout)
        };
        match input {
            Ok(Input::Quit) => break,
            Ok(Input::Command(command)) => {
                let sent = match &command {
                    MonitorCommand::Terminate(pid) => {
                        processes.as_ref().is_some_and(|m| m.terminate(*pid))
                    }
                    MonitorCommand::AttachDebugger(pid) => {
                        processes.as_ref().is_some_and(|m| m.attach_debugger(*pid))
                    }
                    MonitorCommand::Toggle(name) => {
                        services.as_ref().is_some_and(|m| m.toggle(name))
                    }
                    MonitorCommand::Wake => true,
                };
                if !sent {
                    warn!("{command}: no running monitor to handle it");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stdin_open = false,
        }

        let handles = services
            .iter()
            .map(ServiceMonitor::handle)
            .chain(processes.iter().map(ProcessMonitor::handle));
        for handle in handles {
            if handle.is_stalled(config.stall_after()) {
                warn!(
                    "{} monitor stalled for {:?}",
                    handle.name(),
                    handle.since_heartbeat()
                );
            }
        }
    }

    if let Some(m) = services {
        m.stop();
    }
    if let Some(m) = processes {
        m.stop();
    }
    let _ = printer.join();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
