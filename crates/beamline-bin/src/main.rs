//! `beamline`: command line front end of the scan engine.
//!
//! # Usage
//!
//! List the simulated devices:
//! ```bash
//! beamline devices
//! ```
//!
//! Run one scan and stream its readings as JSON lines:
//! ```bash
//! beamline scan line_scan samx -1 1 -k steps=11
//! ```
//!
//! Serve JSON-lines commands from stdin:
//! ```bash
//! echo '{"command":"submit","request":{"scan_type":"acquire"}}' | beamline serve
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod serve;

use anyhow::{bail, Context, Result};
use beamline_core::{
    BusMessage, EngineConfig, EntryState, LocalBus, LogConfig, MessageBus, ScanRequest,
    DEFAULT_QUEUE,
};
use beamline_hardware::HardwareConfig;
use beamline_scan::{ScanCatalogue, ScanServer};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beamline")]
#[command(about = "Scan orchestration engine for beamline experiments", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hardware configuration file (TOML); the simulated beamline if omitted
    #[arg(long, global = true)]
    hardware: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices
    Devices,

    /// List scan types with their argument schemas
    Scans,

    /// Run one scan to its end
    Scan {
        /// Scan type, e.g. line_scan
        scan_type: String,

        /// Positional arguments; numbers are parsed as JSON
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Keyword argument as key=value
        #[arg(short = 'k', long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,

        /// Interpret motor targets relative to the current positions
        #[arg(long)]
        relative: bool,

        /// Target queue
        #[arg(long, default_value = DEFAULT_QUEUE)]
        queue: String,
    },

    /// Accept JSON-lines commands on stdin, echo bus traffic on stdout
    Serve,
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    Ok((key.to_string(), parse_value(value)))
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_server(config: EngineConfig, hardware: Option<&PathBuf>) -> Result<ScanServer> {
    let hardware = match hardware {
        Some(path) => HardwareConfig::from_file(path)?,
        None => HardwareConfig::simulated_beamline(),
    };
    let registry = hardware
        .build_registry()
        .context("failed to build device registry")?;
    info!(devices = registry.len(), "device registry ready");
    let bus = Arc::new(LocalBus::new(config.bus_capacity).with_stream_retention(config.stream_retention));
    Ok(ScanServer::new(Arc::new(registry), bus, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    init_logging(&config.log);

    match cli.command {
        Commands::Devices => {
            let server = build_server(config, cli.hardware.as_ref())?;
            for device in server.engine().registry.list_devices() {
                println!("{}", serde_json::to_string(&device)?);
            }
            Ok(())
        }
        Commands::Scans => {
            for schema in ScanCatalogue::with_builtin().schemas() {
                println!("{}", serde_json::to_string(&schema)?);
            }
            Ok(())
        }
        Commands::Scan {
            scan_type,
            args,
            kwargs,
            relative,
            queue,
        } => {
            let mut request = ScanRequest::new(scan_type)
                .relative(relative)
                .on_queue(queue);
            for arg in &args {
                request = request.arg(parse_value(arg));
            }
            for (key, value) in kwargs {
                request = request.kwarg(key, value);
            }
            let server = build_server(config, cli.hardware.as_ref())?;
            server.start()?;
            let result = run_once(&server, request).await;
            server.shutdown().await;
            result
        }
        Commands::Serve => {
            let server = build_server(config, cli.hardware.as_ref())?;
            server.start()?;
            serve::serve(&server).await
        }
    }
}

/// Submit `request`, print its messages until it ends, abort on Ctrl-C.
async fn run_once(server: &ScanServer, request: ScanRequest) -> Result<()> {
    let mut rx = server.engine().bus.subscribe();
    let rid = server.submit(request)?;
    info!(%rid, "scan submitted");

    let printer = {
        let rid = rid.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) if message.rid() == Some(&rid) => {
                        if let Ok(line) = serde_json::to_string(&message) {
                            println!("{line}");
                        }
                        if let BusMessage::EntryTransition(t) = &message {
                            if t.to.is_terminal() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "output lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let state = tokio::select! {
        state = server.queues().wait_for(&rid) => state?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%rid, "interrupted, aborting scan");
            server.queues().abort(&rid).await?
        }
    };
    let _ = printer.await;

    match state {
        EntryState::Completed => Ok(()),
        other => {
            let error = server
                .queues()
                .entry(&rid)
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or_default();
            bail!("scan {rid} ended {other}: {error}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kwargs_parse_json_values() {
        assert_eq!(parse_kwarg("steps=11").unwrap(), ("steps".into(), json!(11)));
        assert_eq!(
            parse_kwarg("exp_time=0.01").unwrap(),
            ("exp_time".into(), json!(0.01))
        );
        assert_eq!(
            parse_kwarg("label=dark").unwrap(),
            ("label".into(), json!("dark"))
        );
        assert!(parse_kwarg("steps").is_err());
        assert!(parse_kwarg("=3").is_err());
    }

    #[test]
    fn positional_args_keep_device_names() {
        let cli = Cli::try_parse_from([
            "beamline", "scan", "line_scan", "samx", "-1", "1", "-k", "steps=3", "--relative",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan {
                args,
                kwargs,
                relative,
                queue,
                ..
            } => {
                let values: Vec<Value> = args.iter().map(|a| parse_value(a)).collect();
                assert_eq!(values, vec![json!("samx"), json!(-1), json!(1)]);
                assert_eq!(kwargs, vec![("steps".to_string(), json!(3))]);
                assert!(relative);
                assert_eq!(queue, DEFAULT_QUEUE);
            }
            _ => panic!("expected scan"),
        }
    }

    #[tokio::test]
    async fn run_once_reports_failed_scans() {
        let server = build_server(EngineConfig::default(), None).unwrap();
        server.start().unwrap();
        let ok = run_once(&server, ScanRequest::new("acquire").kwarg("num_points", 2)).await;
        assert!(ok.is_ok());

        let out_of_range = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(500.0)
            .kwarg("steps", 3);
        let err = run_once(&server, out_of_range).await.unwrap_err();
        assert!(err.to_string().contains("FAILED"));
        server.shutdown().await;
    }
}
