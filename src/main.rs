use std::fs::OpenOptions;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{error, info, Level};

use voiperf_server::config::ServerConfig;
use voiperf_server::diagnostics::SystemDiagnostics;
use voiperf_server::server::measurement_server::MeasurementServer;

/// VoIP network quality measurement server
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// listen for client connections on this port
    #[arg(short, long, default_value_t = ServerConfig::DEFAULT_PORT)]
    port: u16,

    /// max number of concurrent measurements
    #[arg(short, long, value_name = "N", default_value_t = 3)]
    max_measurements: usize,

    /// directory where the results are stored
    #[arg(short, long, value_name = "DIR", default_value = "results")]
    output_dir: PathBuf,

    /// interface to capture the trace packets on
    #[arg(short, long, value_name = "INTERFACE", default_value = "eth0")]
    iface: String,

    /// directory containing the traces that are sent to clients
    #[arg(short, long, value_name = "DIR", default_value = "traces")]
    traces_dir: PathBuf,

    /// log to this file instead of stderr
    #[arg(short, long, value_name = "FILENAME")]
    log_file: Option<PathBuf>,

    /// debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level);

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            subscriber
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .ok();
        }
        None => {
            subscriber
                .try_init()
                .ok();
        }
    }
    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if !is_root() {
        eprintln!("must be run as root");
        return ExitCode::from(1);
    }
    if let Err(e) = init_logging(&args) {
        eprintln!("failed to open log file: {}", e);
        return ExitCode::from(1);
    }
    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)));
    config.max_measurements = args.max_measurements;
    config.output_dir = args.output_dir;
    config.traces_dir = args.traces_dir;
    config.capture_interface = args.iface;
    let config = Arc::new(config);

    let diagnostics = Arc::new(SystemDiagnostics::new(config.capture_interface.clone()));
    let server = MeasurementServer::new(config, diagnostics).await?;
    server.serve().await
}
