//! Connect N RC QP pairs between two clients on one device, then halt.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use rdma_stress::verbs::VerbsProvider;
use rdma_stress::{connected_count, init_logging, StressConfig, StressFixture};

#[derive(Parser, Debug)]
#[command(name = "rdma-stress-smoke")]
#[command(about = "RC QP pairing and async event drain smoke test")]
struct Cli {
    /// TOML config file; defaults are used when omitted
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// RDMA device name (overrides the config file)
    #[arg(long)]
    device: Option<String>,

    /// RDMA port number (overrides the config file)
    #[arg(long)]
    port: Option<u8>,

    /// QP pairs to create between the two clients
    #[arg(short = 'n', long, default_value = "16")]
    qps: u32,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(cli: Cli) -> rdma_stress::Result<bool> {
    let config = match &cli.config {
        Some(path) => StressConfig::load(path)?,
        None => StressConfig::default(),
    }
    .with_overrides(cli.device, cli.port)?;

    let fixture = StressFixture::try_with_latency(&VerbsProvider, config, rdma_stress::NoLatency)?;
    info!(port = %fixture.port_gid(), "device ready");

    let mut initiator = fixture.new_client(0);
    let mut target = fixture.new_client(1);
    let outcomes = fixture.create_and_connect_n(&mut initiator, &mut target, cli.qps)?;
    let connected = connected_count(&outcomes);
    fixture.dump_state(&initiator);

    let report = fixture.halt(&initiator);
    info!(
        connected,
        requested = cli.qps,
        faults = report.faults.len(),
        drained = report.is_drained(),
        "smoke run finished"
    );
    Ok(connected == cli.qps as usize && report.faults.is_empty())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
