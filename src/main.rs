use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::io;
use std::path::PathBuf;
use std::process;

use tinyvmm::{run_vm, GuestLayout, VmmConfig};


#[derive(Parser, Debug)]
#[command(name = "tinyvmm", version, about = "Boot a flat 64-bit payload under KVM")]
struct Args {
    /// Flat binary loaded at the start of the code region
    #[arg(required_unless_present = "print_layout")]
    payload: Option<PathBuf>,

    /// JSON guest layout to use instead of the built-in one
    #[arg(long, value_name = "FILE")]
    layout: Option<PathBuf>,

    /// Print the effective layout as JSON and exit
    #[arg(long)]
    print_layout: bool,

    /// Fail if the guest has not halted after N exits
    #[arg(long, value_name = "N")]
    exit_limit: Option<u64>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}


fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}


fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}


fn run(args: Args) -> Result<()> {
    let layout = match &args.layout {
        Some(path) => GuestLayout::from_json_file(path)
            .with_context(|| format!("loading layout {}", path.display()))?,
        None => GuestLayout::default(),
    };

    if args.print_layout {
        println!("{}", layout.to_json_pretty()?);
        return Ok(());
    }

    let payload_path = args.payload.context("no payload given")?;
    let payload = std::fs::read(&payload_path)
        .with_context(|| format!("reading payload {}", payload_path.display()))?;
    info!("payload {} ({} bytes)", payload_path.display(), payload.len());

    let config = VmmConfig { exit_limit: args.exit_limit, ..VmmConfig::with_layout(layout) };
    let report = run_vm(&config, &payload, io::stdout(), io::stderr()).context("running guest")?;
    info!(
        "{} resumes, {} I/O exits, {} bytes to stdout, {} bytes to diag",
        report.resumes, report.io_exits, report.stdout_bytes, report.diag_bytes
    );
    Ok(())
}
