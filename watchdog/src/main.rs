use clap::Parser;
use log::{error, info, LevelFilter};
use watchdog::config::{Args, WatchdogConfig};
use watchdog::network::Watchdog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match WatchdogConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    info!("Starting civpb-watchdog...");
    Watchdog::new(config).run().await.map_err(|e| {
        error!("Watchdog failed: {}", e);
        e
    })
}

/// Verbosity flags set the base level, `RUST_LOG` still overrides it
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
