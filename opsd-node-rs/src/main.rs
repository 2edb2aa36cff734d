//! opsd - drive the ops switches of a miner fleet from local control topics
//!
//! # Usage
//!
//! ```bash
//! # Two control topics, miners listed in a file
//! opsd /ops/fan@0x1 /ops/led@0x2 miners.txt
//!
//! # Bit 2 driven (off) from the start, remote control broker, fast refresh
//! opsd -b 10.0.0.1 -r 60 /ops/override@-0x4 miner-1 miner-2
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use opsd_core::transport::MqttConnector;
use opsd_core::{Daemon, DaemonConfig};
use tracing::{error, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

/// Interface local daemons with the ops switches of miners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local MQTT broker
    #[arg(short, long, default_value = "localhost")]
    broker: String,

    /// Show messages (implies -v)
    #[arg(short, long)]
    debug: bool,

    /// Do not retain messages sent to ops-set
    #[arg(short, long)]
    no_retain: bool,

    /// Refresh interval (seconds)
    #[arg(short, long, default_value = "600")]
    refresh: f64,

    /// Show progress
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error), overrides -d/-v
    #[arg(long)]
    log_level: Option<String>,

    /// Topics (topic@mask), hosts, or files listing hosts
    items: Vec<String>,
}

impl Args {
    fn level(&self) -> Level {
        match self.log_level.as_deref() {
            Some("trace") => Level::TRACE,
            Some("debug") => Level::DEBUG,
            Some("info") => Level::INFO,
            Some("warn") => Level::WARN,
            Some("error") => Level::ERROR,
            _ if self.debug => Level::DEBUG,
            _ if self.verbose => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// `--log-level` wins outright; otherwise `RUST_LOG`, falling back to the flags
    fn filter(&self) -> EnvFilter {
        let default = LevelFilter::from_level(self.level());
        if self.log_level.is_some() {
            EnvFilter::default().add_directive(default.into())
        } else {
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let logger = fmt()
        .with_env_filter(args.filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(e) = logger {
        eprintln!("opsd: cannot install logger: {}", e);
        return ExitCode::FAILURE;
    }

    let config = match DaemonConfig::from_items(&args.broker, &args.items)
        .and_then(|c| c.with_refresh_secs(args.refresh))
    {
        Ok(config) => config.with_retain(!args.no_retain),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon = Daemon::new(config, Arc::new(MqttConnector::new()));
    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
