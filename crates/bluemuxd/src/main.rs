//! bluemuxd - multiplexing Bluetooth daemon

mod local_stack;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use bluemux::config::DaemonConfig;
use clap::Parser;
use log::error;

#[derive(Parser, Debug)]
#[command(name = "bluemuxd", version, about = "Share one Bluetooth controller between local clients")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds without a powered client before the controller is turned off
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Write a packet dump to this file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Disable the packet dump
    #[arg(long, conflicts_with = "dump")]
    no_dump: bool,

    /// Log filter, e.g. "info" or "bluemux=debug"
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, if any, and apply command line overrides
    fn into_config(self) -> Result<DaemonConfig, bluemux::ConfigError> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_path(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_power_off_secs = secs;
        }
        if let Some(path) = self.dump {
            config.dump.enabled = true;
            config.dump.path = path;
        }
        if self.no_dump {
            config.dump.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bluemuxd: {}", err);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    if let Err(err) = server::run(config).await {
        error!("bluemuxd failed: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
