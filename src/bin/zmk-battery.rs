use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use log::{error, info, LevelFilter};
use zmk_battery::{init_logging, run};
use zmk_battery::error::{AppRunError, ConfigError};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Monitors the battery levels of both halves of a split ZMK keyboard over bluetooth.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path of the JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(args.log_level.into());
    info!(concat!("zmk-battery ", env!("CARGO_PKG_VERSION")));

    match run(args.config) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("zmk-battery is already running");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(()) => Ok(()),
    }
}
