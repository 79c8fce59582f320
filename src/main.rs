use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::*;
use pylonbms_lib::serialport::SerialTransport;
use pylonbms_lib::stack::{PylontechStack, Record};
use pylonbms_lib::transport::StopSignal;
use serde_json::Value;
use std::{ops::Deref, panic, path::Path};

mod commandline;
mod config;
mod daemon;

use commandline::{CliArgs, CliCommands};

const LOG_FILE_SIZE: u64 = 1024 * 1024;
const LOG_FILES_KEPT: usize = 5;

fn logging_init(loglevel: LevelFilter, log_dir: Option<&Path>) -> Result<LoggerHandle> {
    let mut logger =
        Logger::try_with_env_or_str(loglevel.as_str()).with_context(|| "Cannot init logging")?;
    if let Some(log_dir) = log_dir {
        logger = logger
            .log_to_file(FileSpec::default().directory(log_dir).basename("pylonbms"))
            .rotate(
                Criterion::Size(LOG_FILE_SIZE),
                Naming::Numbers,
                Cleanup::KeepLogFiles(LOG_FILES_KEPT),
            )
            .duplicate_to_stderr(Duplicate::All);
    }
    let log_handle = logger.start().with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

/// Prints a record as `Key: value` lines or as JSON.
pub fn print_record(record: &Record, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }
    for (key, value) in record {
        match value {
            Value::String(text) => println!("{key}: {text}"),
            Value::Null => println!("{key}: -"),
            other => println!("{key}: {other}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config = config::Config::load_or_default(args.config.as_deref())?;
    let settings = config::resolve(&args, config);

    let _log_handle = logging_init(args.verbose.log_level_filter(), settings.log_dir.as_deref())?;
    debug!("Settings: {settings:?}");

    let mut transport = SerialTransport::new(&settings.device, settings.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
    transport.set_delay(settings.delay);

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted, stopping");
        handler_stop.stop();
    })
    .with_context(|| "Cannot install Ctrl-C handler")?;

    let mut stack = PylontechStack::with_stop_signal(transport, settings.stack, stop)
        .with_context(|| "Cannot discover battery modules")?;

    if let Some((kind, battery)) = args.command.query() {
        let record = stack
            .process(kind, battery - 1)
            .with_context(|| format!("Cannot get {}", kind.name()))?;
        match record {
            Some(record) => print_record(&record, args.json)?,
            None => warn!("No data received for {}", kind.name()),
        }
    } else if let CliCommands::Daemon { interval } = args.command {
        daemon::run(&mut stack, interval, args.json)?;
    }

    Ok(())
}
