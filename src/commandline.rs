use clap::{Parser, Subcommand};
use clap_num::number_range;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use pylonbms_lib::protocol::{MAX_GROUP, MAX_MODULES};
use pylonbms_lib::stack::QueryKind;
use std::path::PathBuf;
use std::time::Duration;

pub fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn battery_in_range(s: &str) -> Result<usize, String> {
    number_range(s, 1, MAX_MODULES)
}

fn module_limit_in_range(s: &str) -> Result<usize, String> {
    number_range(s, 1, MAX_MODULES)
}

fn group_in_range(s: &str) -> Result<u8, String> {
    number_range(s, 0, MAX_GROUP)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the protocol version spoken by a battery module
    Protocol {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show battery name, software version and manufacturer
    Manufactory {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show cell voltages, temperatures, current, voltage and capacity of a module
    Analog {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show the alarm states of a module
    Alarm {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show charge/discharge limits and flags of a module
    #[command(alias = "discharge")]
    Charging {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show the serial number of a module
    SerialNumber {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Show the system parameters (voltage, temperature and current limits) of a module
    SystemParameter {
        /// Battery module number, starting at 1
        #[arg(short, long, value_parser = battery_in_range, default_value_t = 1)]
        battery: usize,
    },
    /// Poll all modules and show the calculated stack status
    Status,
    /// Run in daemon mode, periodically polling the stack status until Ctrl-C
    Daemon {
        /// Interval between status rounds (e.g., "10s", "1m")
        #[arg(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
    },
}

impl CliCommands {
    /// The stack query and 1-based battery number of a single shot command.
    pub fn query(&self) -> Option<(QueryKind, usize)> {
        match self {
            CliCommands::Protocol { battery } => Some((QueryKind::Protocol, *battery)),
            CliCommands::Manufactory { battery } => Some((QueryKind::Manufactory, *battery)),
            CliCommands::Analog { battery } => Some((QueryKind::Analog, *battery)),
            CliCommands::Alarm { battery } => Some((QueryKind::Alarm, *battery)),
            CliCommands::Charging { battery } => Some((QueryKind::ChargeDischarge, *battery)),
            CliCommands::SerialNumber { battery } => Some((QueryKind::SerialNumber, *battery)),
            CliCommands::SystemParameter { battery } => {
                Some((QueryKind::SystemParameter, *battery))
            }
            CliCommands::Status => Some((QueryKind::Status, 1)),
            CliCommands::Daemon { .. } => None,
        }
    }
}

const fn about_text() -> &'static str {
    "pylontech battery command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows) [default: /dev/ttyUSB0]
    #[arg(short, long)]
    pub device: Option<String>,

    /// Serial baud rate [default: 115200]
    #[arg(short = 'r', long)]
    pub baud_rate: Option<u32>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Battery group number [default: 0]
    #[arg(short, long, value_parser = group_in_range)]
    pub group: Option<u8>,

    /// Highest number of modules probed at startup [default: 14]
    #[arg(long, value_parser = module_limit_in_range)]
    pub module_limit: Option<usize>,

    /// Timeout for the serial number probes during discovery (e.g., "20ms") [default: 20ms]
    #[arg(value_parser = humantime::parse_duration, long)]
    pub probe_timeout: Option<Duration>,

    /// Timeout for data queries (e.g., "500ms", "1s") [default: 500ms]
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between sending multiple commands to the battery (e.g., "15ms", "50ms")
    /// (useful for some serial adapters that need time to switch between TX/RX) [default: 15ms]
    #[arg(value_parser = humantime::parse_duration, long)]
    pub delay: Option<Duration>,

    /// Number of retries for failed commands [default: 4]
    #[arg(long, conflicts_with = "retry_forever")]
    pub retries: Option<u32>,

    /// Retry failed commands until interrupted
    #[arg(long, action)]
    pub retry_forever: bool,

    /// YAML configuration file [default: pylonbms.yaml if present]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long, action)]
    pub json: bool,

    /// Also write the log to rotating files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_numbers_start_at_one() {
        let args = CliArgs::parse_from(["pylonbms", "analog"]);
        assert_eq!(args.command.query(), Some((QueryKind::Analog, 1)));

        let args = CliArgs::parse_from(["pylonbms", "alarm", "--battery", "3"]);
        assert_eq!(args.command.query(), Some((QueryKind::Alarm, 3)));

        assert!(CliArgs::try_parse_from(["pylonbms", "alarm", "--battery", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["pylonbms", "alarm", "--battery", "15"]).is_err());
    }

    #[test]
    fn discharge_alias() {
        let args = CliArgs::parse_from(["pylonbms", "discharge", "-b", "2"]);
        assert_eq!(args.command, CliCommands::Charging { battery: 2 });
    }

    #[test]
    fn global_options() {
        let args = CliArgs::parse_from([
            "pylonbms",
            "--group",
            "1",
            "--timeout",
            "1s",
            "--json",
            "daemon",
            "--interval",
            "30s",
        ]);
        assert_eq!(args.group, Some(1));
        assert_eq!(args.timeout, Some(Duration::from_secs(1)));
        assert!(args.json);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                interval: Duration::from_secs(30)
            }
        );
        assert_eq!(args.command.query(), None);

        assert!(CliArgs::try_parse_from(["pylonbms", "--group", "16", "status"]).is_err());
        assert!(CliArgs::try_parse_from([
            "pylonbms",
            "--retries",
            "2",
            "--retry-forever",
            "status"
        ])
        .is_err());
    }
}
