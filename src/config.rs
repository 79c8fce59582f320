use crate::commandline::{default_device_name, CliArgs};
use anyhow::{Context, Result};
use pylonbms_lib::serialport::{DEFAULT_BAUD_RATE, MINIMUM_DELAY};
use pylonbms_lib::stack::{RetryPolicy, StackSettings};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Optional settings read from a YAML file, overridden by the command line.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub device: Option<String>,
    pub baud_rate: Option<u32>,
    pub group: Option<u8>,
    pub module_limit: Option<usize>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub delay: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_forever: Option<bool>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial_backoff: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_backoff: Option<Duration>,
    pub recovery_attempts: Option<u32>,
    pub nominal_voltage: Option<f64>,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &str = "pylonbms.yaml";

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Loads the given file, or the default file if it exists, or nothing.
    pub fn load_or_default(config_file_path: Option<&Path>) -> Result<Self> {
        match config_file_path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(Self::DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

const DEFAULT_DELAY: Duration = Duration::from_millis(15);
const DEFAULT_RETRIES: u32 = 4;

/// Effective settings after merging command line, file and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub device: String,
    pub baud_rate: u32,
    pub delay: Duration,
    pub log_dir: Option<PathBuf>,
    pub stack: StackSettings,
}

pub fn resolve(args: &CliArgs, config: Config) -> Settings {
    let defaults = StackSettings::default();
    let retry_forever = args.retry_forever || config.retry_forever.unwrap_or(false);
    let max_attempts = if retry_forever && args.retries.is_none() {
        None
    } else {
        let retries = args.retries.or(config.retries).unwrap_or(DEFAULT_RETRIES);
        Some(retries.saturating_add(1))
    };

    Settings {
        device: args
            .device
            .clone()
            .or(config.device)
            .unwrap_or_else(default_device_name),
        baud_rate: args
            .baud_rate
            .or(config.baud_rate)
            .unwrap_or(DEFAULT_BAUD_RATE),
        delay: args
            .delay
            .or(config.delay)
            .unwrap_or(DEFAULT_DELAY)
            .max(MINIMUM_DELAY),
        log_dir: args.log_dir.clone().or(config.log_dir),
        stack: StackSettings {
            group: args.group.or(config.group).unwrap_or(defaults.group),
            module_limit: args
                .module_limit
                .or(config.module_limit)
                .unwrap_or(defaults.module_limit),
            probe_timeout: args
                .probe_timeout
                .or(config.probe_timeout)
                .unwrap_or(defaults.probe_timeout),
            reply_timeout: args
                .timeout
                .or(config.timeout)
                .unwrap_or(defaults.reply_timeout),
            recovery_attempts: config
                .recovery_attempts
                .unwrap_or(defaults.recovery_attempts),
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: config
                    .initial_backoff
                    .unwrap_or(defaults.retry.initial_backoff),
                max_backoff: config.max_backoff.unwrap_or(defaults.retry.max_backoff),
            },
            nominal_voltage: config.nominal_voltage.unwrap_or(defaults.nominal_voltage),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_yaml() {
        let file = write_config(
            "device: /dev/ttyAMA0\n\
             baud_rate: 9600\n\
             group: 2\n\
             timeout: 1s 500ms\n\
             delay: 30ms\n\
             retry_forever: true\n\
             nominal_voltage: 48.0\n",
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/ttyAMA0"));
        assert_eq!(config.baud_rate, Some(9600));
        assert_eq!(config.group, Some(2));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.delay, Some(Duration::from_millis(30)));
        assert_eq!(config.probe_timeout, None);
        assert_eq!(config.retry_forever, Some(true));
        assert_eq!(config.nominal_voltage, Some(48.0));
    }

    #[test]
    fn reject_invalid_files() {
        let file = write_config("devcie: /dev/ttyUSB1\n");
        assert!(Config::load(file.path()).is_err());

        let file = write_config("timeout: soon\n");
        assert!(Config::load(file.path()).is_err());

        assert!(Config::load(Path::new("/nonexistent/pylonbms.yaml")).is_err());
    }

    #[test]
    fn defaults_without_file_or_arguments() {
        let args = CliArgs::parse_from(["pylonbms", "status"]);
        let settings = resolve(&args, Config::default());
        assert_eq!(settings.device, default_device_name());
        assert_eq!(settings.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(settings.delay, DEFAULT_DELAY);
        assert_eq!(settings.stack.retry.max_attempts, Some(DEFAULT_RETRIES + 1));
        assert_eq!(settings.stack.reply_timeout, Duration::from_millis(500));
        assert_eq!(settings.stack.module_limit, 14);
    }

    #[test]
    fn command_line_overrides_file() {
        let config = Config {
            device: Some("/dev/ttyAMA0".into()),
            baud_rate: Some(9600),
            timeout: Some(Duration::from_secs(2)),
            retries: Some(1),
            recovery_attempts: Some(5),
            ..Config::default()
        };
        let args = CliArgs::parse_from([
            "pylonbms",
            "--device",
            "/dev/ttyUSB3",
            "--timeout",
            "250ms",
            "status",
        ]);
        let settings = resolve(&args, config);
        assert_eq!(settings.device, "/dev/ttyUSB3");
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.stack.reply_timeout, Duration::from_millis(250));
        assert_eq!(settings.stack.retry.max_attempts, Some(2));
        assert_eq!(settings.stack.recovery_attempts, 5);
    }

    #[test]
    fn retry_forever() {
        let args = CliArgs::parse_from(["pylonbms", "--retry-forever", "status"]);
        let settings = resolve(&args, Config::default());
        assert_eq!(settings.stack.retry.max_attempts, None);

        let config = Config {
            retry_forever: Some(true),
            ..Config::default()
        };
        let args = CliArgs::parse_from(["pylonbms", "--retries", "2", "status"]);
        let settings = resolve(&args, config);
        assert_eq!(settings.stack.retry.max_attempts, Some(3));
    }

    #[test]
    fn delay_has_a_lower_bound() {
        let args = CliArgs::parse_from(["pylonbms", "--delay", "1ms", "status"]);
        let settings = resolve(&args, Config::default());
        assert_eq!(settings.delay, MINIMUM_DELAY);
    }
}
