//! Whole battery stack: module discovery, retrying queries and the
//! aggregated status of all modules.

use crate::packet::{self, END_BYTE, START_BYTE};
use crate::protocol::*;
use crate::transport::{StopSignal, Transport};
use crate::Error;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// A decoded reply as a field name to value mapping.
pub type Record = serde_json::Map<String, Value>;

/// Fields removed by [`strip_header`].
pub const HEADER_FIELDS: [&str; 8] = [
    "VER",
    "ADR",
    "ID",
    "RTN",
    "LENGTH",
    "PAYLOAD",
    "InfoFlag",
    "CommandValue",
];

/// Removes the raw header and protocol internal fields from a record.
pub fn strip_header(record: &mut Record) {
    for field in HEADER_FIELDS {
        record.remove(field);
    }
}

/// Serializes a decoded value into a [`Record`].
pub fn to_record<S: Serialize>(value: &S) -> Result<Record, Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut record = Record::new();
            record.insert("Value".into(), other);
            Ok(record)
        }
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// How often a failing query is repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per query, `None` retries until cancelled.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    /// A single attempt; a silent bus yields no data instead of an error.
    pub fn single_shot() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    pub fn is_single_shot(&self) -> bool {
        self.max_attempts == Some(1)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Pause after the `attempt`th failure, doubling from `initial_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackSettings {
    pub group: u8,
    /// Highest number of modules probed during discovery.
    pub module_limit: usize,
    pub probe_timeout: Duration,
    pub reply_timeout: Duration,
    /// Protocol version probes sent to resynchronize after a failure.
    pub recovery_attempts: u32,
    pub retry: RetryPolicy,
    /// Voltage used to convert Ah into kWh.
    pub nominal_voltage: f64,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            group: 0,
            module_limit: MAX_MODULES,
            probe_timeout: Duration::from_millis(20),
            reply_timeout: Duration::from_millis(500),
            recovery_attempts: 3,
            retry: RetryPolicy::default(),
            nominal_voltage: 50.0,
        }
    }
}

/// Queries accepted by [`PylontechStack::process_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Protocol,
    Manufactory,
    Analog,
    Alarm,
    ChargeDischarge,
    SerialNumber,
    SystemParameter,
    Status,
}

impl QueryKind {
    pub const ALL: [QueryKind; 8] = [
        QueryKind::Protocol,
        QueryKind::Manufactory,
        QueryKind::Analog,
        QueryKind::Alarm,
        QueryKind::ChargeDischarge,
        QueryKind::SerialNumber,
        QueryKind::SystemParameter,
        QueryKind::Status,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Protocol => "protocol",
            QueryKind::Manufactory => "manufactory",
            QueryKind::Analog => "analog",
            QueryKind::Alarm => "alarm",
            QueryKind::ChargeDischarge => "charging",
            QueryKind::SerialNumber => "serialnumber",
            QueryKind::SystemParameter => "systemparameter",
            QueryKind::Status => "status",
        }
    }
}

impl FromStr for QueryKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "protocol" => Ok(QueryKind::Protocol),
            "manufactory" => Ok(QueryKind::Manufactory),
            "analog" => Ok(QueryKind::Analog),
            "alarm" => Ok(QueryKind::Alarm),
            "charging" | "discharge" => Ok(QueryKind::ChargeDischarge),
            "serialnumber" => Ok(QueryKind::SerialNumber),
            "systemparameter" => Ok(QueryKind::SystemParameter),
            "status" => Ok(QueryKind::Status),
            _ => Err(Error::ProtocolMisuse(name.to_string())),
        }
    }
}

/// Everything polled from one module during one status round.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSnapshot {
    pub index: usize,
    pub serial_number: Option<String>,
    pub analog: AnalogValue,
    pub charge_discharge: ChargeDischargeManagement,
    pub alarm: AlarmInfo,
    pub system_parameter: SystemParameter,
}

/// Figures derived from all modules of one status round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calculated {
    #[serde(rename = "ModuleCount")]
    pub module_count: usize,
    #[serde(rename = "TotalCapacity_Ah")]
    pub total_capacity_ah: f64,
    #[serde(rename = "Capacity_kWh")]
    pub capacity_kwh: f64,
    #[serde(rename = "RemainingCapacity_Ah")]
    pub remaining_capacity_ah: f64,
    #[serde(rename = "RemainingEnergy_kWh")]
    pub remaining_energy_kwh: f64,
    #[serde(rename = "Remaining_%")]
    pub remaining_percent: f64,
    #[serde(rename = "Current_Amp")]
    pub current_amp: f64,
    #[serde(rename = "Charging_Watt")]
    pub charging_watt: f64,
    #[serde(rename = "ChargePower_W")]
    pub charge_power_w: f64,
    #[serde(rename = "DischargePower_W")]
    pub discharge_power_w: f64,
    #[serde(rename = "MinimumCellVoltage")]
    pub minimum_cell_voltage: Option<f64>,
    #[serde(rename = "MaximumCellVoltage")]
    pub maximum_cell_voltage: Option<f64>,
    #[serde(rename = "MinimumTemperature")]
    pub minimum_temperature: Option<f64>,
    #[serde(rename = "MaximumTemperature")]
    pub maximum_temperature: Option<f64>,
    #[serde(rename = "CellAlarmOk")]
    pub cell_alarm_ok: bool,
    #[serde(rename = "TemperatureAlarmOk")]
    pub temperature_alarm_ok: bool,
    #[serde(rename = "CurrentAlarmOk")]
    pub current_alarm_ok: bool,
    #[serde(rename = "VoltageAlarmOk")]
    pub voltage_alarm_ok: bool,
}

#[derive(Debug, Default)]
struct Extremes {
    min: Option<f64>,
    max: Option<f64>,
}

impl Extremes {
    fn add(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }
}

/// Result of one complete status round.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSnapshot {
    pub taken_at: Instant,
    pub modules: Vec<ModuleSnapshot>,
    pub calculated: Calculated,
}

impl StackSnapshot {
    /// Folds the module snapshots into the [`Calculated`] record.
    pub fn aggregate(modules: Vec<ModuleSnapshot>, nominal_voltage: f64) -> Self {
        let mut total_capacity = 0.0;
        let mut remaining_capacity = 0.0;
        let mut current = 0.0;
        let mut power = 0.0;
        let mut cell_voltages = Extremes::default();
        let mut temperatures = Extremes::default();
        let mut cell_alarm_ok = true;
        let mut temperature_alarm_ok = true;
        let mut current_alarm_ok = true;
        let mut voltage_alarm_ok = true;

        for module in &modules {
            let analog = &module.analog;
            total_capacity += analog.module_capacity;
            remaining_capacity += analog.remaining_capacity;
            current += analog.current;
            power += analog.power();
            analog
                .cell_voltages
                .iter()
                .for_each(|v| cell_voltages.add(*v));
            analog
                .temperatures
                .iter()
                .for_each(|t| temperatures.add(*t));

            cell_alarm_ok &= module.alarm.cells_ok();
            temperature_alarm_ok &= module.alarm.temperatures_ok();
            current_alarm_ok &= module.alarm.currents_ok();
            voltage_alarm_ok &= module.alarm.voltage_ok();
        }

        let remaining_percent = if total_capacity > 0.0 {
            round(remaining_capacity / total_capacity * 100.0, 1)
        } else {
            0.0
        };

        let calculated = Calculated {
            module_count: modules.len(),
            total_capacity_ah: round(total_capacity, 1),
            capacity_kwh: round(nominal_voltage * total_capacity / 1000.0, 3),
            remaining_capacity_ah: round(remaining_capacity, 1),
            remaining_energy_kwh: round(nominal_voltage * remaining_capacity / 1000.0, 3),
            remaining_percent,
            current_amp: round(current, 1),
            charging_watt: round(power, 1),
            charge_power_w: round(power.max(0.0), 1),
            discharge_power_w: round((-power).max(0.0), 1),
            minimum_cell_voltage: cell_voltages.min.map(|v| round(v, 2)),
            maximum_cell_voltage: cell_voltages.max.map(|v| round(v, 2)),
            minimum_temperature: temperatures.min.map(|t| round(t, 1)),
            maximum_temperature: temperatures.max.map(|t| round(t, 1)),
            cell_alarm_ok,
            temperature_alarm_ok,
            current_alarm_ok,
            voltage_alarm_ok,
        };

        Self {
            taken_at: Instant::now(),
            modules,
            calculated,
        }
    }

    /// All module records (header stripped) plus the calculated figures.
    pub fn to_record(&self) -> Result<Record, Error> {
        fn list<S: Serialize>(items: impl Iterator<Item = S>) -> Result<Value, Error> {
            let mut records = Vec::new();
            for item in items {
                let mut record = to_record(&item)?;
                strip_header(&mut record);
                records.push(Value::Object(record));
            }
            Ok(Value::Array(records))
        }

        let mut record = Record::new();
        record.insert(
            "SerialNumbers".into(),
            Value::Array(
                self.modules
                    .iter()
                    .filter_map(|m| m.serial_number.clone())
                    .map(Value::String)
                    .collect(),
            ),
        );
        record.insert(
            "AnalogList".into(),
            list(self.modules.iter().map(|m| &m.analog))?,
        );
        record.insert(
            "ChargeDischargeManagementList".into(),
            list(self.modules.iter().map(|m| &m.charge_discharge))?,
        );
        record.insert(
            "AlarmInfoList".into(),
            list(self.modules.iter().map(|m| &m.alarm))?,
        );
        record.insert(
            "SystemParameterList".into(),
            list(self.modules.iter().map(|m| &m.system_parameter))?,
        );
        record.insert(
            "Calculated".into(),
            Value::Object(to_record(&self.calculated)?),
        );
        Ok(record)
    }
}

/// Polls a stack of Pylontech modules sharing one RS485 bus.
///
/// The module count is fixed by the discovery in [`PylontechStack::new`].
#[derive(Debug)]
pub struct PylontechStack<T: Transport> {
    transport: T,
    settings: StackSettings,
    stop: StopSignal,
    serial_numbers: Vec<String>,
    last_snapshot: Option<StackSnapshot>,
}

impl<T: Transport> PylontechStack<T> {
    /// Takes ownership of the bus and discovers the attached modules.
    pub fn new(transport: T, settings: StackSettings) -> Result<Self, Error> {
        Self::with_stop_signal(transport, settings, StopSignal::new())
    }

    pub fn with_stop_signal(
        transport: T,
        settings: StackSettings,
        stop: StopSignal,
    ) -> Result<Self, Error> {
        let mut stack = Self {
            transport,
            settings,
            stop,
            serial_numbers: Vec::new(),
            last_snapshot: None,
        };
        stack.discover()?;
        Ok(stack)
    }

    fn discover(&mut self) -> Result<(), Error> {
        let started = Instant::now();
        let limit = self.settings.module_limit.min(MAX_MODULES);
        for index in 0..limit {
            if self.stop.is_stopped() {
                break;
            }
            let address = Address::new(self.settings.group, index)?;
            match self.exchange::<SerialNumber>(&address, self.settings.probe_timeout) {
                Ok(Some(decoded)) => self.serial_numbers.push(decoded.data.module_serial_number),
                Ok(None) => {
                    log::debug!("No answer from module {index} at {address}");
                    break;
                }
                Err(error) if error.is_recoverable() => {
                    log::warn!("Cannot decode serial number of module {index}: {error}");
                    break;
                }
                Err(error) => return Err(error),
            }
        }
        log::info!(
            "Found {} modules in {:?}: {:?}",
            self.serial_numbers.len(),
            started.elapsed(),
            self.serial_numbers
        );
        Ok(())
    }

    pub fn module_count(&self) -> usize {
        self.serial_numbers.len()
    }

    pub fn serial_numbers(&self) -> &[String] {
        &self.serial_numbers
    }

    pub fn settings(&self) -> &StackSettings {
        &self.settings
    }

    /// A handle which stops running queries when raised.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// The most recent completed status round.
    pub fn last_snapshot(&self) -> Option<&StackSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// One request/reply round trip without retry.
    fn exchange<Q: Query>(
        &mut self,
        address: &Address,
        timeout: Duration,
    ) -> Result<Option<Decoded<Q>>, Error> {
        let frame = packet::encode(&Q::request(address));
        let started = Instant::now();
        self.transport.send(&frame)?;
        let Some(raw) = self.transport.receive_frame(timeout, START_BYTE, END_BYTE)? else {
            log::trace!("No reply to {} from {address} within {timeout:?}", Q::COMMAND);
            return Ok(None);
        };
        let body = packet::decode(&raw)?;
        let decoded = decode_reply::<Q>(&body)?;
        if decoded.header.address != address.adr() {
            return Err(Error::Header(format!(
                "reply to {} came from ADR {:02X}, expected {:02X}",
                Q::COMMAND,
                decoded.header.address,
                address.adr()
            )));
        }
        log::trace!("{} from {address} took {:?}", Q::COMMAND, started.elapsed());
        Ok(Some(decoded))
    }

    /// Sends protocol version queries until one is answered.
    fn recover(&mut self, address: &Address) -> Result<(), Error> {
        for attempt in 1..=self.settings.recovery_attempts {
            if self.stop.is_stopped() {
                return Ok(());
            }
            match self.exchange::<ProtocolVersion>(address, self.settings.reply_timeout) {
                Ok(Some(_)) => {
                    log::debug!("Bus recovered after {attempt} probes");
                    return Ok(());
                }
                Ok(None) => log::debug!("Recovery probe {attempt} unanswered"),
                Err(error) if error.is_recoverable() => {
                    log::debug!("Recovery probe {attempt} failed: {error}")
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Runs `Q` against `address` until it decodes, the retry policy gives up
    /// or the stop signal is raised (`Ok(None)`).
    fn query<Q: Query>(&mut self, address: &Address) -> Result<Option<Decoded<Q>>, Error> {
        let mut attempts = 0;
        loop {
            if self.stop.is_stopped() {
                log::debug!("{} to {address} cancelled", Q::COMMAND);
                return Ok(None);
            }
            attempts += 1;
            let error = match self.exchange::<Q>(address, self.settings.reply_timeout) {
                Ok(Some(decoded)) => return Ok(Some(decoded)),
                Ok(None) => Error::Timeout(self.settings.reply_timeout),
                Err(error) if error.is_recoverable() => error,
                Err(error) => return Err(error),
            };
            log::warn!(
                "{} to {address} failed (attempt {attempts}): {error}",
                Q::COMMAND
            );

            if self.settings.retry.exhausted(attempts) {
                if self.settings.retry.is_single_shot() && matches!(error, Error::Timeout(_)) {
                    return Ok(None);
                }
                return Err(Error::CommunicationLost {
                    command: Q::COMMAND,
                    attempts,
                });
            }
            if !self.stop.sleep(self.settings.retry.backoff(attempts)) {
                return Ok(None);
            }
            self.recover(address)?;
        }
    }

    fn clamp_module(&self, module_index: usize) -> usize {
        let count = self.module_count();
        if module_index < count {
            return module_index;
        }
        let clamped = count.saturating_sub(1);
        log::warn!(
            "Module index {module_index} out of range ({count} modules), using {clamped}"
        );
        clamped
    }

    fn module_record<Q: Query>(&mut self, module_index: usize) -> Result<Option<Record>, Error> {
        let address = Address::new(self.settings.group, self.clamp_module(module_index))?;
        let Some(decoded) = self.query::<Q>(&address)? else {
            return Ok(None);
        };
        let mut record = to_record(&decoded)?;
        strip_header(&mut record);
        Ok(Some(record))
    }

    /// Runs the named query against the module at `module_index`.
    ///
    /// `status` polls every module and returns the calculated figures; the
    /// complete round stays available through [`PylontechStack::last_snapshot`].
    pub fn process_command(
        &mut self,
        name: &str,
        module_index: usize,
    ) -> Result<Option<Record>, Error> {
        let kind = name.parse::<QueryKind>()?;
        self.process(kind, module_index)
    }

    pub fn process(&mut self, kind: QueryKind, module_index: usize) -> Result<Option<Record>, Error> {
        match kind {
            QueryKind::Status => self
                .update()?
                .map(|snapshot| to_record(&snapshot.calculated))
                .transpose(),
            QueryKind::Protocol => self.module_record::<ProtocolVersion>(module_index),
            QueryKind::Manufactory => self.module_record::<ManufacturerInfo>(module_index),
            QueryKind::Analog => self.module_record::<AnalogValue>(module_index),
            QueryKind::Alarm => self.module_record::<AlarmInfo>(module_index),
            QueryKind::ChargeDischarge => {
                self.module_record::<ChargeDischargeManagement>(module_index)
            }
            QueryKind::SerialNumber => self.module_record::<SerialNumber>(module_index),
            QueryKind::SystemParameter => self.module_record::<SystemParameter>(module_index),
        }
    }

    /// Polls every discovered module and aggregates the round.
    ///
    /// Returns `Ok(None)` when the stop signal interrupted the round; the
    /// previous snapshot is kept in that case.
    pub fn update(&mut self) -> Result<Option<StackSnapshot>, Error> {
        let started = Instant::now();
        let mut modules = Vec::with_capacity(self.module_count());

        for index in 0..self.module_count() {
            if self.stop.is_stopped() {
                log::info!("Status round interrupted before module {index}");
                return Ok(None);
            }
            let address = Address::new(self.settings.group, index)?;
            let Some(analog) = self.query::<AnalogValue>(&address)? else {
                return Ok(None);
            };
            let Some(charge_discharge) = self.query::<ChargeDischargeManagement>(&address)? else {
                return Ok(None);
            };
            let Some(alarm) = self.query::<AlarmInfo>(&address)? else {
                return Ok(None);
            };
            let Some(system_parameter) = self.query::<SystemParameter>(&address)? else {
                return Ok(None);
            };
            modules.push(ModuleSnapshot {
                index,
                serial_number: self.serial_numbers.get(index).cloned(),
                analog: analog.data,
                charge_discharge: charge_discharge.data,
                alarm: alarm.data,
                system_parameter: system_parameter.data,
            });
        }

        let snapshot = StackSnapshot::aggregate(modules, self.settings.nominal_voltage);
        log::debug!(
            "Status round of {} modules took {:?}",
            snapshot.modules.len(),
            started.elapsed()
        );
        self.last_snapshot = Some(snapshot.clone());
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog(cells: &[f64], temperatures: &[f64], current: f64, remaining: f64, capacity: f64) -> AnalogValue {
        AnalogValue {
            info_flag: 0,
            command_value: 2,
            cell_count: cells.len() as u8,
            cell_voltages: cells.to_vec(),
            temperature_count: temperatures.len() as u8,
            temperatures: temperatures.to_vec(),
            current,
            voltage: 50.0,
            remaining_capacity: remaining,
            detected_capacity: CapacityRange::UpTo65Ah,
            module_capacity: capacity,
            cycle_number: 10,
        }
    }

    fn alarm(cell: AlarmState) -> AlarmInfo {
        AlarmInfo {
            info_flag: 0,
            command_value: 2,
            cell_count: 2,
            cell_alarm: vec![AlarmState::Ok, cell],
            temperature_count: 1,
            temperature: vec![AlarmState::Ok],
            charge_current: AlarmState::Ok,
            module_voltage: AlarmState::Ok,
            discharge_current: AlarmState::Ok,
            status1: 0,
            status2: 0,
            status3: 0,
            status4: 0,
            status5: 0,
        }
    }

    fn module(index: usize, analog: AnalogValue, alarm: AlarmInfo) -> ModuleSnapshot {
        ModuleSnapshot {
            index,
            serial_number: Some(format!("PPTAH0{index}")),
            analog,
            charge_discharge: ChargeDischargeManagement {
                command_value: 2,
                charge_voltage_limit: 53.2,
                discharge_voltage_limit: 45.0,
                max_charge_current: 25.0,
                max_discharge_current: -25.0,
                charge_enable: Switch::On,
                discharge_enable: Switch::On,
                charge_immediately1: Switch::Off,
                charge_immediately2: Switch::Off,
                full_charge_required: Switch::Off,
            },
            alarm,
            system_parameter: SystemParameter {
                info_flag: 0,
                cell_upper_voltage_limit: 3.6,
                cell_low_voltage_limit: 2.8,
                cell_under_voltage_threshold: 2.6,
                charge_upper_temperature_limit: 48.2,
                charge_lower_temperature_limit: 0.9,
                charge_current_limit: 50.0,
                upper_voltage_limit: 54.0,
                lower_voltage_limit: 45.0,
                under_voltage_limit: 43.0,
                discharge_upper_temperature_limit: 48.2,
                discharge_lower_temperature_limit: -21.1,
                discharge_current_limit: -50.0,
            },
        }
    }

    fn two_modules() -> Vec<ModuleSnapshot> {
        vec![
            module(
                0,
                analog(&[3.301, 3.322], &[21.0, 23.5], -4.0, 40.0, 50.0),
                alarm(AlarmState::Ok),
            ),
            module(
                1,
                analog(&[3.290, 3.305], &[19.5, 22.0], -2.0, 35.0, 74.0),
                alarm(AlarmState::Ok),
            ),
        ]
    }

    #[test]
    fn aggregate_totals() {
        let snapshot = StackSnapshot::aggregate(two_modules(), 50.0);
        let calculated = &snapshot.calculated;
        assert_eq!(calculated.module_count, 2);
        assert_eq!(calculated.total_capacity_ah, 124.0);
        assert_eq!(calculated.capacity_kwh, 6.2);
        assert_eq!(calculated.remaining_capacity_ah, 75.0);
        assert_eq!(calculated.remaining_energy_kwh, 3.75);
        assert_eq!(calculated.remaining_percent, 60.5);
        assert_eq!(calculated.current_amp, -6.0);
        assert_eq!(calculated.charging_watt, -300.0);
        assert_eq!(calculated.charge_power_w, 0.0);
        assert_eq!(calculated.discharge_power_w, 300.0);
        assert_eq!(calculated.minimum_cell_voltage, Some(3.29));
        assert_eq!(calculated.maximum_cell_voltage, Some(3.32));
        assert_eq!(calculated.minimum_temperature, Some(19.5));
        assert_eq!(calculated.maximum_temperature, Some(23.5));
        assert!(calculated.cell_alarm_ok);
        assert!(calculated.voltage_alarm_ok);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let first = StackSnapshot::aggregate(two_modules(), 50.0);
        let second = StackSnapshot::aggregate(two_modules(), 50.0);
        assert_eq!(first.calculated, second.calculated);
        assert_eq!(
            to_record(&first.calculated).unwrap(),
            to_record(&second.calculated).unwrap()
        );
    }

    #[test]
    fn one_unhealthy_module_fails_the_stack() {
        let mut modules = two_modules();
        modules[1].alarm = alarm(AlarmState::AboveLimit);
        let calculated = StackSnapshot::aggregate(modules, 50.0).calculated;
        assert!(!calculated.cell_alarm_ok);
        assert!(calculated.temperature_alarm_ok);
        assert!(calculated.current_alarm_ok);
    }

    #[test]
    fn empty_stack() {
        let calculated = StackSnapshot::aggregate(Vec::new(), 50.0).calculated;
        assert_eq!(calculated.module_count, 0);
        assert_eq!(calculated.remaining_percent, 0.0);
        assert_eq!(calculated.minimum_cell_voltage, None);
        assert_eq!(calculated.maximum_temperature, None);
        assert!(calculated.cell_alarm_ok);

        let record = to_record(&calculated).unwrap();
        assert_eq!(record["MinimumCellVoltage"], Value::Null);
        assert_eq!(record["Remaining_%"], serde_json::json!(0.0));
    }

    #[test]
    fn snapshot_record_strips_internal_fields() {
        let record = StackSnapshot::aggregate(two_modules(), 50.0)
            .to_record()
            .unwrap();
        assert_eq!(
            record["SerialNumbers"],
            serde_json::json!(["PPTAH00", "PPTAH01"])
        );
        let analog = &record["AnalogList"][1];
        assert_eq!(analog["ModuleCapacity"], serde_json::json!(74.0));
        assert!(analog.get("InfoFlag").is_none());
        assert!(analog.get("CommandValue").is_none());
        assert_eq!(
            record["ChargeDischargeManagementList"][0]["ChargeEnable"],
            serde_json::json!("on")
        );
        assert_eq!(
            record["Calculated"]["TotalCapacity_Ah"],
            serde_json::json!(124.0)
        );
    }

    #[test]
    fn query_names() {
        assert_eq!("status".parse::<QueryKind>().unwrap(), QueryKind::Status);
        assert_eq!("Analog".parse::<QueryKind>().unwrap(), QueryKind::Analog);
        assert_eq!(
            "discharge".parse::<QueryKind>().unwrap(),
            QueryKind::ChargeDischarge
        );
        assert_eq!(
            "charging".parse::<QueryKind>().unwrap(),
            QueryKind::ChargeDischarge
        );
        for kind in QueryKind::ALL {
            assert_eq!(kind.name().parse::<QueryKind>().unwrap(), kind);
        }
        assert!(matches!(
            "reboot".parse::<QueryKind>(),
            Err(Error::ProtocolMisuse(name)) if name == "reboot"
        ));
    }

    #[test]
    fn backoff_doubles_up_to_the_limit() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(4), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
        assert_eq!(policy.backoff(40), Duration::from_secs(2));

        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(!RetryPolicy::unbounded().exhausted(u32::MAX));
        assert!(RetryPolicy::single_shot().exhausted(1));
    }

    #[test]
    fn strip_header_fields() {
        let mut record = Record::new();
        for field in HEADER_FIELDS {
            record.insert(field.into(), Value::Null);
        }
        record.insert("Current".into(), serde_json::json!(1.5));
        strip_header(&mut record);
        assert_eq!(record.len(), 1);
        assert!(record.contains_key("Current"));
    }
}
