//! Pylontech RS485 protocol: request encoding and response decoding.
//!
//! A packet body is ASCII hex: `VER ADR CID1 CID2/RTN LENGTH INFO`.
//! Requests are built by [`Query::request`], replies are parsed into a
//! [`Header`] and handed to [`Query::decode`] of the command that asked.

use crate::cursor::HexCursor;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version 2.0, sent in every request.
pub const PROTOCOL_VERSION: u8 = 0x20;
/// CID1 of lithium iron battery modules.
pub const DEVICE_TYPE: u8 = 0x46;
/// Hex digits of VER, ADR, CID1, CID2/RTN and LENGTH.
pub const HEADER_LENGTH: usize = 12;
/// Address of the first module in a group.
const FIRST_MODULE_ADDRESS: u8 = 2;
/// Modules addressable within one group (ADR low nibble 2..=15).
pub const MAX_MODULES: usize = 14;
pub const MAX_GROUP: u8 = 15;

/// Detected capacity flag value announcing the wide capacity fields.
pub const CAPACITY_FLAG_ABOVE_65AH: u8 = 4;
/// Hex digits of a capacity field for modules up to 65Ah.
pub const CAPACITY_DIGITS_NARROW: usize = 4;
/// Hex digits of the trailing capacity fields of modules above 65Ah.
pub const CAPACITY_DIGITS_WIDE: usize = 6;

/// Temperatures are transmitted in 0.1K.
const ZERO_CELSIUS_DECI_KELVIN: i32 = 2731;

const CHARGE_MANAGEMENT_LENGTH: usize = 20;
const SYSTEM_PARAMETER_LENGTH: usize = 50;
const SERIAL_NUMBER_LENGTH: usize = 34;

macro_rules! read_flag {
    ($byte:expr,$mask:expr) => {
        Switch::from($byte & $mask != 0)
    };
}

/// Query commands (CID2) supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ProtocolVersion = 0x4F,
    ManufacturerInfo = 0x51,
    AnalogValue = 0x42,
    AlarmInfo = 0x44,
    SystemParameter = 0x47,
    ChargeDischargeManagement = 0x92,
    SerialNumber = 0x93,
}

impl Command {
    pub fn cid2(self) -> u8 {
        self as u8
    }

    /// Commands which name the addressed module again in the INFO field.
    fn carries_address(self) -> bool {
        matches!(
            self,
            Command::AnalogValue
                | Command::AlarmInfo
                | Command::ChargeDischargeManagement
                | Command::SerialNumber
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::ProtocolVersion => write!(f, "protocol version"),
            Command::ManufacturerInfo => write!(f, "manufacturer info"),
            Command::AnalogValue => write!(f, "analog value"),
            Command::AlarmInfo => write!(f, "alarm info"),
            Command::SystemParameter => write!(f, "system parameter"),
            Command::ChargeDischargeManagement => write!(f, "charge/discharge management"),
            Command::SerialNumber => write!(f, "serial number"),
        }
    }
}

/// Bus address of one module: group in the high nibble, module number in the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    group: u8,
    module: usize,
}

impl Address {
    /// Builds the address of the module at 0-based `module` index within `group`.
    pub fn new(group: u8, module: usize) -> Result<Self, Error> {
        if group > MAX_GROUP || module >= MAX_MODULES {
            return Err(Error::AddressOutOfRange { group, module });
        }
        Ok(Self { group, module })
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn module(&self) -> usize {
        self.module
    }

    /// The ADR byte as transmitted.
    pub fn adr(&self) -> u8 {
        (self.group << 4) | (self.module as u8 + FIRST_MODULE_ADDRESS)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.adr())
    }
}

/// LENGTH field: LENID in the low 12 bits, its nibble checksum in the high nibble.
pub fn length_field(lenid: u16) -> u16 {
    let lenid = lenid & 0x0FFF;
    if lenid == 0 {
        return 0;
    }
    let sum = (lenid & 0xF) + ((lenid >> 4) & 0xF) + ((lenid >> 8) & 0xF);
    let lchksum = (!sum).wrapping_add(1) & 0xF;
    (lchksum << 12) | lenid
}

/// Builds a packet body (everything between start marker and checksum).
pub fn create_packet(version: u8, address: u8, cid1: u8, cid2: u8, info: &[u8]) -> Vec<u8> {
    let mut packet = format!(
        "{version:02X}{address:02X}{cid1:02X}{cid2:02X}{:04X}",
        length_field(info.len() as u16)
    )
    .into_bytes();
    packet.extend_from_slice(info);
    packet
}

fn create_request(address: &Address, command: Command) -> Vec<u8> {
    let info = if command.carries_address() {
        format!("{:02X}", address.adr())
    } else {
        String::new()
    };
    create_packet(
        PROTOCOL_VERSION,
        address.adr(),
        DEVICE_TYPE,
        command.cid2(),
        info.as_bytes(),
    )
}

/// Return code (RTN) of a reply which signals a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    VersionError,
    ChecksumError,
    LengthChecksumError,
    InvalidCid2,
    CommandFormatError,
    InvalidData,
    AddressError,
    CommunicationError,
    Unknown(u8),
}

impl From<u8> for ResponseCode {
    fn from(rtn: u8) -> Self {
        match rtn {
            0x01 => ResponseCode::VersionError,
            0x02 => ResponseCode::ChecksumError,
            0x03 => ResponseCode::LengthChecksumError,
            0x04 => ResponseCode::InvalidCid2,
            0x05 => ResponseCode::CommandFormatError,
            0x06 => ResponseCode::InvalidData,
            0x90 => ResponseCode::AddressError,
            0x91 => ResponseCode::CommunicationError,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseCode::VersionError => write!(f, "VER error"),
            ResponseCode::ChecksumError => write!(f, "CHKSUM error"),
            ResponseCode::LengthChecksumError => write!(f, "LCHKSUM error"),
            ResponseCode::InvalidCid2 => write!(f, "CID2 invalid"),
            ResponseCode::CommandFormatError => write!(f, "Command format error"),
            ResponseCode::InvalidData => write!(f, "Invalid data"),
            ResponseCode::AddressError => write!(f, "ADR error"),
            ResponseCode::CommunicationError => write!(f, "Internal communication error"),
            ResponseCode::Unknown(code) => write!(f, "Unknown return code {code:#04x}"),
        }
    }
}

/// Fixed prefix of every reply plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Header {
    #[serde(rename = "VER")]
    pub version: u8,
    #[serde(rename = "ADR")]
    pub address: u8,
    #[serde(rename = "ID")]
    pub id: u8,
    #[serde(rename = "RTN")]
    pub return_code: u8,
    /// LENID, the number of payload hex digits.
    pub length: u16,
    pub payload: String,
}

fn hex_byte(raw: &[u8], offset: usize) -> Result<u8, Error> {
    std::str::from_utf8(&raw[offset..offset + 2])
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::Header(format!("invalid hex digits at offset {offset}")))
}

impl Header {
    /// Slices a packet body into header fields and payload.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < HEADER_LENGTH {
            return Err(Error::Header(format!(
                "packet of {} digits is shorter than the {HEADER_LENGTH} digit header",
                raw.len()
            )));
        }
        let length = u16::from_be_bytes([hex_byte(raw, 8)?, hex_byte(raw, 10)?]);
        let lenid = length & 0x0FFF;
        if length_field(lenid) != length {
            return Err(Error::Header(format!(
                "length checksum mismatch in {length:04X}"
            )));
        }
        let available = raw.len() - HEADER_LENGTH;
        if usize::from(lenid) != available {
            return Err(Error::Header(format!(
                "declared payload length {lenid} but {available} digits received"
            )));
        }
        let payload = std::str::from_utf8(&raw[HEADER_LENGTH..])
            .ok()
            .filter(|payload| payload.is_ascii())
            .ok_or_else(|| Error::Header("payload is not ASCII".to_string()))?;
        let header = Self {
            version: hex_byte(raw, 0)?,
            address: hex_byte(raw, 2)?,
            id: hex_byte(raw, 4)?,
            return_code: hex_byte(raw, 6)?,
            length: lenid,
            payload: payload.to_string(),
        };
        log::debug!(
            "Header VER={:02X} ADR={:02X} ID={:02X} RTN={:02X} LENGTH={}",
            header.version,
            header.address,
            header.id,
            header.return_code,
            header.length
        );
        Ok(header)
    }

    /// Checks device type and return code and opens a cursor on the payload.
    pub fn cursor(&self, command: Command) -> Result<HexCursor<'_>, Error> {
        if self.id != DEVICE_TYPE {
            return Err(Error::Header(format!(
                "unexpected device type {:02X} in reply to {command}",
                self.id
            )));
        }
        if self.return_code != 0 {
            return Err(Error::Response(ResponseCode::from(self.return_code)));
        }
        Ok(HexCursor::new(command, self.payload.as_bytes()))
    }

    /// Like [`Header::cursor`] for replies with a fixed payload length.
    pub fn fixed_cursor(&self, command: Command, length: usize) -> Result<HexCursor<'_>, Error> {
        let cursor = self.cursor(command)?;
        if self.payload.len() != length {
            return Err(Error::PayloadFormat {
                command,
                length: self.payload.len(),
                reason: format!("expected {length} digits"),
            });
        }
        Ok(cursor)
    }
}

/// Interprets the low `bits` bits of `value` as a two's complement number.
pub fn twos_complement(value: u32, bits: u32) -> i32 {
    let value = value as i64 & ((1i64 << bits) - 1);
    if value & (1 << (bits - 1)) != 0 {
        (value - (1i64 << bits)) as i32
    } else {
        value as i32
    }
}

/// Cell voltage in V from a signed mV reading.
pub fn cell_voltage(raw: i16) -> f64 {
    f64::from(raw) / 1000.0
}

/// Module voltage in V from an unsigned mV reading.
pub fn module_voltage(raw: u16) -> f64 {
    f64::from(raw) / 1000.0
}

/// Current in A from a signed 0.1A reading, positive while charging.
pub fn module_current(raw: i16) -> f64 {
    f64::from(raw) / 10.0
}

/// Capacity in Ah from a mAh reading.
pub fn capacity(raw: u32) -> f64 {
    f64::from(raw) / 1000.0
}

/// Temperature in °C from a signed 0.1K reading.
pub fn temperature(raw: i16) -> f64 {
    f64::from(i32::from(raw) - ZERO_CELSIUS_DECI_KELVIN) / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmState {
    Ok,
    BelowLimit,
    AboveLimit,
    OtherError,
}

impl AlarmState {
    pub fn is_ok(&self) -> bool {
        *self == AlarmState::Ok
    }
}

impl From<u8> for AlarmState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => AlarmState::Ok,
            1 => AlarmState::BelowLimit,
            2 => AlarmState::AboveLimit,
            _ => AlarmState::OtherError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

/// Width of the capacity fields announced by an analog value reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityRange {
    #[serde(rename = "<=65Ah")]
    UpTo65Ah,
    #[serde(rename = ">65Ah")]
    Above65Ah,
}

impl From<u8> for CapacityRange {
    fn from(flag: u8) -> Self {
        if flag == CAPACITY_FLAG_ABOVE_65AH {
            CapacityRange::Above65Ah
        } else {
            CapacityRange::UpTo65Ah
        }
    }
}

/// A command together with the record its reply decodes into.
pub trait Query: Sized + Serialize {
    const COMMAND: Command;

    /// Packet body (without checksum and markers) asking `address` for this record.
    fn request(address: &Address) -> Vec<u8> {
        create_request(address, Self::COMMAND)
    }

    fn decode(header: &Header) -> Result<Self, Error>;
}

/// A decoded reply which still carries its header.
#[derive(Debug, Clone, Serialize)]
pub struct Decoded<T> {
    #[serde(flatten)]
    pub header: Header,
    #[serde(flatten)]
    pub data: T,
}

/// Decodes a packet body (as returned by [`crate::packet::decode`]) into `Q`.
pub fn decode_reply<Q: Query>(packet: &[u8]) -> Result<Decoded<Q>, Error> {
    let header = Header::decode(packet)?;
    let data = Q::decode(&header)?;
    Ok(Decoded { header, data })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolVersion {
    pub version: String,
}

impl Query for ProtocolVersion {
    const COMMAND: Command = Command::ProtocolVersion;

    fn decode(header: &Header) -> Result<Self, Error> {
        // the version is carried by the VER field, the payload is empty
        header.cursor(Self::COMMAND)?;
        Ok(Self {
            version: format!("{}.{}", header.version >> 4, header.version & 0x0F),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManufacturerInfo {
    pub battery_name: String,
    pub software_version: u16,
    pub manufacturer_name: String,
}

impl Query for ManufacturerInfo {
    const COMMAND: Command = Command::ManufacturerInfo;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.cursor(Self::COMMAND)?;
        Ok(Self {
            battery_name: cursor.read_text(10)?,
            software_version: cursor.read_u16()?,
            manufacturer_name: cursor.read_text(20)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalogValue {
    pub info_flag: u8,
    pub command_value: u8,
    pub cell_count: u8,
    pub cell_voltages: Vec<f64>,
    pub temperature_count: u8,
    pub temperatures: Vec<f64>,
    pub current: f64,
    pub voltage: f64,
    pub remaining_capacity: f64,
    pub detected_capacity: CapacityRange,
    pub module_capacity: f64,
    pub cycle_number: u16,
}

impl AnalogValue {
    /// Net power of the module in W, positive while charging.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

impl Query for AnalogValue {
    const COMMAND: Command = Command::AnalogValue;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.cursor(Self::COMMAND)?;
        let info_flag = cursor.read_u8()?;
        let command_value = cursor.read_u8()?;
        let cell_voltages = cursor.read_counted(|c| Ok(cell_voltage(c.read_i16()?)))?;
        let temperatures = cursor.read_counted(|c| Ok(temperature(c.read_i16()?)))?;
        let current = module_current(cursor.read_i16()?);
        let voltage = module_voltage(cursor.read_u16()?);
        let narrow_remaining = cursor.read_unsigned(CAPACITY_DIGITS_NARROW)?;
        let detected_capacity = CapacityRange::from(cursor.read_u8()?);
        let narrow_module = cursor.read_unsigned(CAPACITY_DIGITS_NARROW)?;
        let cycle_number = cursor.read_u16()?;

        let (remaining, module) = match detected_capacity {
            CapacityRange::UpTo65Ah => (narrow_remaining, narrow_module),
            CapacityRange::Above65Ah => {
                log::trace!(
                    "Capacity above 65Ah, reading wide fields at offset {}",
                    cursor.position()
                );
                (
                    cursor.read_unsigned(CAPACITY_DIGITS_WIDE)?,
                    cursor.read_unsigned(CAPACITY_DIGITS_WIDE)?,
                )
            }
        };

        Ok(Self {
            info_flag,
            command_value,
            cell_count: cell_voltages.len() as u8,
            cell_voltages,
            temperature_count: temperatures.len() as u8,
            temperatures,
            current,
            voltage,
            remaining_capacity: capacity(remaining),
            detected_capacity,
            module_capacity: capacity(module),
            cycle_number,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmInfo {
    pub info_flag: u8,
    pub command_value: u8,
    pub cell_count: u8,
    pub cell_alarm: Vec<AlarmState>,
    pub temperature_count: u8,
    pub temperature: Vec<AlarmState>,
    pub charge_current: AlarmState,
    pub module_voltage: AlarmState,
    pub discharge_current: AlarmState,
    pub status1: u8,
    pub status2: u8,
    pub status3: u8,
    pub status4: u8,
    pub status5: u8,
}

impl AlarmInfo {
    pub fn cells_ok(&self) -> bool {
        self.cell_alarm.iter().all(AlarmState::is_ok)
    }

    pub fn temperatures_ok(&self) -> bool {
        self.temperature.iter().all(AlarmState::is_ok)
    }

    pub fn currents_ok(&self) -> bool {
        self.charge_current.is_ok() && self.discharge_current.is_ok()
    }

    pub fn voltage_ok(&self) -> bool {
        self.module_voltage.is_ok()
    }
}

impl Query for AlarmInfo {
    const COMMAND: Command = Command::AlarmInfo;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.cursor(Self::COMMAND)?;
        let info_flag = cursor.read_u8()?;
        let command_value = cursor.read_u8()?;
        let cell_alarm = cursor.read_counted(|c| Ok(AlarmState::from(c.read_u8()?)))?;
        let temperature = cursor.read_counted(|c| Ok(AlarmState::from(c.read_u8()?)))?;
        Ok(Self {
            info_flag,
            command_value,
            cell_count: cell_alarm.len() as u8,
            cell_alarm,
            temperature_count: temperature.len() as u8,
            temperature,
            charge_current: AlarmState::from(cursor.read_u8()?),
            module_voltage: AlarmState::from(cursor.read_u8()?),
            discharge_current: AlarmState::from(cursor.read_u8()?),
            status1: cursor.read_u8()?,
            status2: cursor.read_u8()?,
            status3: cursor.read_u8()?,
            status4: cursor.read_u8()?,
            status5: cursor.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChargeDischargeManagement {
    pub command_value: u8,
    pub charge_voltage_limit: f64,
    pub discharge_voltage_limit: f64,
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
    pub charge_enable: Switch,
    pub discharge_enable: Switch,
    pub charge_immediately1: Switch,
    pub charge_immediately2: Switch,
    pub full_charge_required: Switch,
}

impl Query for ChargeDischargeManagement {
    const COMMAND: Command = Command::ChargeDischargeManagement;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.fixed_cursor(Self::COMMAND, CHARGE_MANAGEMENT_LENGTH)?;
        let command_value = cursor.read_u8()?;
        let charge_voltage_limit = module_voltage(cursor.read_u16()?);
        let discharge_voltage_limit = module_voltage(cursor.read_u16()?);
        let max_charge_current = module_current(cursor.read_i16()?);
        let max_discharge_current = module_current(cursor.read_i16()?);
        let status = cursor.read_u8()?;
        Ok(Self {
            command_value,
            charge_voltage_limit,
            discharge_voltage_limit,
            max_charge_current,
            max_discharge_current,
            charge_enable: read_flag!(status, 0x80),
            discharge_enable: read_flag!(status, 0x40),
            charge_immediately1: read_flag!(status, 0x20),
            charge_immediately2: read_flag!(status, 0x10),
            full_charge_required: read_flag!(status, 0x08),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemParameter {
    pub info_flag: u8,
    pub cell_upper_voltage_limit: f64,
    pub cell_low_voltage_limit: f64,
    pub cell_under_voltage_threshold: f64,
    pub charge_upper_temperature_limit: f64,
    pub charge_lower_temperature_limit: f64,
    pub charge_current_limit: f64,
    pub upper_voltage_limit: f64,
    pub lower_voltage_limit: f64,
    pub under_voltage_limit: f64,
    pub discharge_upper_temperature_limit: f64,
    pub discharge_lower_temperature_limit: f64,
    pub discharge_current_limit: f64,
}

impl Query for SystemParameter {
    const COMMAND: Command = Command::SystemParameter;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.fixed_cursor(Self::COMMAND, SYSTEM_PARAMETER_LENGTH)?;
        Ok(Self {
            info_flag: cursor.read_u8()?,
            cell_upper_voltage_limit: cell_voltage(cursor.read_i16()?),
            cell_low_voltage_limit: cell_voltage(cursor.read_i16()?),
            cell_under_voltage_threshold: cell_voltage(cursor.read_i16()?),
            charge_upper_temperature_limit: temperature(cursor.read_i16()?),
            charge_lower_temperature_limit: temperature(cursor.read_i16()?),
            charge_current_limit: module_current(cursor.read_i16()?),
            upper_voltage_limit: module_voltage(cursor.read_u16()?),
            lower_voltage_limit: module_voltage(cursor.read_u16()?),
            under_voltage_limit: module_voltage(cursor.read_u16()?),
            discharge_upper_temperature_limit: temperature(cursor.read_i16()?),
            discharge_lower_temperature_limit: temperature(cursor.read_i16()?),
            discharge_current_limit: module_current(cursor.read_i16()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SerialNumber {
    pub command_value: u8,
    pub module_serial_number: String,
}

impl Query for SerialNumber {
    const COMMAND: Command = Command::SerialNumber;

    fn decode(header: &Header) -> Result<Self, Error> {
        let mut cursor = header.fixed_cursor(Self::COMMAND, SERIAL_NUMBER_LENGTH)?;
        Ok(Self {
            command_value: cursor.read_u8()?,
            module_serial_number: cursor.read_text(16)?,
        })
    }
}
