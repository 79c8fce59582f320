use crate::protocol::{Command, ResponseCode};

/// Errors raised by the protocol stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No frame arrived before the deadline.
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),
    /// Frame too short or start/end marker missing.
    #[error("Framing error: {0}")]
    Framing(String),
    /// Checksum trailer does not match the packet content.
    #[error("Checksum error: calculated={calculated:04X} received={received:04X}")]
    Checksum { calculated: u16, received: u16 },
    /// Header fields are inconsistent with the received packet.
    #[error("Header error: {0}")]
    Header(String),
    /// The payload does not have the layout the command requires.
    #[error("Payload format error for {command}: {reason} (payload length {length})")]
    PayloadFormat {
        command: Command,
        length: usize,
        reason: String,
    },
    /// The battery answered with a non-zero return code.
    #[error("Battery returned error code: {0}")]
    Response(ResponseCode),
    /// Unknown command name passed to the orchestrator.
    #[error("Invalid command '{0}'")]
    ProtocolMisuse(String),
    /// Group or module index cannot be encoded into an address.
    #[error("Address out of range: group={group} module={module}")]
    AddressOutOfRange { group: u8, module: usize },
    /// The retry policy gave up on a command.
    #[error("Communication lost: {command} failed after {attempts} attempts")]
    CommunicationLost { command: Command, attempts: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Cannot serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for transient bus errors which are answered with a retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Framing(_)
                | Error::Checksum { .. }
                | Error::Header(_)
                | Error::PayloadFormat { .. }
                | Error::Response(_)
        )
    }
}
