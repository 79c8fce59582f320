use crate::protocol::{twos_complement, Command};
use crate::Error;

/// Bounds checked reader over an ASCII hex payload.
///
/// Every read consumes a fixed number of hex digits. Running past the end of
/// the payload or hitting a non hex digit fails with [`Error::PayloadFormat`].
#[derive(Debug)]
pub struct HexCursor<'a> {
    command: Command,
    payload: &'a [u8],
    position: usize,
}

impl<'a> HexCursor<'a> {
    pub fn new(command: Command, payload: &'a [u8]) -> Self {
        Self {
            command,
            payload,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.position
    }

    fn error(&self, reason: String) -> Error {
        Error::PayloadFormat {
            command: self.command,
            length: self.payload.len(),
            reason,
        }
    }

    /// Moves the cursor to an absolute hex digit offset.
    pub fn seek(&mut self, position: usize) -> Result<(), Error> {
        if position > self.payload.len() {
            return Err(self.error(format!("cannot seek to offset {position}")));
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, digits: usize) -> Result<(), Error> {
        self.take(digits).map(|_| ())
    }

    fn take(&mut self, digits: usize) -> Result<&'a [u8], Error> {
        let end = self.position + digits;
        if end > self.payload.len() {
            return Err(self.error(format!(
                "need {digits} digits at offset {}, only {} left",
                self.position,
                self.remaining()
            )));
        }
        let token = &self.payload[self.position..end];
        self.position = end;
        Ok(token)
    }

    /// Reads `digits` hex digits as an unsigned big endian number.
    pub fn read_unsigned(&mut self, digits: usize) -> Result<u32, Error> {
        let offset = self.position;
        let token = self.take(digits)?;
        if !token.iter().all(u8::is_ascii_hexdigit) {
            return Err(self.error(format!("invalid hex token {token:?} at offset {offset}")));
        }
        std::str::from_utf8(token)
            .ok()
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(|| self.error(format!("invalid hex token {token:?} at offset {offset}")))
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_unsigned(2)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(self.read_unsigned(4)? as u16)
    }

    /// Reads a 4 digit token as a 16 bit two's complement number.
    pub fn read_i16(&mut self) -> Result<i16, Error> {
        Ok(twos_complement(self.read_unsigned(4)?, 16) as i16)
    }

    /// Reads a count byte followed by that many items.
    pub fn read_counted<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, Error>,
    ) -> Result<Vec<T>, Error> {
        let count = self.read_u8()?;
        let mut items = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            items.push(item(self)?);
        }
        Ok(items)
    }

    /// Reads `bytes` hex encoded ASCII bytes as text, trimming trailing NUL padding.
    pub fn read_text(&mut self, bytes: usize) -> Result<String, Error> {
        let mut text = String::with_capacity(bytes);
        for _ in 0..bytes {
            let offset = self.position;
            let byte = self.read_u8()?;
            if !byte.is_ascii() {
                return Err(self.error(format!("non ASCII byte {byte:#04x} at offset {offset}")));
            }
            text.push(char::from(byte));
        }
        Ok(text.trim_end_matches('\0').to_string())
    }
}
