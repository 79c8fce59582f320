use crate::transport::Transport;
use crate::Error;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Some USB RS485 dongles need about 10ms to switch between TX and RX.
pub const MINIMUM_DELAY: Duration = Duration::from_millis(10);
/// Idle time after which a started frame is given up.
pub const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(20);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const READ_CHUNK: usize = 64;
/// Start marker, 12 header digits, up to 0xFFF payload digits, checksum and end marker.
const MAX_FRAME_LENGTH: usize = 1 + 12 + 0x0FFF + 4 + 1;

/// Blocking RS485 link over a serial port.
pub struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.serial.name())
            .field("delay", &self.delay)
            .finish()
    }
}

impl SerialTransport {
    pub fn new(port: &str, baud_rate: u32) -> Result<Self, Error> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_INTERVAL)
            .open()?;
        log::debug!("Opened serial port '{port}' at {baud_rate} baud");
        Ok(Self::from_port(serial))
    }

    /// Wraps an already opened port.
    pub fn from_port(serial: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            serial,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        }
    }

    /// Sets the minimum pause between the last received byte and the next request.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    /// Drops whatever is waiting in the input buffer, at most one frame worth of bytes.
    fn drain(&mut self) -> Result<(), Error> {
        let mut dropped = 0;
        while dropped < MAX_FRAME_LENGTH {
            let pending = self.serial.bytes_to_read()?;
            if pending == 0 {
                return Ok(());
            }
            log::trace!("Got {pending} pending bytes");
            let mut buf = [0u8; READ_CHUNK];
            let received = self.serial.read(&mut buf)?;
            log::trace!("Dropped {received} pending bytes");
            dropped += received;
        }
        log::debug!("Line still busy after dropping {dropped} bytes");
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        // clear all incoming serial to avoid data collision
        self.drain()?;
        self.serial_await_delay();

        let started = Instant::now();
        self.serial.write_all(frame)?;
        self.serial.flush()?;
        log::trace!(
            "send: {:?} in {:?}",
            String::from_utf8_lossy(frame),
            started.elapsed()
        );
        Ok(())
    }

    /// Waits until `timeout` for the start marker, then collects bytes up to the end
    /// marker. A started frame is dropped once the line stays idle for
    /// [`INTER_BYTE_TIMEOUT`] or the frame outgrows the longest valid packet.
    fn receive_frame(
        &mut self,
        timeout: Duration,
        start: u8,
        end: u8,
    ) -> Result<Option<Vec<u8>>, Error> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::new();
        let mut last_byte = Instant::now();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let now = Instant::now();
            if frame.is_empty() {
                if now >= deadline {
                    self.last_execution = now;
                    return Ok(None);
                }
            } else if now.duration_since(last_byte) >= INTER_BYTE_TIMEOUT {
                log::debug!(
                    "Dropping incomplete frame of {} bytes after {INTER_BYTE_TIMEOUT:?} idle",
                    frame.len()
                );
                self.last_execution = now;
                return Ok(None);
            }

            let pending = self.serial.bytes_to_read()? as usize;
            if pending == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            let received = self.serial.read(&mut buf[..pending.min(READ_CHUNK)])?;
            last_byte = Instant::now();
            for (index, byte) in buf[..received].iter().enumerate() {
                if frame.is_empty() && *byte != start {
                    continue;
                }
                frame.push(*byte);
                if *byte == end {
                    let leftover = received - index - 1;
                    if leftover > 0 {
                        log::trace!("Ignoring {leftover} bytes after end marker");
                    }
                    self.last_execution = Instant::now();
                    log::trace!("receive_frame: {:?}", String::from_utf8_lossy(&frame));
                    return Ok(Some(frame));
                }
                if frame.len() >= MAX_FRAME_LENGTH {
                    log::debug!("Dropping unterminated frame of {} bytes", frame.len());
                    frame.clear();
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serialport::{SerialPort, TTYPort};
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn pair() -> (TTYPort, SerialTransport) {
        let (master, slave) = TTYPort::pair().expect("Cannot open pty pair");
        (master, SerialTransport::from_port(Box::new(slave)))
    }

    /// Writes each chunk from another thread after `pause`. Joining returns the master end.
    fn feed(
        mut master: TTYPort,
        chunks: Vec<&'static [u8]>,
        pause: Duration,
    ) -> thread::JoinHandle<TTYPort> {
        thread::spawn(move || {
            for chunk in chunks {
                thread::sleep(pause);
                master.write_all(chunk).unwrap();
            }
            master
        })
    }

    #[test]
    fn frame_after_leading_noise() {
        let (mut master, mut transport) = pair();
        master.write_all(b"\x00xx\r~20024600\r").unwrap();

        let frame = transport.receive_frame(TIMEOUT, b'~', b'\r').unwrap();
        assert_eq!(frame.as_deref(), Some(&b"~20024600\r"[..]));
    }

    #[test]
    fn frame_split_across_writes() {
        let (master, mut transport) = pair();
        let chunks = vec![&b"~2002"[..], &b"4600\r"[..]];
        let writer = feed(master, chunks, Duration::from_millis(5));

        let frame = transport.receive_frame(TIMEOUT, b'~', b'\r').unwrap();
        assert_eq!(frame.as_deref(), Some(&b"~20024600\r"[..]));
        writer.join().unwrap();
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let (mut master, mut transport) = pair();
        master.write_all(b"~200246").unwrap();

        let started = Instant::now();
        assert_eq!(transport.receive_frame(TIMEOUT, b'~', b'\r').unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn silent_line_times_out() {
        let (_master, mut transport) = pair();

        let started = Instant::now();
        assert_eq!(transport.receive_frame(TIMEOUT, b'~', b'\r').unwrap(), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= TIMEOUT);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn noisy_line_times_out() {
        let (master, mut transport) = pair();
        let writer = feed(master, vec![&b"x"[..]; 100], Duration::from_millis(5));

        let started = Instant::now();
        assert_eq!(transport.receive_frame(TIMEOUT, b'~', b'\r').unwrap(), None);
        assert!(started.elapsed() < TIMEOUT * 4);
        writer.join().unwrap();
    }

    #[test]
    fn send_drains_input_and_waits_for_delay() {
        let begin = Instant::now();
        let (mut master, mut transport) = pair();
        transport.set_delay(Duration::from_millis(50));
        master.write_all(b"stale reply\r").unwrap();
        thread::sleep(Duration::from_millis(10));

        transport.send(b"~ABC\r").unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert_eq!(transport.serial.bytes_to_read().unwrap(), 0);

        master.set_timeout(Duration::from_secs(1)).unwrap();
        let mut sent = [0u8; 5];
        master.read_exact(&mut sent).unwrap();
        assert_eq!(&sent, b"~ABC\r");
    }
}
