//! OS serial port backend (`serial:` descriptors).
//!
//! Wraps the serialport crate. Built without the `instrument_serial` feature, `open()`
//! fails with `BackendUnavailable` so callers can substitute a simulated channel.

use super::{Backend, BackendState};
use crate::error::{AppResult, LabError};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};

/// Serial port transport
pub struct SerialBackend {
    descriptor: String,
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    baud_rate: u32,
    /// Read timeout; a stalled read returns what arrived before it fired
    timeout: Duration,
    state: BackendState,
    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialBackend {
    /// Unopened port; nothing touches the device until `open`.
    pub fn new(descriptor: String, port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            descriptor,
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            state: BackendState::Unopened,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// OS name of the port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialBackend {
    fn open_port(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => LabError::BackendUnavailable {
                    descriptor: self.descriptor.clone(),
                    reason: e.to_string(),
                },
                _ => LabError::Io(std::io::Error::from(e)),
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn port(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| LabError::ChannelClosed(self.descriptor.clone()))
    }

    fn io_write(&mut self, data: &[u8]) -> AppResult<usize> {
        let port = self.port()?;
        // Drop stale replies so the next read belongs to this command.
        port.clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::from)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn io_read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        let port = self.port()?;
        let wanted = match size {
            Some(n) => n,
            None => port.bytes_to_read().map_err(std::io::Error::from)? as usize,
        };
        let mut buf = vec![0u8; wanted];
        let mut filled = 0;
        while filled < wanted {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn io_readline(&mut self) -> AppResult<Vec<u8>> {
        let port = self.port()?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(line)
    }

    fn release_port(&mut self) {
        self.port = None;
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SerialBackend {
    fn unavailable(&self) -> LabError {
        LabError::BackendUnavailable {
            descriptor: self.descriptor.clone(),
            reason: "serial support not enabled. Rebuild with --features instrument_serial"
                .to_string(),
        }
    }

    fn open_port(&mut self) -> AppResult<()> {
        Err(self.unavailable())
    }

    fn io_write(&mut self, _data: &[u8]) -> AppResult<usize> {
        Err(self.unavailable())
    }

    fn io_read(&mut self, _size: Option<usize>) -> AppResult<Vec<u8>> {
        Err(self.unavailable())
    }

    fn io_readline(&mut self) -> AppResult<Vec<u8>> {
        Err(self.unavailable())
    }

    fn release_port(&mut self) {}
}

impl Backend for SerialBackend {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn open(&mut self) -> AppResult<()> {
        if self.state.needs_open(&self.descriptor)? {
            self.open_port()?;
            self.state = BackendState::Open;
            info!(
                port = %self.port_name,
                baud = self.baud_rate,
                timeout_ms = self.timeout.as_millis() as u64,
                "serial port opened"
            );
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if self.state == BackendState::Open {
            self.release_port();
            debug!(port = %self.port_name, "serial port closed");
        }
        self.state = BackendState::Closed;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == BackendState::Open
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        self.open()?;
        let written = self.io_write(data)?;
        debug!(port = %self.port_name, bytes = written, "serial write");
        Ok(written)
    }

    fn read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.open()?;
        self.io_read(size)
    }

    fn readline(&mut self) -> AppResult<Vec<u8>> {
        self.open()?;
        self.io_readline()
    }
}
