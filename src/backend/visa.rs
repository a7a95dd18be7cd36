//! VISA backend (`visa:` descriptors) for GPIB/USB/Ethernet instruments.
//!
//! Wraps the visa-rs crate. Built without the `instrument_visa` feature, `open()` fails
//! with `BackendUnavailable`.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::10.7.0.114::5025::SOCKET" (Ethernet socket)

use super::{Backend, BackendState};
use crate::error::{AppResult, LabError};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Largest single VISA read when no size is requested.
const READ_CHUNK: usize = 4096;

/// VISA session transport
pub struct VisaBackend {
    descriptor: String,
    resource: String,
    timeout: Duration,
    state: BackendState,
    #[cfg(feature = "instrument_visa")]
    session: Option<(DefaultRM, visa_rs::Instrument)>,
}

impl VisaBackend {
    /// Unopened session on `resource`.
    pub fn new(descriptor: String, resource: &str, timeout: Duration) -> Self {
        Self {
            descriptor,
            resource: resource.to_string(),
            timeout,
            state: BackendState::Unopened,
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    /// VISA resource string.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// Commands are newline terminated on the wire.
fn terminated(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(feature = "instrument_visa")]
fn visa_io(err: visa_rs::Error) -> LabError {
    LabError::Io(std::io::Error::other(err.to_string()))
}

#[cfg(feature = "instrument_visa")]
impl VisaBackend {
    fn open_session(&mut self) -> AppResult<()> {
        let rm = DefaultRM::new().map_err(|e| LabError::BackendUnavailable {
            descriptor: self.descriptor.clone(),
            reason: format!("VISA resource manager unavailable: {e}"),
        })?;
        let c_string = CString::new(self.resource.as_str())
            .map_err(|e| LabError::InvalidDescriptor(e.to_string()))?;
        let visa_string = visa_rs::VisaString::from(c_string);
        let session = rm
            .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(visa_io)?;
        self.session = Some((rm, session));
        self.apply_timeout(self.timeout)
    }

    fn session(&mut self) -> AppResult<&mut visa_rs::Instrument> {
        self.session
            .as_mut()
            .map(|(_, session)| session)
            .ok_or_else(|| LabError::ChannelClosed(self.descriptor.clone()))
    }

    fn apply_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        let ms = timeout_ms(timeout);
        let attr = visa_rs::attribute::AttrTmoValue::new_checked(ms)
            .ok_or_else(|| LabError::Config(format!("VISA timeout {ms} ms out of range")))?;
        self.session()?.set_attr(attr).map_err(visa_io)
    }

    fn io_write(&mut self, data: &[u8]) -> AppResult<usize> {
        let session = self.session()?;
        session.write_all(&terminated(data))?;
        Ok(data.len())
    }

    fn io_read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        let session = self.session()?;
        let mut buf = vec![0u8; size.unwrap_or(READ_CHUNK)];
        let n = session.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn io_clear(&mut self) -> AppResult<()> {
        self.session()?.clear().map_err(visa_io)
    }

    fn release_session(&mut self) {
        self.session = None;
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl VisaBackend {
    fn unavailable(&self) -> LabError {
        LabError::BackendUnavailable {
            descriptor: self.descriptor.clone(),
            reason: "VISA support not enabled. Rebuild with --features instrument_visa"
                .to_string(),
        }
    }

    fn open_session(&mut self) -> AppResult<()> {
        Err(self.unavailable())
    }

    fn apply_timeout(&mut self, _timeout: Duration) -> AppResult<()> {
        Err(self.unavailable())
    }

    fn io_write(&mut self, data: &[u8]) -> AppResult<usize> {
        let _ = terminated(data);
        Err(self.unavailable())
    }

    fn io_read(&mut self, _size: Option<usize>) -> AppResult<Vec<u8>> {
        Err(self.unavailable())
    }

    fn io_clear(&mut self) -> AppResult<()> {
        Err(self.unavailable())
    }

    fn release_session(&mut self) {}
}

impl Backend for VisaBackend {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn open(&mut self) -> AppResult<()> {
        if self.state.needs_open(&self.descriptor)? {
            self.open_session()?;
            self.state = BackendState::Open;
            info!(
                resource = %self.resource,
                timeout_ms = timeout_ms(self.timeout),
                "VISA session opened"
            );
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if self.state == BackendState::Open {
            self.release_session();
            debug!(resource = %self.resource, "VISA session closed");
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
        debug!(resource = %self.resource, command = %String::from_utf8_lossy(data).trim(), "VISA write");
        Ok(written)
    }

    fn read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.open()?;
        self.io_read(size)
    }

    /// VISA reads terminate at the end of a message, which is one line.
    fn readline(&mut self) -> AppResult<Vec<u8>> {
        self.open()?;
        self.io_read(None)
    }

    fn clear(&mut self) -> AppResult<()> {
        self.open()?;
        self.io_clear()
    }

    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.open()?;
        self.apply_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_newline_terminated() {
        assert_eq!(terminated(b"*IDN?"), b"*IDN?\n");
        assert_eq!(terminated(b"READ?\n"), b"READ?\n");
    }

    #[test]
    fn test_timeout_in_milliseconds() {
        assert_eq!(timeout_ms(Duration::from_secs_f64(2.5)), 2500);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_open_without_feature_is_unavailable() {
        let mut backend = VisaBackend::new(
            "visa:GPIB0::5::INSTR?timeout=5.0".into(),
            "GPIB0::5::INSTR",
            Duration::from_secs(5),
        );
        assert!(matches!(
            backend.open(),
            Err(LabError::BackendUnavailable { .. })
        ));
        assert!(!backend.is_open());
        assert_eq!(backend.resource(), "GPIB0::5::INSTR");
    }
}
