//! Simulated backend.
//!
//! Measurement queries (`MEAS:VOLT?`, `VOLT?`, `MEAS?`, case-insensitive) answer with a
//! uniformly distributed reading in `[0, 1)` after a short simulated latency. Any other
//! command leaves the read buffer empty. The dummy also accepts the VISA and HTTP verbs
//! so it can stand in for any transport when a broker runs offline.

use super::{drain_buffer, drain_line, Backend, BackendState, HttpRequest};
use crate::error::AppResult;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Commands that produce a reading.
pub const MEASUREMENT_COMMANDS: [&str; 3] = ["MEAS:VOLT?", "VOLT?", "MEAS?"];

/// Simulated reply latency.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

/// Stateful simulator.
#[derive(Debug)]
pub struct DummyBackend {
    descriptor: String,
    state: BackendState,
    buffer: Vec<u8>,
    latency: Duration,
    writes: usize,
}

impl DummyBackend {
    /// Simulator for `dummy:<name>`.
    pub fn new(name: &str) -> Self {
        Self::standing_in_for(&format!("dummy:{name}"))
    }

    /// Simulator registered under another transport's descriptor.
    pub fn standing_in_for(descriptor: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            state: BackendState::Unopened,
            buffer: Vec::new(),
            latency: DEFAULT_LATENCY,
            writes: 0,
        }
    }

    /// Override the simulated latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of writes accepted so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn respond(&mut self, command: &str) {
        let normalized = command.trim().to_ascii_uppercase();
        if MEASUREMENT_COMMANDS.contains(&normalized.as_str()) {
            std::thread::sleep(self.latency);
            self.buffer = format_reading(rand::thread_rng().gen::<f64>()).into_bytes();
        } else {
            self.buffer.clear();
        }
    }
}

/// Six decimals, truncated so a value below 1 never prints as `1.000000`.
fn format_reading(value: f64) -> String {
    let truncated = (value * 1e6).floor() / 1e6;
    format!("{truncated:.6}")
}

impl Backend for DummyBackend {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn open(&mut self) -> AppResult<()> {
        if self.state.needs_open(&self.descriptor)? {
            self.state = BackendState::Open;
            debug!(descriptor = %self.descriptor, "dummy backend opened");
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.state = BackendState::Closed;
        self.buffer.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == BackendState::Open
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        self.open()?;
        self.writes += 1;
        let command = String::from_utf8_lossy(data).into_owned();
        self.respond(&command);
        Ok(data.len())
    }

    fn read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.open()?;
        Ok(drain_buffer(&mut self.buffer, size))
    }

    fn readline(&mut self) -> AppResult<Vec<u8>> {
        self.open()?;
        Ok(drain_line(&mut self.buffer))
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn clear(&mut self) -> AppResult<()> {
        self.open()?;
        self.buffer.clear();
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> AppResult<()> {
        self.open()
    }

    fn request(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        self.open()?;
        debug!(descriptor = %self.descriptor, method = req.method.as_str(), path = %req.path, "simulated request");
        Ok(Vec::new())
    }
}
