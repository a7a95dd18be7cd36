//! Capability traits shared by instruments of different makes.
//!
//! Measurement procedures take `&mut dyn VSource` and friends rather than concrete
//! instrument types, so a SIM928 and a DBay DAC channel are interchangeable.

use crate::error::AppResult;

/// Capability for instruments that source a voltage.
pub trait VSource: Send {
    /// Set the output in volts.
    fn set_voltage(&mut self, volts: f64) -> AppResult<()>;
    /// Enable the output.
    fn turn_on(&mut self) -> AppResult<()>;
    /// Disable the output.
    fn turn_off(&mut self) -> AppResult<()>;
}

/// Capability for instruments that measure a voltage.
pub trait VSense: Send {
    /// Read the input in volts.
    fn get_voltage(&mut self) -> AppResult<f64>;
}

/// Capability for event counters.
pub trait Counter: Send {
    /// Count events over `gate_time` seconds.
    fn count(&mut self, gate_time: f64) -> AppResult<u64>;
    /// Gate time in seconds.
    fn set_gate_time(&mut self, gate_time: f64) -> AppResult<()>;
    /// Trigger level in millivolts.
    fn set_threshold(&mut self, millivolts: f64) -> AppResult<()>;
}
