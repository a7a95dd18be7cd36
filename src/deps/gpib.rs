//! GPIB addressing over a Prologix serial adapter, and SIM900 slot narrowing.

use super::roles::SerialDep;
use crate::error::AppResult;
use std::time::Duration;
use tracing::trace;

/// Pause between a slot query and reading its reply.
pub const DEFAULT_QUERY_DELAY: Duration = Duration::from_millis(100);

/// A GPIB address on a shared Prologix serial line.
pub struct GpibDep {
    serial: SerialDep,
    address: u8,
    query_delay: Duration,
}

impl GpibDep {
    /// Controller access for one GPIB address.
    pub fn new(serial: SerialDep, address: u8) -> Self {
        Self {
            serial,
            address,
            query_delay: DEFAULT_QUERY_DELAY,
        }
    }

    /// Delay used by slots narrowed from this dependency.
    pub fn with_query_delay(mut self, query_delay: Duration) -> Self {
        self.query_delay = query_delay;
        self
    }

    /// GPIB address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Descriptor of the shared serial channel.
    pub fn descriptor(&self) -> &str {
        self.serial.descriptor()
    }

    /// True when the serial channel is simulated.
    pub fn is_simulated(&self) -> bool {
        self.serial.is_simulated()
    }

    /// Whether this copy has been released.
    pub fn is_released(&self) -> bool {
        self.serial.is_released()
    }

    /// Address the device, then send `command`.
    pub fn write(&self, command: &str) -> AppResult<usize> {
        trace!(address = self.address, command, "gpib write");
        self.serial
            .write_str(&format!("++addr {}\n{}\n", self.address, command))
    }

    /// Read one reply line.
    pub fn readline(&self) -> AppResult<String> {
        self.serial.readline()
    }

    /// Write then read one reply line. Not atomic against other users of the bus.
    pub fn query(&self, command: &str) -> AppResult<String> {
        self.write(command)?;
        self.readline()
    }

    /// Narrow to one mainframe slot.
    pub fn slot(&self, slot: u8) -> SlotDep {
        SlotDep {
            gpib: self.fork(),
            slot,
            query_delay: self.query_delay,
        }
    }

    /// Refuse further I/O through this copy.
    pub fn release(&mut self) {
        self.serial.release();
    }

    /// Unreleased copy sharing the same channel.
    pub fn fork(&self) -> Self {
        Self {
            serial: self.serial.fork(),
            address: self.address,
            query_delay: self.query_delay,
        }
    }
}

/// A module slot inside a SIM900 mainframe.
pub struct SlotDep {
    gpib: GpibDep,
    slot: u8,
    query_delay: Duration,
}

impl SlotDep {
    /// Mainframe slot
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// GPIB address of the mainframe
    pub fn address(&self) -> u8 {
        self.gpib.address()
    }

    /// Descriptor of the shared serial channel.
    pub fn descriptor(&self) -> &str {
        self.gpib.descriptor()
    }

    /// True when the serial channel is simulated.
    pub fn is_simulated(&self) -> bool {
        self.gpib.is_simulated()
    }

    /// Whether this copy has been released.
    pub fn is_released(&self) -> bool {
        self.gpib.is_released()
    }

    /// Connect to the slot, send `command`, and return to the mainframe with the escape string.
    pub fn write(&self, command: &str) -> AppResult<usize> {
        self.gpib
            .write(&format!("CONN {}, \"esc\"\r\n{}\r\nesc", self.slot, command))
    }

    /// Read one reply line.
    pub fn readline(&self) -> AppResult<String> {
        self.gpib.readline()
    }

    /// Write, wait `query_delay` for the module, then read one line.
    pub fn query(&self, command: &str) -> AppResult<String> {
        self.write(command)?;
        std::thread::sleep(self.query_delay);
        self.readline()
    }

    /// Refuse further I/O through this copy.
    pub fn release(&mut self) {
        self.gpib.release();
    }

    /// Unreleased copy sharing the same channel.
    pub fn fork(&self) -> Self {
        Self {
            gpib: self.gpib.fork(),
            slot: self.slot,
            query_delay: self.query_delay,
        }
    }
}
