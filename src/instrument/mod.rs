//! Instrument nodes.
//!
//! Each node type has one factory, `from_params_with_dep(dep, key, params, registry)`,
//! which derives the node's own dependency from its parent's and returns the live
//! node. Parents keep the registry so they can build their own children.
//!
//! ## Configuration
//!
//! A bench with a Prologix controller, a SIM900 at GPIB address 3 and a counter:
//!
//! ```yaml
//! type: computer
//! mode: local
//! children:
//!   bus:
//!     type: prologix_gpib
//!     port: /dev/ttyUSB0
//!     children:
//!       3:
//!         type: sim900
//!         children:
//!           1: { type: sim970, settling_time: 0.1 }
//!           5: { type: sim928 }
//!   counter:
//!     type: keysight53220a
//!     resource: TCPIP0::10.7.0.5::5025::SOCKET
//! ```

pub mod capabilities;
pub mod computer;
pub mod dbay;
pub mod dummy_volt;
pub mod keysight;
pub mod prologix;
pub mod sim900;
pub mod sim921;
pub mod sim928;
pub mod sim970;

pub use capabilities::{Counter, VSense, VSource};
pub use computer::Computer;
pub use dbay::{DBay, Dac16D, Dac4D, DacChannel, EmptySlot, ModuleKind, ModuleSummary};
pub use dummy_volt::DummyVolt;
pub use keysight::Keysight53220A;
pub use prologix::PrologixGpib;
pub use sim900::Sim900;
pub use sim921::Sim921;
pub use sim928::Sim928;
pub use sim970::{Sim970, Sim970Channel};

use crate::error::{AppResult, LabError};
use crate::tree::Params;
use rand::Rng;

/// Numeric reply from an instrument.
pub(crate) fn parse_number(reply: &str) -> AppResult<f64> {
    reply
        .trim()
        .parse()
        .map_err(|_| LabError::InvalidResponse(format!("expected a number, got '{}'", reply.trim())))
}

/// Reading returned by simulated channels, uniform in `[0, 1)`.
pub(crate) fn synthetic_reading() -> f64 {
    rand::thread_rng().gen::<f64>()
}

/// Numeric key of a child (GPIB address or slot), canonical decimal only.
pub(crate) fn key_index(key: &str) -> AppResult<u8> {
    key.parse()
        .ok()
        .filter(|index: &u8| index.to_string() == key)
        .ok_or_else(|| LabError::InvalidSlotKey(key.to_string()))
}

/// `TypeMismatch` for a factory handed the wrong Params variant.
pub(crate) fn wrong_params(expected: &str, found: &Params) -> LabError {
    LabError::type_mismatch(format!("{expected} params"), found.kind())
}

/// `" [disconnected]"` suffix for listings.
pub(crate) fn state_suffix(connected: bool) -> &'static str {
    if connected {
        ""
    } else {
        " [disconnected]"
    }
}
