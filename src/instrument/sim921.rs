//! SIM921 AC resistance bridge module.

use super::{key_index, parse_number, state_suffix, synthetic_reading, wrong_params};
use crate::deps::{Dependency, SlotDep};
use crate::error::AppResult;
use crate::tree::params::Sim921Params;
use crate::tree::{ensure_connected, Instrument, InstrumentRegistry, Params};
use crate::instrument_any;
use std::fmt;
use std::sync::Arc;

/// SIM921 resistance bridge.
pub struct Sim921 {
    params: Sim921Params,
    slot: SlotDep,
    connected: bool,
}

impl Sim921 {
    /// Build over one mainframe slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Sim921(params) => params,
            other => return Err(wrong_params("sim921", &other)),
        };
        let slot = dep.as_gpib()?.slot(key_index(key)?);
        Ok(Box::new(Self {
            params,
            slot,
            connected: true,
        }))
    }

    /// Free-form label
    pub fn attribute(&self) -> Option<&str> {
        self.params.attribute.as_deref()
    }

    /// Resistance in ohms.
    pub fn get_resistance(&self) -> AppResult<f64> {
        ensure_connected(self.connected, "sim921")?;
        if self.slot.is_simulated() {
            return Ok(synthetic_reading());
        }
        parse_number(&self.slot.query("RVAL?")?)
    }
}

impl fmt::Display for Sim921 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sim921 (slot {}){}", self.slot.slot(), state_suffix(self.connected))
    }
}

impl Instrument for Sim921 {
    fn kind(&self) -> &'static str {
        "sim921"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.slot.release();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
}
