//! SRS SIM900 mainframe.
//!
//! A child of the Prologix controller (its key is its GPIB address) and a parent of
//! the SIM modules in its slots. It narrows the controller's serial dependency to a
//! GPIB address; each module narrows that again to its slot.

use super::{key_index, state_suffix, wrong_params};
use crate::deps::{Dependency, GpibDep};
use crate::error::AppResult;
use crate::tree::params::Sim900Params;
use crate::tree::{ensure_connected, ChildNodes, Instrument, InstrumentRegistry, Params, Parent};
use crate::{instrument_any, instrument_parent};
use std::fmt;
use std::sync::Arc;

/// SIM900 mainframe.
pub struct Sim900 {
    params: Sim900Params,
    gpib: GpibDep,
    children: ChildNodes,
    connected: bool,
}

impl Sim900 {
    /// Build over one address of a controller.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Sim900(params) => params,
            other => return Err(wrong_params("sim900", &other)),
        };
        let address = key_index(key)?;
        let gpib = GpibDep::new(dep.as_serial()?.fork(), address)
            .with_query_delay(params.query_delay());
        Ok(Box::new(Self {
            params,
            gpib,
            children: ChildNodes::new(registry.clone()),
            connected: true,
        }))
    }

    /// GPIB address
    pub fn address(&self) -> u8 {
        self.gpib.address()
    }

    /// Identification string of the mainframe.
    pub fn identify(&self) -> AppResult<String> {
        ensure_connected(self.connected, "sim900")?;
        self.gpib.query("*IDN?")
    }
}

impl fmt::Display for Sim900 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sim900 (GPIB {}, {}/{} slots used){}",
            self.gpib.address(),
            self.children.len(),
            self.params.children.capacity(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Sim900 {
    fn kind(&self) -> &'static str {
        "sim900"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.children.disconnect_all();
        self.gpib.release();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
    instrument_parent!();
}

impl Parent for Sim900 {
    fn dependency(&self) -> AppResult<Dependency> {
        ensure_connected(self.connected, "sim900")?;
        Ok(Dependency::Gpib(self.gpib.fork()))
    }

    fn capacity(&self) -> usize {
        self.params.children.capacity()
    }

    fn child(&self, key: &str) -> Option<&dyn Instrument> {
        self.children.get(key)
    }

    fn child_mut(&mut self, key: &str) -> Option<&mut dyn Instrument> {
        self.children.get_mut(key)
    }

    fn children(&self) -> Vec<(&str, &dyn Instrument)> {
        self.children.list()
    }

    fn add_child(&mut self, key: &str, params: Params) -> AppResult<&mut dyn Instrument> {
        let dep = self.dependency()?;
        self.children
            .attach(&mut self.params.children, key, params, dep)
    }

    fn init_children(&mut self) -> AppResult<()> {
        ensure_connected(self.connected, "sim900")?;
        let gpib = &self.gpib;
        self.children
            .init_from(&self.params.children, || Ok(Dependency::Gpib(gpib.fork())))
    }
}
