//! Prologix GPIB-USB controller.
//!
//! The controller is a serial port; devices on its bus are children keyed by GPIB
//! address. Every device shares the one serial channel held by the broker.

use super::{state_suffix, wrong_params};
use crate::deps::{BrokerDep, Dependency, SerialDep};
use crate::descriptor::build_serial_descriptor;
use crate::error::AppResult;
use crate::tree::params::PrologixGpibParams;
use crate::tree::{ensure_connected, ChildNodes, Instrument, InstrumentRegistry, Params, Parent};
use crate::{instrument_any, instrument_parent};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// GPIB bus controller on a serial port.
pub struct PrologixGpib {
    params: PrologixGpibParams,
    serial: SerialDep,
    children: ChildNodes,
    connected: bool,
}

impl PrologixGpib {
    /// Acquire the controller's serial channel through `broker`.
    pub fn new(
        broker: &BrokerDep,
        params: PrologixGpibParams,
        registry: Arc<InstrumentRegistry>,
    ) -> AppResult<Self> {
        let descriptor = build_serial_descriptor(&params.port, params.baud, params.timeout);
        let serial = broker.serial(&descriptor)?;
        debug!(descriptor = %serial.descriptor(), "prologix controller attached");
        Ok(Self {
            params,
            serial,
            children: ChildNodes::new(registry),
            connected: true,
        })
    }

    /// Build over an existing serial channel.
    pub fn from_params_with_dep(
        dep: &Dependency,
        _key: &str,
        params: Params,
        registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::PrologixGpib(params) => params,
            other => return Err(wrong_params("prologix_gpib", &other)),
        };
        Ok(Box::new(Self::new(dep.as_broker()?, params, registry.clone())?))
    }

    /// Descriptor of the serial channel.
    pub fn descriptor(&self) -> &str {
        self.serial.descriptor()
    }

    /// Put the adapter in controller mode with read-after-write enabled.
    pub fn configure_controller(&self) -> AppResult<()> {
        ensure_connected(self.connected, "prologix_gpib")?;
        self.serial.write_str("++mode 1\n++auto 1\n")?;
        Ok(())
    }
}

impl fmt::Display for PrologixGpib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrologixGpib ({}, {} devices){}",
            self.params.port,
            self.children.len(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for PrologixGpib {
    fn kind(&self) -> &'static str {
        "prologix_gpib"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.children.disconnect_all();
        self.serial.release();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
    instrument_parent!();
}

impl Parent for PrologixGpib {
    fn dependency(&self) -> AppResult<Dependency> {
        ensure_connected(self.connected, "prologix_gpib")?;
        Ok(Dependency::Serial(self.serial.fork()))
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
        ensure_connected(self.connected, "prologix_gpib")?;
        let serial = &self.serial;
        self.children
            .init_from(&self.params.children, || Ok(Dependency::Serial(serial.fork())))
    }
}
