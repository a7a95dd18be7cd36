//! Simulated voltmeter on a `dummy:` channel.

use super::{parse_number, state_suffix, wrong_params, VSense};
use crate::deps::{Dependency, DummyDep};
use crate::descriptor::build_dummy_descriptor;
use crate::error::AppResult;
use crate::tree::params::DummyVoltParams;
use crate::tree::{ensure_connected, Instrument, InstrumentRegistry, Params};
use crate::instrument_any;
use std::fmt;
use std::sync::Arc;

/// Voltmeter backed by `dummy:<key>`.
pub struct DummyVolt {
    params: DummyVoltParams,
    dep: DummyDep,
    last: Option<f64>,
    connected: bool,
}

impl DummyVolt {
    /// Build over an existing dummy channel.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::DummyVolt(params) => params,
            other => return Err(wrong_params("dummy_volt", &other)),
        };
        let dep = dep.as_broker()?.dummy(&build_dummy_descriptor(key))?;
        Ok(Box::new(Self {
            params,
            dep,
            last: None,
            connected: true,
        }))
    }

    /// Descriptor of the dummy channel.
    pub fn descriptor(&self) -> &str {
        self.dep.descriptor()
    }

    /// Free-form label
    pub fn attribute(&self) -> Option<&str> {
        self.params.attribute.as_deref()
    }
}

impl VSense for DummyVolt {
    fn get_voltage(&mut self) -> AppResult<f64> {
        ensure_connected(self.connected, "dummy_volt")?;
        let volts = parse_number(&self.dep.query("MEAS:VOLT?")?)?;
        self.last = Some(volts);
        Ok(volts)
    }
}

impl fmt::Display for DummyVolt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last {
            Some(v) => write!(f, "DummyVolt ({}): last {v:.6} V", self.dep.descriptor())?,
            None => write!(f, "DummyVolt ({})", self.dep.descriptor())?,
        }
        f.write_str(state_suffix(self.connected))
    }
}

impl Instrument for DummyVolt {
    fn kind(&self) -> &'static str {
        "dummy_volt"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.dep.release();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::deps::BrokerDep;

    #[test]
    fn test_reads_through_dummy_channel() {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::new()));
        let mut node = DummyVolt::from_params_with_dep(
            &Dependency::Broker(broker),
            "bench",
            Params::DummyVolt(DummyVoltParams::default()),
            &Arc::new(InstrumentRegistry::standard()),
        )
        .unwrap();
        let volt = node.downcast_mut::<DummyVolt>().unwrap();
        assert_eq!(volt.descriptor(), "dummy:bench");
        let v = volt.get_voltage().unwrap();
        assert!((0.0..1.0).contains(&v));
        assert!(volt.to_string().contains("last"));
    }
}
