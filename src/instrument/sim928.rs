//! SIM928 isolated voltage source module.

use super::{key_index, parse_number, state_suffix, wrong_params, VSource};
use crate::deps::{Dependency, SlotDep};
use crate::error::{AppResult, LabError};
use crate::tree::params::{secs, Sim928Params};
use crate::tree::{ensure_connected, Instrument, InstrumentRegistry, Params};
use crate::instrument_any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Setpoint resolution of the module, in volts.
const RESOLUTION: f64 = 1e-3;

/// SIM928 in a mainframe slot.
pub struct Sim928 {
    params: Sim928Params,
    slot: SlotDep,
    settling: Duration,
    setpoint: Option<f64>,
    output_on: bool,
    connected: bool,
}

impl Sim928 {
    /// Factory: `dep` must be the mainframe's GPIB dependency and `key` the slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Sim928(params) => params,
            other => return Err(wrong_params("sim928", &other)),
        };
        let slot = dep.as_gpib()?.slot(key_index(key)?);
        Ok(Box::new(Self {
            settling: secs(params.settling_time),
            params,
            slot,
            setpoint: None,
            output_on: false,
            connected: true,
        }))
    }

    /// Last voltage written, if any.
    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }

    /// Whether the output relay is closed.
    pub fn is_output_on(&self) -> bool {
        self.output_on
    }

    /// Wait for the output to settle after a change. Simulated slots do not wait.
    fn settle(&self) {
        if !self.settling.is_zero() && !self.slot.is_simulated() {
            std::thread::sleep(self.settling);
        }
    }

    fn verify(&self, expected: f64) -> AppResult<()> {
        if !self.params.verify || self.slot.is_simulated() {
            return Ok(());
        }
        let actual = parse_number(&self.slot.query("VOLT?")?)?;
        if (actual - expected).abs() > RESOLUTION / 2.0 {
            return Err(LabError::VerificationFailed {
                quantity: "voltage".to_string(),
                expected: format!("{expected:.3}"),
                actual: format!("{actual:.3}"),
            });
        }
        Ok(())
    }
}

impl VSource for Sim928 {
    fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        ensure_connected(self.connected, "sim928")?;
        let command = format!("VOLT {volts:.3}");
        self.slot.write(&command)?;
        let written = (volts / RESOLUTION).round() * RESOLUTION;
        self.setpoint = Some(written);
        debug!(slot = self.slot.slot(), volts = written, "sim928 setpoint");
        self.settle();
        self.verify(written)
    }

    fn turn_on(&mut self) -> AppResult<()> {
        ensure_connected(self.connected, "sim928")?;
        self.slot.write("OPON")?;
        self.output_on = true;
        self.settle();
        Ok(())
    }

    fn turn_off(&mut self) -> AppResult<()> {
        ensure_connected(self.connected, "sim928")?;
        self.slot.write("OPOF")?;
        self.output_on = false;
        Ok(())
    }
}

impl fmt::Display for Sim928 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let setpoint = match self.setpoint {
            Some(v) => format!("{v:.3} V"),
            None => "unset".to_string(),
        };
        let output = if self.output_on { "on" } else { "off" };
        write!(
            f,
            "Sim928 (slot {}): {setpoint}, output {output}{}",
            self.slot.slot(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Sim928 {
    fn kind(&self) -> &'static str {
        "sim928"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// Switches the output off before letting go of the slot.
    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = if self.output_on {
            self.slot.write("OPOF").map(|_| ())
        } else {
            Ok(())
        };
        self.output_on = false;
        self.slot.release();
        self.connected = false;
        if let Err(err) = &result {
            warn!(slot = self.slot.slot(), error = %err, "sim928 output may still be on");
        }
        result.map_err(|err| LabError::TeardownIncomplete(vec![err]))
    }

    instrument_any!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::deps::{BrokerDep, GpibDep};

    fn source() -> Box<dyn Instrument> {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let gpib = GpibDep::new(broker.serial("serial:COM3").unwrap(), 3);
        Sim928::from_params_with_dep(
            &Dependency::Gpib(gpib),
            "5",
            Params::Sim928(Sim928Params::default()),
            &Arc::new(InstrumentRegistry::standard()),
        )
        .unwrap()
    }

    #[test]
    fn test_setpoint_rounds_to_millivolts() {
        let mut node = source();
        let sim928 = node.downcast_mut::<Sim928>().unwrap();
        sim928.set_voltage(1.23456).unwrap();
        sim928.turn_on().unwrap();
        assert_eq!(sim928.to_string(), "Sim928 (slot 5): 1.235 V, output on");
    }

    #[test]
    fn test_disconnect_turns_output_off() {
        let mut node = source();
        node.downcast_mut::<Sim928>().unwrap().turn_on().unwrap();
        node.disconnect().unwrap();
        let sim928 = node.downcast_ref::<Sim928>().unwrap();
        assert!(!sim928.is_output_on());
        assert!(!node.is_connected());
    }
}
