//! Keysight 53220A universal counter over VISA.

use super::{parse_number, state_suffix, wrong_params, Counter};
use crate::deps::{Dependency, VisaDep};
use crate::descriptor::build_visa_descriptor;
use crate::error::{AppResult, LabError};
use crate::tree::params::Keysight53220AParams;
use crate::tree::{ensure_connected, Instrument, InstrumentRegistry, Params};
use crate::instrument_any;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Gate times closer than this are treated as equal.
const GATE_TOLERANCE: f64 = 1e-3;

/// Keysight 53220A universal counter.
pub struct Keysight53220A {
    visa: VisaDep,
    gate_time: f64,
    threshold_mv: f64,
    connected: bool,
}

impl Keysight53220A {
    /// Open the session and apply the configured threshold and gate time.
    pub fn new(visa: VisaDep, params: &Keysight53220AParams) -> AppResult<Self> {
        let mut counter = Self {
            visa,
            gate_time: params.gate_time,
            threshold_mv: params.threshold_mv,
            connected: true,
        };
        counter.set_threshold(params.threshold_mv)?;
        counter.set_gate_time(params.gate_time)?;
        info!(descriptor = %counter.visa.descriptor(), "counter configured");
        Ok(counter)
    }

    /// Build over an existing VISA channel.
    pub fn from_params_with_dep(
        dep: &Dependency,
        _key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Keysight53220A(params) => params,
            other => return Err(wrong_params("keysight53220a", &other)),
        };
        let descriptor = build_visa_descriptor(&params.resource, params.timeout);
        let visa = dep.as_broker()?.visa(&descriptor)?;
        Ok(Box::new(Self::new(visa, &params)?))
    }

    /// Gate time in seconds
    pub fn gate_time(&self) -> f64 {
        self.gate_time
    }

    /// Trigger threshold in millivolts
    pub fn threshold_mv(&self) -> f64 {
        self.threshold_mv
    }

    /// One `READ?`; the first comma-separated field is the frequency.
    pub fn read_counts(&self) -> AppResult<f64> {
        ensure_connected(self.connected, "keysight53220a")?;
        if self.visa.is_simulated() {
            return Ok(f64::from(rand::thread_rng().gen_range(1000..=10000u32)));
        }
        let reply = self.visa.query("READ?")?;
        let first = reply.split(',').next().unwrap_or_default().trim();
        if first.is_empty() {
            return Ok(0.0);
        }
        parse_number(first)
    }

    /// Send `*RST`; a no-op when simulated.
    pub fn reset(&self) -> AppResult<()> {
        ensure_connected(self.connected, "keysight53220a")?;
        if !self.visa.is_simulated() {
            self.visa.write("*RST")?;
        }
        Ok(())
    }
}

impl Counter for Keysight53220A {
    fn count(&mut self, gate_time: f64) -> AppResult<u64> {
        if (gate_time - self.gate_time).abs() > GATE_TOLERANCE {
            self.set_gate_time(gate_time)?;
        }
        let frequency = self.read_counts()?;
        Ok((frequency * gate_time).max(0.0) as u64)
    }

    fn set_gate_time(&mut self, gate_time: f64) -> AppResult<()> {
        ensure_connected(self.connected, "keysight53220a")?;
        if gate_time.is_nan() || gate_time <= 0.0 {
            return Err(LabError::Config(format!("gate time must be positive, got {gate_time}")));
        }
        if !self.visa.is_simulated() {
            self.visa.write(&format!("SENS:FREQ:GATE:TIME {gate_time}"))?;
        }
        debug!(gate_time, "counter gate time");
        self.gate_time = gate_time;
        Ok(())
    }

    fn set_threshold(&mut self, millivolts: f64) -> AppResult<()> {
        ensure_connected(self.connected, "keysight53220a")?;
        if !self.visa.is_simulated() {
            self.visa.write(&format!("INP:LEV {}", millivolts / 1000.0))?;
        }
        self.threshold_mv = millivolts;
        Ok(())
    }
}

impl fmt::Display for Keysight53220A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Keysight53220A ({}): gate {} s, threshold {} mV{}",
            self.visa.descriptor(),
            self.gate_time,
            self.threshold_mv,
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Keysight53220A {
    fn kind(&self) -> &'static str {
        "keysight53220a"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.visa.release();
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

    fn counter() -> Box<dyn Instrument> {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        Keysight53220A::from_params_with_dep(
            &Dependency::Broker(broker),
            "counter",
            Params::Keysight53220A(Keysight53220AParams::new("TCPIP0::10.7.0.5::5025::SOCKET")),
            &Arc::new(InstrumentRegistry::standard()),
        )
        .unwrap()
    }

    #[test]
    fn test_simulated_counts() {
        let mut node = counter();
        let counter = node.downcast_mut::<Keysight53220A>().unwrap();
        let counts = counter.count(1.0).unwrap();
        assert!((1000..=10000).contains(&counts));
        counter.count(0.5).unwrap();
        assert_eq!(counter.gate_time(), 0.5);
    }

    #[test]
    fn test_rejects_non_positive_gate() {
        let mut node = counter();
        let counter = node.downcast_mut::<Keysight53220A>().unwrap();
        assert!(matches!(counter.set_gate_time(0.0), Err(LabError::Config(_))));
        assert_eq!(counter.threshold_mv(), -50.0);
    }
}
