//! SIM970 quad voltmeter module.

use super::{key_index, parse_number, state_suffix, synthetic_reading, wrong_params, VSense};
use crate::deps::{Dependency, SlotDep};
use crate::error::{AppResult, LabError};
use crate::tree::params::{secs, Sim970Params};
use crate::tree::{ensure_connected, Instrument, InstrumentRegistry, Params};
use crate::instrument_any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Channels per module.
pub const SIM970_CHANNELS: u8 = 4;

/// One input of a SIM970.
pub struct Sim970Channel {
    slot: SlotDep,
    channel: u8,
    settling: Duration,
    max_retries: u32,
    connected: bool,
}

impl Sim970Channel {
    /// 1-based channel number.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// False once the module is disconnected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.slot.release();
        self.connected = false;
    }

    /// Query twice with a settling pause and keep the second reading; retry replies
    /// that do not parse.
    fn measure(&self) -> AppResult<f64> {
        ensure_connected(self.connected, "sim970 channel")?;
        if self.slot.is_simulated() {
            return Ok(synthetic_reading());
        }
        let command = format!("VOLT? {}", self.channel);
        let mut attempt = 0;
        loop {
            self.slot.query(&command)?;
            std::thread::sleep(self.settling);
            let reply = self.slot.query(&command)?;
            match parse_number(&reply) {
                Ok(volts) => return Ok(volts),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        slot = self.slot.slot(),
                        channel = self.channel,
                        attempt,
                        error = %err,
                        "unparseable voltage reading, retrying"
                    );
                }
                Err(_) => {
                    return Err(LabError::InvalidResponse(format!(
                        "could not parse voltage reading '{reply}' after {} retries",
                        self.max_retries
                    )))
                }
            }
        }
    }
}

impl VSense for Sim970Channel {
    fn get_voltage(&mut self) -> AppResult<f64> {
        self.measure()
    }
}

/// SIM970 in a mainframe slot, with its four channels built up front.
pub struct Sim970 {
    params: Sim970Params,
    slot: u8,
    channels: Vec<Sim970Channel>,
    connected: bool,
}

impl Sim970 {
    /// Build over one mainframe slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Sim970(params) => params,
            other => return Err(wrong_params("sim970", &other)),
        };
        let slot = key_index(key)?;
        let gpib = dep.as_gpib()?;
        let channels = (1..=SIM970_CHANNELS)
            .map(|channel| Sim970Channel {
                slot: gpib.slot(slot),
                channel,
                settling: secs(params.settling_time),
                max_retries: params.max_retries,
                connected: true,
            })
            .collect();
        Ok(Box::new(Self {
            params,
            slot,
            channels,
            connected: true,
        }))
    }

    /// Mainframe slot
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Configuration the module was built from.
    pub fn params(&self) -> &Sim970Params {
        &self.params
    }

    /// The four input channels.
    pub fn channels(&self) -> &[Sim970Channel] {
        &self.channels
    }

    /// Channel by 1-based number.
    pub fn channel_mut(&mut self, channel: u8) -> AppResult<&mut Sim970Channel> {
        let capacity = self.channels.len();
        self.channels
            .iter_mut()
            .find(|c| c.channel == channel)
            .ok_or_else(|| LabError::SlotOutOfRange {
                key: channel.to_string(),
                capacity,
            })
    }

    /// Voltage on a 1-based channel.
    pub fn get_voltage(&mut self, channel: u8) -> AppResult<f64> {
        ensure_connected(self.connected, "sim970")?;
        self.channel_mut(channel)?.get_voltage()
    }
}

impl fmt::Display for Sim970 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.channels.iter().filter(|c| c.connected).count();
        write!(
            f,
            "Sim970 (slot {}): {live}/{} channels connected{}",
            self.slot,
            self.channels.len(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Sim970 {
    fn kind(&self) -> &'static str {
        "sim970"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        for channel in &mut self.channels {
            channel.disconnect();
        }
        self.connected = false;
        Ok(())
    }

    instrument_any!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::deps::{BrokerDep, GpibDep};

    fn module() -> Box<dyn Instrument> {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let gpib = GpibDep::new(broker.serial("serial:COM3").unwrap(), 3);
        Sim970::from_params_with_dep(
            &Dependency::Gpib(gpib),
            "1",
            Params::Sim970(Sim970Params::default()),
            &Arc::new(InstrumentRegistry::standard()),
        )
        .unwrap()
    }

    #[test]
    fn test_channels_built_eagerly() {
        let node = module();
        let sim970 = node.downcast_ref::<Sim970>().unwrap();
        let numbers: Vec<u8> = sim970.channels().iter().map(Sim970Channel::channel).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(node.to_string(), "Sim970 (slot 1): 4/4 channels connected");
    }

    #[test]
    fn test_simulated_reading_in_unit_range() {
        let mut node = module();
        let sim970 = node.downcast_mut::<Sim970>().unwrap();
        let volts = sim970.get_voltage(2).unwrap();
        assert!((0.0..1.0).contains(&volts));
        assert!(matches!(
            sim970.get_voltage(5),
            Err(LabError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_disconnect_marks_every_channel() {
        let mut node = module();
        node.disconnect().unwrap();
        node.disconnect().unwrap();
        let sim970 = node.downcast_mut::<Sim970>().unwrap();
        assert!(sim970.channels().iter().all(|c| !c.is_connected()));
        assert!(matches!(
            sim970.get_voltage(1),
            Err(LabError::NotConnected(_))
        ));
    }
}
