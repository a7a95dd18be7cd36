//! Params: serializable node descriptions, discriminated by `type`.

use super::slots::{ChassisSlots, GpibAddresses, MainframeSlots, Named, SlotRule, Slots};
use crate::deps::BrokerMode;
use crate::descriptor::{DEFAULT_SERIAL_BAUD, DEFAULT_SERIAL_TIMEOUT, DEFAULT_VISA_TIMEOUT};
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Description of one instrument node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Params {
    /// `computer`
    Computer(ComputerParams),
    /// `prologix_gpib`
    PrologixGpib(PrologixGpibParams),
    /// `sim900`
    Sim900(Sim900Params),
    /// `sim970`
    Sim970(Sim970Params),
    /// `sim928`
    Sim928(Sim928Params),
    /// `sim921`
    Sim921(Sim921Params),
    /// `dummy_volt`
    DummyVolt(DummyVoltParams),
    /// `keysight53220a`
    #[serde(rename = "keysight53220a")]
    Keysight53220A(Keysight53220AParams),
    /// `dbay`
    #[serde(rename = "dbay")]
    DBay(DBayParams),
    /// `dac4d`
    #[serde(rename = "dac4d", alias = "dac4D")]
    Dac4D(Dac4DParams),
    /// `dac16d`
    #[serde(rename = "dac16d", alias = "dac16D")]
    Dac16D(Dac16DParams),
    /// `empty`
    #[serde(rename = "empty")]
    EmptySlot(EmptySlotParams),
}

impl Params {
    /// The `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Params::Computer(_) => "computer",
            Params::PrologixGpib(_) => "prologix_gpib",
            Params::Sim900(_) => "sim900",
            Params::Sim970(_) => "sim970",
            Params::Sim928(_) => "sim928",
            Params::Sim921(_) => "sim921",
            Params::DummyVolt(_) => "dummy_volt",
            Params::Keysight53220A(_) => "keysight53220a",
            Params::DBay(_) => "dbay",
            Params::Dac4D(_) => "dac4d",
            Params::Dac16D(_) => "dac16d",
            Params::EmptySlot(_) => "empty",
        }
    }

    /// Whether this node can hold children.
    pub fn is_parent(&self) -> bool {
        self.child_count().is_some()
    }

    /// Number of configured children, for parent kinds.
    pub fn child_count(&self) -> Option<usize> {
        match self {
            Params::Computer(p) => Some(p.children.len()),
            Params::PrologixGpib(p) => Some(p.children.len()),
            Params::Sim900(p) => Some(p.children.len()),
            Params::DBay(p) => Some(p.children.len()),
            _ => None,
        }
    }

    /// Children as `(key, params)` pairs; empty for leaf kinds.
    pub fn children(&self) -> Vec<(&str, &Params)> {
        fn collect<R: SlotRule>(slots: &Slots<R>) -> Vec<(&str, &Params)> {
            slots.iter().collect()
        }
        match self {
            Params::Computer(p) => collect(&p.children),
            Params::PrologixGpib(p) => collect(&p.children),
            Params::Sim900(p) => collect(&p.children),
            Params::DBay(p) => collect(&p.children),
            _ => Vec::new(),
        }
    }

    /// Parse one tree from YAML.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}

fn default_query_delay() -> f64 {
    0.1
}

fn default_settling() -> f64 {
    0.1
}

fn default_source_settling() -> f64 {
    0.4
}

fn default_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_baud() -> u32 {
    DEFAULT_SERIAL_BAUD
}

fn default_serial_timeout() -> f64 {
    DEFAULT_SERIAL_TIMEOUT
}

fn default_visa_timeout() -> f64 {
    DEFAULT_VISA_TIMEOUT
}

fn default_threshold_mv() -> f64 {
    -50.0
}

fn default_gate_time() -> f64 {
    1.0
}

/// Root host. Resolves where its children's channels come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerParams {
    /// Where channels come from
    #[serde(default)]
    pub mode: BrokerMode,
    /// Remote broker; `BROKER_URI` is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uri: Option<String>,
    /// Simulate every channel.
    #[serde(default)]
    pub offline: bool,
    /// Simulate channels whose native transport is missing.
    #[serde(default)]
    pub dummy_fallback: bool,
    /// Children by name
    #[serde(flatten)]
    pub children: Slots<Named>,
}

/// Prologix GPIB-USB controller on a serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrologixGpibParams {
    /// Serial port of the controller, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Serial timeout in seconds
    #[serde(default = "default_serial_timeout")]
    pub timeout: f64,
    /// Devices by GPIB address
    #[serde(flatten)]
    pub children: Slots<GpibAddresses>,
}

impl PrologixGpibParams {
    /// Controller on `port` with default serial settings.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: DEFAULT_SERIAL_BAUD,
            timeout: DEFAULT_SERIAL_TIMEOUT,
            children: Slots::new(),
        }
    }
}

/// SRS SIM900 mainframe; its key under the controller is its GPIB address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim900Params {
    /// Seconds between a module query and reading its reply.
    #[serde(default = "default_query_delay")]
    pub query_delay: f64,
    /// Modules by slot
    #[serde(flatten)]
    pub children: Slots<MainframeSlots>,
}

impl Sim900Params {
    /// Pause between a framed query and its reply.
    pub fn query_delay(&self) -> Duration {
        secs(self.query_delay)
    }
}

impl Default for Sim900Params {
    fn default() -> Self {
        Self {
            query_delay: default_query_delay(),
            children: Slots::new(),
        }
    }
}

/// SIM970 four-channel voltmeter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim970Params {
    /// Pause between the two reads of a measurement, in seconds
    #[serde(default = "default_settling")]
    pub settling_time: f64,
    /// Retries for replies that do not parse
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Default for Sim970Params {
    fn default() -> Self {
        Self {
            settling_time: default_settling(),
            max_retries: default_retries(),
            attribute: None,
        }
    }
}

/// SIM928 isolated voltage source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim928Params {
    /// Seconds to wait after an output change
    #[serde(default = "default_source_settling")]
    pub settling_time: f64,
    /// Read the setpoint back after every `set_voltage`.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Default for Sim928Params {
    fn default() -> Self {
        Self {
            settling_time: default_source_settling(),
            verify: true,
            attribute: None,
        }
    }
}

/// SIM921 AC resistance bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sim921Params {
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// Simulated voltmeter on `dummy:<key>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DummyVoltParams {
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// Keysight 53220A universal counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keysight53220AParams {
    /// VISA resource string, e.g. `TCPIP0::10.7.0.5::5025::SOCKET`.
    pub resource: String,
    /// VISA timeout in seconds
    #[serde(default = "default_visa_timeout")]
    pub timeout: f64,
    /// Trigger level in millivolts.
    #[serde(default = "default_threshold_mv")]
    pub threshold_mv: f64,
    /// Gate time in seconds.
    #[serde(default = "default_gate_time")]
    pub gate_time: f64,
}

impl Keysight53220AParams {
    /// Counter on `resource` with default settings.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: DEFAULT_VISA_TIMEOUT,
            threshold_mv: default_threshold_mv(),
            gate_time: default_gate_time(),
        }
    }
}

/// DBay chassis; its key is `host[:port]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DBayParams {
    /// Path prefix of the REST API
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    /// Modules by slot
    #[serde(flatten)]
    pub children: Slots<ChassisSlots>,
}

/// DBay four-channel DAC module; its key is its chassis slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dac4DParams {
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// DBay sixteen-channel DAC module; its key is its chassis slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dac16DParams {
    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// Unoccupied DBay slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptySlotParams {
    /// Name shown for the slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Seconds from config, clamped at zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
