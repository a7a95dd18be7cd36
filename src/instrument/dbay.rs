//! DBay chassis and its modules over the chassis REST API.
//!
//! The chassis key under a computer is `host[:port]`; modules are keyed by slot.
//! A module reads its channel state from `GET full-state` when it is built, and
//! every change is a `PUT` on the module's endpoint (`dac4D/vsource/`,
//! `dac16D/vsource/`) carrying the full channel configuration. The DAC16D also
//! accepts one change for several channels (`dac16D/vsource_shared/`) and drives a
//! separate VSB rail (`dac16D/vsb/`).

use super::{key_index, state_suffix, wrong_params, VSource};
use crate::deps::{Dependency, HttpDep};
use crate::descriptor::build_http_descriptor;
use crate::error::{AppResult, LabError};
use crate::tree::params::{DBayParams, Dac16DParams, Dac4DParams};
use crate::tree::{ensure_connected, ChildNodes, Instrument, InstrumentRegistry, Params, Parent};
use crate::{instrument_any, instrument_parent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Port of the chassis server when the key has none.
pub const DEFAULT_DBAY_PORT: u16 = 8345;

/// Channels per DAC4D module.
pub const DAC4D_CHANNELS: u8 = 4;

/// Channels per DAC16D module.
pub const DAC16D_CHANNELS: usize = 16;

const FULL_STATE: &str = "full-state";
const DAC4D_VSOURCE: &str = "dac4D/vsource/";
const DAC16D_VSOURCE: &str = "dac16D/vsource/";
const DAC16D_VSOURCE_SHARED: &str = "dac16D/vsource_shared/";
const DAC16D_VSB: &str = "dac16D/vsb/";

/// Split a chassis key into host and port.
pub fn parse_chassis_key(key: &str) -> AppResult<(String, u16)> {
    let key = key.trim();
    let (host, port) = match key.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| LabError::InvalidSlotKey(key.to_string()))?;
            (host, port)
        }
        None => (key, DEFAULT_DBAY_PORT),
    };
    if host.is_empty() {
        return Err(LabError::InvalidSlotKey(key.to_string()));
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Default, Deserialize)]
struct FullState {
    #[serde(default)]
    data: Vec<ModuleState>,
}

#[derive(Debug, Deserialize)]
struct ModuleState {
    #[serde(default)]
    core: Option<Core>,
    #[serde(default)]
    vsource: Option<VsourceState>,
    #[serde(default)]
    vsb: Option<ChannelState>,
}

impl ModuleState {
    fn slot(&self) -> Option<u8> {
        self.core.as_ref().map(|c| c.slot)
    }

    fn channels(&self) -> &[ChannelState] {
        self.vsource.as_ref().map_or(&[], |v| v.channels.as_slice())
    }
}

/// Identity block shared by every chassis module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Core {
    /// Module type as the chassis names it (`dac4D`, `dac16D`, `empty`)
    #[serde(rename = "type")]
    pub module_type: String,
    /// Chassis slot
    pub slot: u8,
    /// User-assigned module name
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct VsourceState {
    #[serde(default)]
    channels: Vec<ChannelState>,
}

/// Configuration of one DAC channel as the chassis reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Channel number within the module
    pub index: u8,
    /// Output setpoint in volts
    #[serde(default)]
    pub bias_voltage: f64,
    /// Output enabled
    #[serde(default)]
    pub activated: bool,
    /// Label shown on the chassis display
    #[serde(default)]
    pub heading_text: String,
    /// Readback running
    #[serde(default)]
    pub measuring: bool,
}

/// Body of a single-channel `PUT .../vsource/` and of `PUT dac16D/vsb/`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VsourceChange {
    /// Slot of the module
    pub module_index: u8,
    /// Channel within the module
    pub index: u8,
    /// Output setpoint in volts
    pub bias_voltage: f64,
    /// Output enabled
    pub activated: bool,
    /// Label shown on the chassis display
    pub heading_text: String,
    /// Readback running
    pub measuring: bool,
}

/// Body of `PUT dac16D/vsource_shared/`: one change applied to every linked channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedVsourceChange {
    /// Change to apply; its `index` is ignored by the chassis
    pub change: VsourceChange,
    /// Which channels the change applies to
    pub link_enabled: [bool; DAC16D_CHANNELS],
}

/// Module type in a chassis slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Four-channel DAC
    Dac4D,
    /// Sixteen-channel DAC with a VSB rail
    Dac16D,
    /// Nothing recognised in the slot
    Empty,
}

impl ModuleKind {
    fn from_reported(module_type: &str) -> Self {
        if module_type.eq_ignore_ascii_case("dac4d") {
            ModuleKind::Dac4D
        } else if module_type.eq_ignore_ascii_case("dac16d") {
            ModuleKind::Dac16D
        } else {
            ModuleKind::Empty
        }
    }
}

/// One chassis slot as last loaded from `full-state`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSummary {
    /// Chassis slot; the entry's position when the chassis omits it
    pub slot: usize,
    /// Module type
    pub kind: ModuleKind,
    /// Module name, empty when unnamed
    pub name: String,
    /// Channels reported as activated
    pub active_channels: usize,
}

impl fmt::Display for ModuleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ModuleKind::Dac4D => write!(
                f,
                "dac4D (Slot {}): {}/{DAC4D_CHANNELS} channels active",
                self.slot, self.active_channels
            ),
            ModuleKind::Dac16D => write!(
                f,
                "Dac16D (Slot {}): {}/{DAC16D_CHANNELS} channels active",
                self.slot, self.active_channels
            ),
            ModuleKind::Empty => f.write_str("Empty slot"),
        }
    }
}

/// Chassis state for `slot`, failing if the chassis reports another module type there.
fn reported_module(http: &HttpDep, slot: u8, kind: ModuleKind) -> AppResult<Option<ModuleState>> {
    let state: FullState = http.get_json(FULL_STATE)?.unwrap_or_default();
    match state.data.into_iter().find(|m| m.slot() == Some(slot)) {
        Some(module) => {
            let reported = module
                .core
                .as_ref()
                .map(|c| c.module_type.clone())
                .unwrap_or_default();
            if ModuleKind::from_reported(&reported) != kind {
                return Err(LabError::type_mismatch(
                    format!("{kind:?} module in slot {slot}"),
                    reported,
                ));
            }
            Ok(Some(module))
        }
        None => {
            debug!(slot, "no chassis state for module, using defaults");
            Ok(None)
        }
    }
}

/// Channels `0..count`, taking each one's state from `reported` when present.
fn build_channels(
    http: &HttpDep,
    module_index: u8,
    endpoint: &'static str,
    count: usize,
    reported: &[ChannelState],
) -> Vec<DacChannel> {
    (0..count)
        .filter_map(|index| u8::try_from(index).ok())
        .map(|index| DacChannel {
            http: http.fork(),
            module_index,
            endpoint,
            state: reported
                .iter()
                .find(|c| c.index == index)
                .cloned()
                .unwrap_or(ChannelState {
                    index,
                    ..ChannelState::default()
                }),
            connected: true,
        })
        .collect()
}

/// Stop every channel; the errors of the ones the chassis refused.
fn disconnect_channels(channels: &mut [DacChannel]) -> AppResult<()> {
    let errors: Vec<LabError> = channels
        .iter_mut()
        .filter_map(|channel| channel.disconnect().err())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LabError::TeardownIncomplete(errors))
    }
}

fn channel_at(channels: &mut [DacChannel], index: u8) -> AppResult<&mut DacChannel> {
    let capacity = channels.len();
    channels
        .get_mut(usize::from(index))
        .ok_or_else(|| LabError::SlotOutOfRange {
            key: index.to_string(),
            capacity,
        })
}

/// DBay chassis.
pub struct DBay {
    params: DBayParams,
    http: HttpDep,
    children: ChildNodes,
    modules: Option<Vec<ModuleSummary>>,
    connected: bool,
}

impl DBay {
    /// Factory: `dep` is the computer's broker and `key` is `host[:port]`.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::DBay(params) => params,
            other => return Err(wrong_params("dbay", &other)),
        };
        let (host, port) = parse_chassis_key(key)?;
        let http = dep
            .as_broker()?
            .http(&build_http_descriptor(&host, port, &params.base_path))?;
        Ok(Box::new(Self {
            params,
            http,
            children: ChildNodes::new(registry.clone()),
            modules: None,
            connected: true,
        }))
    }

    /// Descriptor of the REST channel.
    pub fn descriptor(&self) -> &str {
        self.http.descriptor()
    }

    /// Fetch `full-state` and replace the module snapshot.
    pub fn load_full_state(&mut self) -> AppResult<&[ModuleSummary]> {
        ensure_connected(self.connected, "dbay")?;
        let state: FullState = self.http.get_json(FULL_STATE)?.unwrap_or_default();
        let modules = state
            .data
            .iter()
            .enumerate()
            .map(|(position, module)| {
                let kind = module
                    .core
                    .as_ref()
                    .map_or(ModuleKind::Empty, |c| ModuleKind::from_reported(&c.module_type));
                ModuleSummary {
                    slot: module.slot().map_or(position, usize::from),
                    kind,
                    name: module.core.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
                    active_channels: module.channels().iter().filter(|c| c.activated).count(),
                }
            })
            .collect();
        Ok(self.modules.insert(modules).as_slice())
    }

    /// Module snapshot, loading it on first use.
    pub fn modules(&mut self) -> AppResult<&[ModuleSummary]> {
        if self.modules.is_none() {
            self.load_full_state()?;
        }
        Ok(self.modules.as_deref().unwrap_or_default())
    }

    /// `Slot n: <module>` for every module in the snapshot, also logged.
    pub fn list_modules(&mut self) -> AppResult<Vec<String>> {
        let chassis = self.http.descriptor().to_string();
        let lines: Vec<String> = self
            .modules()?
            .iter()
            .enumerate()
            .map(|(i, module)| format!("Slot {i}: {module}"))
            .collect();
        for line in &lines {
            info!(%chassis, "{line}");
        }
        Ok(lines)
    }
}

impl fmt::Display for DBay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DBay ({}, {} modules){}",
            self.http.descriptor(),
            self.children.len(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for DBay {
    fn kind(&self) -> &'static str {
        "dbay"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        let failures = self.children.disconnect_all();
        if failures > 0 {
            warn!(chassis = %self.http.descriptor(), failures, "chassis teardown had failures");
        }
        self.http.release();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
    instrument_parent!();
}

impl Parent for DBay {
    fn dependency(&self) -> AppResult<Dependency> {
        ensure_connected(self.connected, "dbay")?;
        Ok(Dependency::Http(self.http.fork()))
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
        ensure_connected(self.connected, "dbay")?;
        let http = &self.http;
        self.children
            .init_from(&self.params.children, || Ok(Dependency::Http(http.fork())))
    }
}

/// One output of a DAC module.
pub struct DacChannel {
    http: HttpDep,
    module_index: u8,
    endpoint: &'static str,
    state: ChannelState,
    connected: bool,
}

impl DacChannel {
    /// Channel index within its module.
    pub fn index(&self) -> u8 {
        self.state.index
    }

    /// Last configuration sent to or reported by the chassis.
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// False once the channel has been stopped.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn push(&mut self, bias_voltage: f64, activated: bool, measuring: bool) -> AppResult<()> {
        ensure_connected(self.connected, "dac channel")?;
        let change = VsourceChange {
            module_index: self.module_index,
            index: self.state.index,
            bias_voltage,
            activated,
            heading_text: self.state.heading_text.clone(),
            measuring,
        };
        self.http.put_json(self.endpoint, &change)?;
        self.state.bias_voltage = bias_voltage;
        self.state.activated = activated;
        self.state.measuring = measuring;
        Ok(())
    }

    /// Stop measuring and keep the last configuration; the channel is marked
    /// disconnected even if the chassis rejects the update.
    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = self.push(self.state.bias_voltage, self.state.activated, false);
        self.http.release();
        self.connected = false;
        result
    }
}

impl VSource for DacChannel {
    fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        self.push(volts, self.state.activated, true)
    }

    fn turn_on(&mut self) -> AppResult<()> {
        self.push(self.state.bias_voltage, true, true)
    }

    fn turn_off(&mut self) -> AppResult<()> {
        self.push(self.state.bias_voltage, false, true)
    }
}

/// DAC4D module in a DBay slot, with its four channels built up front.
pub struct Dac4D {
    params: Dac4DParams,
    slot: u8,
    core: Option<Core>,
    channels: Vec<DacChannel>,
    connected: bool,
}

impl Dac4D {
    /// Factory: `dep` is the chassis HTTP dependency and `key` the slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Dac4D(params) => params,
            other => return Err(wrong_params("dac4d", &other)),
        };
        let slot = key_index(key)?;
        let http = dep.as_http()?;
        let module = reported_module(http, slot, ModuleKind::Dac4D)?;
        let reported = module.as_ref().map_or(&[][..], ModuleState::channels);
        let channels = build_channels(
            http,
            slot,
            DAC4D_VSOURCE,
            usize::from(DAC4D_CHANNELS),
            reported,
        );
        Ok(Box::new(Self {
            params,
            slot,
            core: module.and_then(|m| m.core),
            channels,
            connected: true,
        }))
    }

    /// Chassis slot
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Module name reported by the chassis, if it reported this slot.
    pub fn name(&self) -> Option<&str> {
        self.core.as_ref().map(|c| c.name.as_str())
    }

    /// Free-form label
    pub fn attribute(&self) -> Option<&str> {
        self.params.attribute.as_deref()
    }

    /// All four channels.
    pub fn channels(&self) -> &[DacChannel] {
        &self.channels
    }

    /// Channel by index.
    pub fn channel_mut(&mut self, index: u8) -> AppResult<&mut DacChannel> {
        ensure_connected(self.connected, "dac4d")?;
        channel_at(&mut self.channels, index)
    }

    /// Set one channel, keeping its activation state.
    pub fn voltage_set(&mut self, index: u8, volts: f64) -> AppResult<()> {
        self.channel_mut(index)?.set_voltage(volts)
    }
}

impl fmt::Display for Dac4D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.channels.iter().filter(|c| c.state.activated).count();
        write!(
            f,
            "dac4D (Slot {}): {active}/{} channels active{}",
            self.slot,
            self.channels.len(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Dac4D {
    fn kind(&self) -> &'static str {
        "dac4d"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = disconnect_channels(&mut self.channels);
        self.connected = false;
        result
    }

    instrument_any!();
}

/// DAC16D module: sixteen channels, shared multi-channel updates and a VSB rail.
pub struct Dac16D {
    params: Dac16DParams,
    slot: u8,
    http: HttpDep,
    core: Option<Core>,
    channels: Vec<DacChannel>,
    vsb: ChannelState,
    connected: bool,
}

impl Dac16D {
    /// Factory: `dep` is the chassis HTTP dependency and `key` the slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Dac16D(params) => params,
            other => return Err(wrong_params("dac16d", &other)),
        };
        let slot = key_index(key)?;
        let http = dep.as_http()?;
        let module = reported_module(http, slot, ModuleKind::Dac16D)?;
        let reported = module.as_ref().map_or(&[][..], ModuleState::channels);
        let channels = build_channels(http, slot, DAC16D_VSOURCE, DAC16D_CHANNELS, reported);
        let (core, vsb) = match module {
            Some(module) => (module.core, module.vsb),
            None => (None, None),
        };
        Ok(Box::new(Self {
            params,
            slot,
            http: http.fork(),
            core,
            channels,
            vsb: vsb.unwrap_or(ChannelState {
                heading_text: "VSB".to_string(),
                ..ChannelState::default()
            }),
            connected: true,
        }))
    }

    /// Chassis slot
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Module name reported by the chassis, if it reported this slot.
    pub fn name(&self) -> Option<&str> {
        self.core.as_ref().map(|c| c.name.as_str())
    }

    /// Free-form label
    pub fn attribute(&self) -> Option<&str> {
        self.params.attribute.as_deref()
    }

    /// All sixteen channels.
    pub fn channels(&self) -> &[DacChannel] {
        &self.channels
    }

    /// Channel by index.
    pub fn channel_mut(&mut self, index: u8) -> AppResult<&mut DacChannel> {
        ensure_connected(self.connected, "dac16d")?;
        channel_at(&mut self.channels, index)
    }

    /// Set one channel, keeping its activation state.
    pub fn voltage_set(&mut self, index: u8, volts: f64) -> AppResult<()> {
        self.channel_mut(index)?.set_voltage(volts)
    }

    /// Apply one setpoint to every channel whose `link_enabled` entry is true, in a
    /// single request. Linked channels take the new state locally without further
    /// requests.
    pub fn voltage_set_shared(
        &mut self,
        volts: f64,
        activated: bool,
        link_enabled: [bool; DAC16D_CHANNELS],
    ) -> AppResult<()> {
        ensure_connected(self.connected, "dac16d")?;
        let heading_text = self
            .channels
            .first()
            .map(|c| c.state.heading_text.clone())
            .unwrap_or_default();
        let shared = SharedVsourceChange {
            change: VsourceChange {
                module_index: self.slot,
                index: 0,
                bias_voltage: volts,
                activated,
                heading_text,
                measuring: true,
            },
            link_enabled,
        };
        self.http.put_json(DAC16D_VSOURCE_SHARED, &shared)?;
        for (channel, _) in self
            .channels
            .iter_mut()
            .zip(link_enabled)
            .filter(|(_, linked)| *linked)
        {
            channel.state.bias_voltage = volts;
            channel.state.activated = activated;
            channel.state.measuring = true;
        }
        Ok(())
    }

    /// Last VSB configuration.
    pub fn vsb(&self) -> &ChannelState {
        &self.vsb
    }

    /// Drive the VSB rail.
    pub fn set_vsb(&mut self, volts: f64, activated: bool) -> AppResult<()> {
        ensure_connected(self.connected, "dac16d")?;
        let change = VsourceChange {
            module_index: self.slot,
            index: 0,
            bias_voltage: volts,
            activated,
            heading_text: "VSB".to_string(),
            measuring: true,
        };
        self.http.put_json(DAC16D_VSB, &change)?;
        self.vsb.bias_voltage = volts;
        self.vsb.activated = activated;
        self.vsb.measuring = true;
        Ok(())
    }
}

impl fmt::Display for Dac16D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.channels.iter().filter(|c| c.state.activated).count();
        write!(
            f,
            "Dac16D (Slot {}): {active}/{DAC16D_CHANNELS} channels active{}",
            self.slot,
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Dac16D {
    fn kind(&self) -> &'static str {
        "dac16d"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = disconnect_channels(&mut self.channels);
        self.http.release();
        self.connected = false;
        result
    }

    instrument_any!();
}

/// Placeholder for a chassis slot with no module. Performs no I/O.
pub struct EmptySlot {
    slot: u8,
    connected: bool,
}

impl EmptySlot {
    /// Factory: `dep` must be the chassis HTTP dependency and `key` the slot.
    pub fn from_params_with_dep(
        dep: &Dependency,
        key: &str,
        params: Params,
        _registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        if !matches!(params, Params::EmptySlot(_)) {
            return Err(wrong_params("empty", &params));
        }
        dep.as_http()?;
        Ok(Box::new(Self {
            slot: key_index(key)?,
            connected: true,
        }))
    }

    /// Chassis slot
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

impl fmt::Display for EmptySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Empty slot{}", state_suffix(self.connected))
    }
}

impl Instrument for EmptySlot {
    fn kind(&self) -> &'static str {
        "empty"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.connected = false;
        Ok(())
    }

    instrument_any!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendFactory, HttpMethod, HttpRequest};
    use crate::broker::{BrokerOptions, ChannelBroker};
    use crate::deps::BrokerDep;
    use crate::descriptor::Descriptor;
    use tracing_test::traced_test;

    /// Chassis that answers reads and rejects every update.
    struct ReadOnlyChassis;

    impl BackendFactory for ReadOnlyChassis {
        fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>> {
            Ok(Box::new(ReadOnlyBackend(descriptor.to_string())))
        }
    }

    struct ReadOnlyBackend(String);

    impl Backend for ReadOnlyBackend {
        fn descriptor(&self) -> &str {
            &self.0
        }
        fn open(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn write(&mut self, data: &[u8]) -> AppResult<usize> {
            Ok(data.len())
        }
        fn read(&mut self, _size: Option<usize>) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn readline(&mut self) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn request(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
            match req.method {
                HttpMethod::Get => Ok(Vec::new()),
                _ => Err(LabError::InvalidResponse("403 Forbidden".into())),
            }
        }
    }

    #[test]
    fn test_parse_chassis_key() {
        assert_eq!(
            parse_chassis_key("10.7.0.4").unwrap(),
            ("10.7.0.4".to_string(), 8345)
        );
        assert_eq!(
            parse_chassis_key("dbay.lab:9000").unwrap(),
            ("dbay.lab".to_string(), 9000)
        );
        assert!(parse_chassis_key("dbay.lab:http").is_err());
        assert!(parse_chassis_key(":80").is_err());
    }

    #[test]
    fn test_vsource_change_wire_format() {
        let change = VsourceChange {
            module_index: 2,
            index: 1,
            bias_voltage: 0.5,
            activated: true,
            heading_text: "bias".into(),
            measuring: true,
        };
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            serde_json::json!({
                "module_index": 2,
                "index": 1,
                "bias_voltage": 0.5,
                "activated": true,
                "heading_text": "bias",
                "measuring": true
            })
        );
    }

    #[test]
    fn test_offline_chassis_builds_default_channels() {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let registry = Arc::new(InstrumentRegistry::standard());
        let mut chassis = DBay::from_params_with_dep(
            &Dependency::Broker(broker),
            "10.7.0.4",
            Params::DBay(DBayParams::default()),
            &registry,
        )
        .unwrap();
        let dbay = chassis.as_parent_mut().unwrap();
        let module = dbay
            .add_child("2", Params::Dac4D(Dac4DParams::default()))
            .unwrap();
        let dac = module.downcast_mut::<Dac4D>().unwrap();
        assert_eq!(dac.channels().len(), 4);
        dac.voltage_set(1, 0.25).unwrap();
        dac.channel_mut(1).unwrap().turn_on().unwrap();
        assert_eq!(dac.to_string(), "dac4D (Slot 2): 1/4 channels active");
        assert!(chassis.to_string().starts_with("DBay (http://10.7.0.4:8345"));
    }

    #[test]
    fn test_offline_chassis_holds_every_module_kind() {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let registry = Arc::new(InstrumentRegistry::standard());
        let mut chassis = DBay::from_params_with_dep(
            &Dependency::Broker(broker),
            "10.7.0.4",
            Params::DBay(DBayParams::default()),
            &registry,
        )
        .unwrap();
        let dbay = chassis.as_parent_mut().unwrap();
        let dac = dbay
            .add_child("1", Params::Dac16D(Dac16DParams::default()))
            .unwrap()
            .downcast_mut::<Dac16D>()
            .unwrap();
        dac.voltage_set_shared(0.1, true, [true; DAC16D_CHANNELS]).unwrap();
        assert_eq!(dac.to_string(), "Dac16D (Slot 1): 16/16 channels active");
        dbay.add_child("2", Params::EmptySlot(Default::default()))
            .unwrap();

        let dbay = chassis.downcast_mut::<DBay>().unwrap();
        assert!(dbay.list_modules().unwrap().is_empty());
        chassis.disconnect().unwrap();
        assert!(chassis
            .as_parent()
            .unwrap()
            .children()
            .iter()
            .all(|(_, m)| !m.is_connected()));
    }

    #[test]
    fn test_module_summary_display() {
        let summary = |kind| ModuleSummary {
            slot: 3,
            kind,
            name: String::new(),
            active_channels: 2,
        };
        assert_eq!(
            summary(ModuleKind::Dac4D).to_string(),
            "dac4D (Slot 3): 2/4 channels active"
        );
        assert_eq!(
            summary(ModuleKind::Dac16D).to_string(),
            "Dac16D (Slot 3): 2/16 channels active"
        );
        assert_eq!(summary(ModuleKind::Empty).to_string(), "Empty slot");
        assert_eq!(ModuleKind::from_reported("DAC16D"), ModuleKind::Dac16D);
        assert_eq!(ModuleKind::from_reported("scope"), ModuleKind::Empty);
    }

    #[test]
    #[traced_test]
    fn test_rejected_updates_are_logged_and_teardown_completes() {
        let broker = ChannelBroker::with_factory(Arc::new(ReadOnlyChassis), BrokerOptions::default());
        let registry = Arc::new(InstrumentRegistry::standard());
        let mut chassis = DBay::from_params_with_dep(
            &Dependency::Broker(BrokerDep::local(Arc::new(broker))),
            "dbay.lab:9000",
            Params::DBay(DBayParams::default()),
            &registry,
        )
        .unwrap();
        let dbay = chassis.as_parent_mut().unwrap();
        for slot in ["0", "3"] {
            dbay.add_child(slot, Params::Dac4D(Dac4DParams::default()))
                .unwrap();
        }
        let err = dbay
            .child_mut("3")
            .unwrap()
            .downcast_mut::<Dac4D>()
            .unwrap()
            .voltage_set(0, 1.0)
            .unwrap_err();
        assert!(matches!(err, LabError::InvalidResponse(_)));

        chassis.disconnect().unwrap();
        assert!(logs_contain("child disconnect failed"));
        let dbay = chassis.as_parent().unwrap();
        assert!(dbay.children().iter().all(|(_, m)| !m.is_connected()));
        assert!(matches!(
            dbay.dependency(),
            Err(LabError::NotConnected(_))
        ));
    }
}
