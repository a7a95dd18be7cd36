//! Root node for one host.

use super::{state_suffix, wrong_params};
use crate::broker::BrokerOptions;
use crate::deps::{BrokerDep, BrokerMode, Dependency};
use crate::error::AppResult;
use crate::tree::params::ComputerParams;
use crate::tree::{ensure_connected, ChildNodes, Instrument, InstrumentRegistry, Params, Parent};
use crate::{instrument_any, instrument_parent};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Host owning a broker; its children acquire channels through it.
pub struct Computer {
    params: ComputerParams,
    broker: BrokerDep,
    children: ChildNodes,
    connected: bool,
}

impl Computer {
    /// Computer on an existing broker. `mode` and `server_uri` in `params` are not consulted.
    pub fn new(params: ComputerParams, broker: BrokerDep, registry: Arc<InstrumentRegistry>) -> Self {
        Self {
            params,
            broker,
            children: ChildNodes::new(registry),
            connected: true,
        }
    }

    /// Resolve the broker from `params` (mode, server URI, `BROKER_URI`, offline flags).
    pub fn connect(
        params: ComputerParams,
        options: BrokerOptions,
        registry: Arc<InstrumentRegistry>,
    ) -> AppResult<Self> {
        let options = BrokerOptions {
            offline: options.offline || params.offline,
            dummy_fallback: options.dummy_fallback || params.dummy_fallback,
        };
        let broker = BrokerDep::from_mode(params.mode, params.server_uri.as_deref(), options)?;
        info!(mode = ?params.mode, remote = broker.is_remote(), "computer connected");
        Ok(Self::new(params, broker, registry))
    }

    /// Factory entry. A local-mode computer shares the broker it is handed.
    pub fn from_params_with_dep(
        dep: &Dependency,
        _key: &str,
        params: Params,
        registry: &Arc<InstrumentRegistry>,
    ) -> AppResult<Box<dyn Instrument>> {
        let params = match params {
            Params::Computer(params) => params,
            other => return Err(wrong_params("computer", &other)),
        };
        let computer = match params.mode {
            BrokerMode::Local => Self::new(params, dep.as_broker()?.clone(), registry.clone()),
            BrokerMode::Remote => Self::connect(params, BrokerOptions::default(), registry.clone())?,
        };
        Ok(Box::new(computer))
    }

    /// Broker children are built on.
    pub fn broker(&self) -> &BrokerDep {
        &self.broker
    }

    /// Configuration this host was built from.
    pub fn params(&self) -> &ComputerParams {
        &self.params
    }
}

impl fmt::Display for Computer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let broker = match &self.broker {
            BrokerDep::Local(_) => "local broker".to_string(),
            BrokerDep::Remote(client) => format!("remote broker {}", client.uri()),
        };
        write!(
            f,
            "Computer ({broker}, {} children){}",
            self.children.len(),
            state_suffix(self.connected)
        )
    }
}

impl Instrument for Computer {
    fn kind(&self) -> &'static str {
        "computer"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> AppResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.children.disconnect_all();
        self.connected = false;
        Ok(())
    }

    instrument_any!();
    instrument_parent!();
}

impl Parent for Computer {
    fn dependency(&self) -> AppResult<Dependency> {
        ensure_connected(self.connected, "computer")?;
        Ok(Dependency::Broker(self.broker.clone()))
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
        ensure_connected(self.connected, "computer")?;
        let broker = self.broker.clone();
        self.children
            .init_from(&self.params.children, || Ok(Dependency::Broker(broker.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::error::LabError;
    use crate::tree::params::DummyVoltParams;

    #[test]
    fn test_children_share_the_broker() {
        let broker = Arc::new(ChannelBroker::offline());
        let mut computer = Computer::new(
            ComputerParams::default(),
            BrokerDep::local(broker.clone()),
            Arc::new(InstrumentRegistry::standard()),
        );
        computer
            .add_child("a", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        computer
            .add_child("b", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        assert_eq!(
            broker.list_descriptors(),
            vec!["dummy:a".to_string(), "dummy:b".to_string()]
        );
        assert!(computer.to_string().contains("2 children"));
    }

    #[test]
    fn test_disconnected_computer_rejects_children() {
        let mut computer = Computer::new(
            ComputerParams::default(),
            BrokerDep::local(Arc::new(ChannelBroker::offline())),
            Arc::new(InstrumentRegistry::standard()),
        );
        computer.disconnect().unwrap();
        let result = computer.add_child("a", Params::DummyVolt(DummyVoltParams::default()));
        assert!(matches!(result, Err(LabError::NotConnected(_))));
        assert!(computer.to_string().ends_with("[disconnected]"));
    }
}
