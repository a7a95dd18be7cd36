//! Discriminator → factory registry.

use super::params::Params;
use super::Instrument;
use crate::broker::{BrokerOptions, ChannelBroker};
use crate::deps::{BrokerDep, Dependency};
use crate::error::{AppResult, LabError};
use crate::instrument::{
    Computer, DBay, Dac16D, Dac4D, DummyVolt, EmptySlot, Keysight53220A, PrologixGpib, Sim900,
    Sim921, Sim928, Sim970,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a node from its parent's dependency, its key under that parent, and its Params.
pub type ChildFactory = fn(
    &Dependency,
    &str,
    Params,
    &Arc<InstrumentRegistry>,
) -> AppResult<Box<dyn Instrument>>;

/// Maps each `type` tag to the factory that builds it.
///
/// Parents keep an `Arc` to the registry they were built with and use it for their
/// own children, so a custom registry reaches the whole tree.
#[derive(Clone, Default)]
pub struct InstrumentRegistry {
    factories: HashMap<&'static str, ChildFactory>,
}

impl fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("InstrumentRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl InstrumentRegistry {
    /// Registry with no factories.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in instrument.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("computer", Computer::from_params_with_dep);
        registry.register("prologix_gpib", PrologixGpib::from_params_with_dep);
        registry.register("sim900", Sim900::from_params_with_dep);
        registry.register("sim970", Sim970::from_params_with_dep);
        registry.register("sim928", Sim928::from_params_with_dep);
        registry.register("sim921", Sim921::from_params_with_dep);
        registry.register("dummy_volt", DummyVolt::from_params_with_dep);
        registry.register("keysight53220a", Keysight53220A::from_params_with_dep);
        registry.register("dbay", DBay::from_params_with_dep);
        registry.register("dac4d", Dac4D::from_params_with_dep);
        registry.register("dac16d", Dac16D::from_params_with_dep);
        registry.register("empty", EmptySlot::from_params_with_dep);
        registry
    }

    /// Add or replace the factory for `kind`.
    pub fn register(&mut self, kind: &'static str, factory: ChildFactory) -> &mut Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Whether `kind` has a factory.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build a child node under a parent whose dependency is `dep`.
    pub fn build_child(
        self: &Arc<Self>,
        dep: &Dependency,
        key: &str,
        params: Params,
    ) -> AppResult<Box<dyn Instrument>> {
        let kind = params.kind();
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| LabError::UnknownKind(kind.to_string()))?;
        debug!(kind, key, parent_dep = dep.role(), "building instrument");
        factory(dep, key, params, self)
    }

    /// Build a root node and materialize its whole subtree.
    ///
    /// A `computer` root resolves its own broker from its Params; a bare
    /// `prologix_gpib` root gets an in-process broker built with `options`.
    pub fn build_root(
        self: &Arc<Self>,
        params: Params,
        options: BrokerOptions,
    ) -> AppResult<Box<dyn Instrument>> {
        let mut root: Box<dyn Instrument> = match params {
            Params::Computer(p) => Box::new(Computer::connect(p, options, self.clone())?),
            Params::PrologixGpib(_) => {
                let broker = BrokerDep::local(Arc::new(ChannelBroker::with_options(options)));
                self.build_child(&Dependency::Broker(broker), "root", params)?
            }
            other => return Err(LabError::type_mismatch("root instrument", other.kind())),
        };
        init_tree(root.as_mut())?;
        Ok(root)
    }

    /// Build a root node on an existing broker and materialize its subtree.
    pub fn build_root_on(
        self: &Arc<Self>,
        params: Params,
        broker: BrokerDep,
    ) -> AppResult<Box<dyn Instrument>> {
        let mut root: Box<dyn Instrument> = match params {
            Params::Computer(p) => Box::new(Computer::new(p, broker, self.clone())),
            Params::PrologixGpib(_) => {
                self.build_child(&Dependency::Broker(broker), "root", params)?
            }
            other => return Err(LabError::type_mismatch("root instrument", other.kind())),
        };
        init_tree(root.as_mut())?;
        Ok(root)
    }
}

/// Run `init_children` at every level below `node`.
pub fn init_tree(node: &mut dyn Instrument) -> AppResult<()> {
    let Some(parent) = node.as_parent_mut() else {
        return Ok(());
    };
    parent.init_children()?;
    let keys: Vec<String> = parent
        .children()
        .into_iter()
        .map(|(key, _)| key.to_string())
        .collect();
    for key in keys {
        if let Some(child) = parent.child_mut(&key) {
            init_tree(child)?;
        }
    }
    Ok(())
}
