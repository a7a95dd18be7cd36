//! Parent/Child instrument composition.
//!
//! A [`Params`] tree is materialized top-down: each parent hands a forked
//! [`Dependency`] to the registry factory for every child key. Parents hold their
//! live children in [`ChildNodes`], which keeps the Params map and the live map in
//! step and implements the cascade teardown.
//!
//! Node lifecycle is `connected -> disconnected`; a disconnected node is only ever
//! dropped, never reconnected.

pub mod discovery;
pub mod params;
pub mod registry;
pub mod slots;

pub use discovery::ConfigIndex;
pub use params::Params;
pub use registry::InstrumentRegistry;
pub use slots::{SlotRule, Slots};

use crate::deps::Dependency;
use crate::error::{AppResult, LabError};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, warn};

/// A live node in an instrument tree.
pub trait Instrument: fmt::Display + Send + Any {
    /// The Params discriminator this node was built from.
    fn kind(&self) -> &'static str;

    /// False once `disconnect` has run.
    fn is_connected(&self) -> bool;

    /// Tear down this node and everything below it.
    ///
    /// Idempotent. Child failures are logged and never stop the cascade; the node is
    /// marked disconnected even when its own teardown reports an error.
    fn disconnect(&mut self) -> AppResult<()>;

    /// For downcasting; see [`instrument_any!`].
    fn as_any(&self) -> &dyn Any;
    /// Mutable counterpart of `as_any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// This node as a parent, if it has children.
    fn as_parent(&self) -> Option<&dyn Parent> {
        None
    }

    /// Mutable counterpart of `as_parent`.
    fn as_parent_mut(&mut self) -> Option<&mut dyn Parent> {
        None
    }
}

/// A node that owns children.
pub trait Parent {
    /// The dependency this node hands to its children (a fresh copy per call).
    fn dependency(&self) -> AppResult<Dependency>;

    /// Most children this node accepts.
    fn capacity(&self) -> usize;

    /// Live child under `key`.
    fn child(&self, key: &str) -> Option<&dyn Instrument>;

    /// Mutable live child under `key`.
    fn child_mut(&mut self, key: &str) -> Option<&mut dyn Instrument>;

    /// Live children in key order.
    fn children(&self) -> Vec<(&str, &dyn Instrument)>;

    /// Validate `key`, build the child from `params`, then record both.
    ///
    /// Nothing is recorded when validation or construction fails. An existing child
    /// under `key` is disconnected first.
    fn add_child(&mut self, key: &str, params: Params) -> AppResult<&mut dyn Instrument>;

    /// Build every child listed in this node's Params that is not live yet.
    fn init_children(&mut self) -> AppResult<()>;
}

/// Typed convenience over [`Parent::add_child`].
pub trait ParentExt: Parent {
    /// `add_child`, then downcast the new child to `T`.
    fn add<T: Instrument>(&mut self, key: &str, params: Params) -> AppResult<&mut T> {
        let child = self.add_child(key, params)?;
        let found = child.kind();
        child
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| LabError::type_mismatch(std::any::type_name::<T>(), found))
    }
}

impl<P: Parent + ?Sized> ParentExt for P {}

impl dyn Instrument + '_ {
    /// The node as a `T`, if it is one.
    pub fn downcast_ref<T: Instrument>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutable counterpart of `downcast_ref`.
    pub fn downcast_mut<T: Instrument>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// `as_any`/`as_any_mut` for an `Instrument` impl.
#[macro_export]
macro_rules! instrument_any {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}

/// `as_parent`/`as_parent_mut` for an `Instrument` impl that also implements `Parent`.
#[macro_export]
macro_rules! instrument_parent {
    () => {
        fn as_parent(&self) -> Option<&dyn $crate::tree::Parent> {
            Some(self)
        }

        fn as_parent_mut(&mut self) -> Option<&mut dyn $crate::tree::Parent> {
            Some(self)
        }
    };
}

/// Live children of one parent.
pub struct ChildNodes {
    nodes: BTreeMap<String, Box<dyn Instrument>>,
    registry: Arc<InstrumentRegistry>,
}

impl ChildNodes {
    /// No children yet; new children are built from `registry`.
    pub fn new(registry: Arc<InstrumentRegistry>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            registry,
        }
    }

    /// Registry children are built from.
    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Number of live children.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True with no live children.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a child lives under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Child under `key`.
    pub fn get(&self, key: &str) -> Option<&dyn Instrument> {
        match self.nodes.get(key) {
            Some(node) => Some(node.as_ref()),
            None => None,
        }
    }

    /// Mutable child under `key`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut dyn Instrument> {
        match self.nodes.get_mut(key) {
            Some(node) => Some(node.as_mut()),
            None => None,
        }
    }

    /// Children in key order.
    pub fn list(&self) -> Vec<(&str, &dyn Instrument)> {
        let mut out: Vec<(&str, &dyn Instrument)> = Vec::with_capacity(self.nodes.len());
        for (key, node) in &self.nodes {
            out.push((key.as_str(), node.as_ref()));
        }
        out
    }

    /// Shared body of `Parent::add_child`.
    pub fn attach<R: SlotRule>(
        &mut self,
        slots: &mut Slots<R>,
        key: &str,
        params: Params,
        dep: Dependency,
    ) -> AppResult<&mut dyn Instrument> {
        slots.check_key(key)?;
        if let Some(mut previous) = self.nodes.remove(key) {
            debug!(key, kind = previous.kind(), "replacing child");
            if let Err(err) = previous.disconnect() {
                warn!(key, error = %err, "previous child did not disconnect cleanly");
            }
            slots.remove(key);
        }
        let node = self.registry.build_child(&dep, key, params.clone())?;
        slots.insert(key, params)?;
        Ok(self.nodes.entry(key.to_string()).or_insert(node).as_mut())
    }

    /// Shared body of `Parent::init_children`: build every recorded child not yet live.
    ///
    /// Stops at the first failure, leaving the children built so far in place.
    pub fn init_from<R: SlotRule>(
        &mut self,
        slots: &Slots<R>,
        mut dep: impl FnMut() -> AppResult<Dependency>,
    ) -> AppResult<()> {
        for (key, params) in slots.iter() {
            if self.nodes.contains_key(key) {
                continue;
            }
            let node = self.registry.build_child(&dep()?, key, params.clone())?;
            self.nodes.insert(key.to_string(), node);
        }
        Ok(())
    }

    /// Disconnect every child depth-first. See [`disconnect_children`].
    pub fn disconnect_all(&mut self) -> usize {
        disconnect_children(self.nodes.iter_mut().map(|(k, v)| (k.as_str(), v.as_mut())))
    }
}

/// Disconnect each child, logging and swallowing failures. Returns the failure count.
pub fn disconnect_children<'a>(
    children: impl IntoIterator<Item = (&'a str, &'a mut (dyn Instrument + 'static))>,
) -> usize {
    let mut failures = 0;
    for (key, child) in children {
        if let Err(err) = child.disconnect() {
            failures += 1;
            warn!(key, kind = child.kind(), error = %err, "child disconnect failed");
        }
    }
    failures
}

/// Fail with `NotConnected` once a node is torn down.
pub(crate) fn ensure_connected(connected: bool, name: &str) -> AppResult<()> {
    if connected {
        Ok(())
    } else {
        Err(LabError::NotConnected(name.to_string()))
    }
}

/// Indented `key: node` listing of a subtree.
pub fn render_tree(root: &dyn Instrument) -> String {
    fn walk(out: &mut String, node: &dyn Instrument, depth: usize) {
        if let Some(parent) = node.as_parent() {
            for (key, child) in parent.children() {
                let _ = writeln!(out, "{:indent$}{key}: {child}", "", indent = depth * 2);
                walk(out, child, depth + 1);
            }
        }
    }

    let mut out = format!("{root}\n");
    walk(&mut out, root, 1);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::deps::BrokerDep;
    use crate::instrument::{Computer, DummyVolt};
    use crate::tree::params::{ComputerParams, DummyVoltParams};

    fn computer() -> Computer {
        Computer::new(
            ComputerParams::default(),
            BrokerDep::local(Arc::new(ChannelBroker::offline())),
            Arc::new(InstrumentRegistry::standard()),
        )
    }

    #[test]
    fn test_add_returns_typed_child() {
        let mut root = computer();
        let volt = root
            .add::<DummyVolt>("bench", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        assert!(volt.is_connected());
        assert!(root.child("bench").unwrap().downcast_ref::<DummyVolt>().is_some());
    }

    #[test]
    fn test_add_wrong_type_is_mismatch() {
        let mut root = computer();
        let result =
            root.add::<Computer>("bench", Params::DummyVolt(DummyVoltParams::default()));
        assert!(matches!(result, Err(LabError::TypeMismatch { .. })));
    }

    #[test]
    fn test_render_tree_lists_children() {
        let mut root = computer();
        root.add_child("bench", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        let listing = render_tree(&root);
        assert!(listing.starts_with("Computer"));
        assert!(listing.contains("\n  bench: DummyVolt"));
    }

    #[test]
    fn test_disconnect_cascades_and_is_idempotent() {
        let mut root = computer();
        root.add_child("a", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        root.add_child("b", Params::DummyVolt(DummyVoltParams::default()))
            .unwrap();
        root.disconnect().unwrap();
        assert!(!root.is_connected());
        assert!(root.children().iter().all(|(_, c)| !c.is_connected()));
        root.disconnect().unwrap();
    }
}
