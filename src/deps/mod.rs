//! Dependencies: the capabilities a parent node hands to its children.
//!
//! A dependency never owns a backend. Local and remote variants sit behind the
//! link traits in [`link`], so a node built against a remote broker runs the same
//! code as one built in-process.

pub mod broker;
pub mod gpib;
pub mod link;
pub mod roles;

pub use broker::{BrokerDep, BrokerMode};
pub use gpib::{GpibDep, SlotDep, DEFAULT_QUERY_DELAY};
pub use link::{HttpLink, Link, LocalLink, RemoteLink, StreamLink, VisaLink};
pub use roles::{DummyDep, HttpDep, SerialDep, VisaDep};

use crate::error::{AppResult, LabError};
use std::fmt;

/// What a parent passes to `add_child`.
pub enum Dependency {
    /// Broker access, handed to hosts
    Broker(BrokerDep),
    /// Serial channel
    Serial(SerialDep),
    /// One GPIB address on a controller
    Gpib(GpibDep),
    /// HTTP channel
    Http(HttpDep),
    /// VISA channel
    Visa(VisaDep),
    /// Dummy channel
    Dummy(DummyDep),
}

impl Dependency {
    /// Role name, for error messages.
    pub fn role(&self) -> &'static str {
        match self {
            Dependency::Broker(_) => "broker",
            Dependency::Serial(_) => "serial",
            Dependency::Gpib(_) => "gpib",
            Dependency::Http(_) => "http",
            Dependency::Visa(_) => "visa",
            Dependency::Dummy(_) => "dummy",
        }
    }

    /// Copy for a child node. Releasing the copy leaves this one usable.
    pub fn fork(&self) -> Self {
        match self {
            Dependency::Broker(dep) => Dependency::Broker(dep.clone()),
            Dependency::Serial(dep) => Dependency::Serial(dep.fork()),
            Dependency::Gpib(dep) => Dependency::Gpib(dep.fork()),
            Dependency::Http(dep) => Dependency::Http(dep.fork()),
            Dependency::Visa(dep) => Dependency::Visa(dep.fork()),
            Dependency::Dummy(dep) => Dependency::Dummy(dep.fork()),
        }
    }

    /// Invalidate this copy. A broker dependency has nothing to release.
    pub fn release(&mut self) {
        match self {
            Dependency::Broker(_) => {}
            Dependency::Serial(dep) => dep.release(),
            Dependency::Gpib(dep) => dep.release(),
            Dependency::Http(dep) => dep.release(),
            Dependency::Visa(dep) => dep.release(),
            Dependency::Dummy(dep) => dep.release(),
        }
    }

    /// Broker, or a dependency mismatch.
    pub fn as_broker(&self) -> AppResult<&BrokerDep> {
        match self {
            Dependency::Broker(dep) => Ok(dep),
            other => Err(other.mismatch("broker")),
        }
    }

    /// Serial, or a dependency mismatch.
    pub fn as_serial(&self) -> AppResult<&SerialDep> {
        match self {
            Dependency::Serial(dep) => Ok(dep),
            other => Err(other.mismatch("serial")),
        }
    }

    /// GPIB, or a dependency mismatch.
    pub fn as_gpib(&self) -> AppResult<&GpibDep> {
        match self {
            Dependency::Gpib(dep) => Ok(dep),
            other => Err(other.mismatch("gpib")),
        }
    }

    /// HTTP, or a dependency mismatch.
    pub fn as_http(&self) -> AppResult<&HttpDep> {
        match self {
            Dependency::Http(dep) => Ok(dep),
            other => Err(other.mismatch("http")),
        }
    }

    fn mismatch(&self, expected: &str) -> LabError {
        LabError::type_mismatch(
            format!("{expected} dependency"),
            format!("{} dependency", self.role()),
        )
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Broker(dep) => f.debug_tuple("Broker").field(dep).finish(),
            Dependency::Serial(dep) => f.debug_tuple("Serial").field(&dep.descriptor()).finish(),
            Dependency::Gpib(dep) => f
                .debug_struct("Gpib")
                .field("descriptor", &dep.descriptor())
                .field("address", &dep.address())
                .finish(),
            Dependency::Http(dep) => f.debug_tuple("Http").field(&dep.descriptor()).finish(),
            Dependency::Visa(dep) => f.debug_tuple("Visa").field(&dep.descriptor()).finish(),
            Dependency::Dummy(dep) => f.debug_tuple("Dummy").field(&dep.descriptor()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use std::sync::Arc;

    #[test]
    fn test_role_accessors() {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let serial = Dependency::Serial(broker.serial("serial:COM3").unwrap());
        assert!(serial.as_serial().is_ok());
        assert!(matches!(
            serial.as_gpib(),
            Err(LabError::TypeMismatch { .. })
        ));
        assert_eq!(Dependency::Broker(broker).role(), "broker");
    }

    #[test]
    fn test_fork_then_release() {
        let broker = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        let parent = Dependency::Dummy(broker.dummy("dummy:bench").unwrap());
        let mut child = parent.fork();
        child.release();
        match (&parent, &child) {
            (Dependency::Dummy(p), Dependency::Dummy(c)) => {
                assert!(!p.is_released());
                assert!(c.is_released());
            }
            _ => unreachable!(),
        }
    }
}
