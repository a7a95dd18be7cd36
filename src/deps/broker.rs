//! Root-level dependency: access to a channel broker.

use super::link::{LocalLink, RemoteLink};
use super::roles::{DummyDep, HttpDep, SerialDep, VisaDep};
use crate::broker::{BrokerClient, BrokerOptions, ChannelBroker};
use crate::config::broker_uri_from_env;
use crate::descriptor::parse_descriptor;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a root node gets its channels from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// In-process broker
    #[default]
    Local,
    /// Broker service at `server_uri` or `BROKER_URI`
    Remote,
}

/// Local or remote broker access.
#[derive(Clone)]
pub enum BrokerDep {
    /// Broker in this process
    Local(Arc<ChannelBroker>),
    /// Broker behind HTTP
    Remote(BrokerClient),
}

enum Acquired {
    Local(LocalLink),
    Remote(RemoteLink),
}

impl fmt::Debug for BrokerDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerDep::Local(broker) => f
                .debug_tuple("Local")
                .field(&broker.list_descriptors())
                .finish(),
            BrokerDep::Remote(client) => f.debug_tuple("Remote").field(&client.uri()).finish(),
        }
    }
}

impl BrokerDep {
    /// Wrap a broker in this process.
    pub fn local(broker: Arc<ChannelBroker>) -> Self {
        BrokerDep::Local(broker)
    }

    /// Client for the broker at `uri`.
    pub fn remote(uri: &str) -> AppResult<Self> {
        Ok(BrokerDep::Remote(BrokerClient::new(uri)?))
    }

    /// Resolve the broker for a root node.
    ///
    /// `Remote` uses `server_uri`, else `BROKER_URI`; with neither it falls back to a
    /// local broker. Reachability is checked at the first channel acquisition.
    pub fn from_mode(
        mode: BrokerMode,
        server_uri: Option<&str>,
        options: BrokerOptions,
    ) -> AppResult<Self> {
        match mode {
            BrokerMode::Remote => {
                let uri = server_uri
                    .map(str::to_string)
                    .or_else(broker_uri_from_env);
                match uri {
                    Some(uri) => {
                        info!(%uri, "using remote broker");
                        Self::remote(&uri)
                    }
                    None => {
                        warn!("remote mode requested without a broker URI, using a local broker");
                        Ok(Self::local(Arc::new(ChannelBroker::with_options(options))))
                    }
                }
            }
            BrokerMode::Local => Ok(Self::local(Arc::new(ChannelBroker::with_options(options)))),
        }
    }

    /// True for a broker behind HTTP.
    pub fn is_remote(&self) -> bool {
        matches!(self, BrokerDep::Remote(_))
    }

    /// Descriptors currently held by the broker.
    pub fn list_descriptors(&self) -> AppResult<Vec<String>> {
        match self {
            BrokerDep::Local(broker) => Ok(broker.list_descriptors()),
            BrokerDep::Remote(client) => client.list_descriptors(),
        }
    }

    fn acquire(&self, descriptor: &str, expected_kind: &str) -> AppResult<Acquired> {
        let kind = parse_descriptor(descriptor)?.kind();
        if kind != expected_kind {
            return Err(LabError::type_mismatch(
                format!("{expected_kind} descriptor"),
                descriptor,
            ));
        }
        match self {
            BrokerDep::Local(broker) => Ok(Acquired::Local(LocalLink::new(
                broker.get_or_create(descriptor)?,
            ))),
            BrokerDep::Remote(client) => Ok(Acquired::Remote(RemoteLink::acquire(
                client.clone(),
                descriptor,
            )?)),
        }
    }

    /// Serial role for `descriptor`.
    pub fn serial(&self, descriptor: &str) -> AppResult<SerialDep> {
        Ok(match self.acquire(descriptor, "serial")? {
            Acquired::Local(link) => SerialDep::new(Arc::new(link)),
            Acquired::Remote(link) => SerialDep::new(Arc::new(link)),
        })
    }

    /// VISA role for `descriptor`.
    pub fn visa(&self, descriptor: &str) -> AppResult<VisaDep> {
        Ok(match self.acquire(descriptor, "visa")? {
            Acquired::Local(link) => VisaDep::new(Arc::new(link)),
            Acquired::Remote(link) => VisaDep::new(Arc::new(link)),
        })
    }

    /// HTTP role for `descriptor`.
    pub fn http(&self, descriptor: &str) -> AppResult<HttpDep> {
        Ok(match self.acquire(descriptor, "http")? {
            Acquired::Local(link) => HttpDep::new(Arc::new(link)),
            Acquired::Remote(link) => HttpDep::new(Arc::new(link)),
        })
    }

    /// Dummy role for `descriptor`.
    pub fn dummy(&self, descriptor: &str) -> AppResult<DummyDep> {
        Ok(match self.acquire(descriptor, "dummy")? {
            Acquired::Local(link) => DummyDep::new(Arc::new(link)),
            Acquired::Remote(link) => DummyDep::new(Arc::new(link)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_role_getters_check_kind() {
        let dep = BrokerDep::local(Arc::new(ChannelBroker::offline()));
        assert!(dep.dummy("dummy:bench").is_ok());
        assert!(matches!(
            dep.serial("dummy:bench"),
            Err(LabError::TypeMismatch { .. })
        ));
        assert!(matches!(
            dep.visa("gpib:5"),
            Err(LabError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_shared_broker_shares_channels() {
        let broker = Arc::new(ChannelBroker::offline());
        let a = BrokerDep::local(broker.clone());
        let b = a.clone();
        a.serial("serial:/dev/ttyUSB0").unwrap();
        b.serial("serial:/dev/ttyUSB0?baud=9600&timeout=1.0").unwrap();
        assert_eq!(broker.len(), 1);
        assert_eq!(a.list_descriptors().unwrap().len(), 1);
    }

    #[test]
    #[serial]
    fn test_from_mode_resolution() {
        std::env::remove_var(crate::config::BROKER_URI_ENV);
        let local = BrokerDep::from_mode(BrokerMode::Local, None, BrokerOptions::default()).unwrap();
        assert!(!local.is_remote());

        let fallback =
            BrokerDep::from_mode(BrokerMode::Remote, None, BrokerOptions::default()).unwrap();
        assert!(!fallback.is_remote());

        let explicit = BrokerDep::from_mode(
            BrokerMode::Remote,
            Some("http://127.0.0.1:8765"),
            BrokerOptions::default(),
        )
        .unwrap();
        assert!(explicit.is_remote());

        std::env::set_var(crate::config::BROKER_URI_ENV, "http://127.0.0.1:8766");
        let from_env =
            BrokerDep::from_mode(BrokerMode::Remote, None, BrokerOptions::default()).unwrap();
        std::env::remove_var(crate::config::BROKER_URI_ENV);
        match from_env {
            BrokerDep::Remote(client) => assert_eq!(client.uri(), "http://127.0.0.1:8766"),
            BrokerDep::Local(_) => panic!("expected remote broker"),
        }
    }

    #[test]
    fn test_unreachable_remote_fails_at_acquisition() {
        let dep = BrokerDep::remote("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            dep.dummy("dummy:bench"),
            Err(LabError::RemoteUnavailable { .. })
        ));
    }
}
