//! Channel broker.
//!
//! The broker owns every backend and guarantees at most one backend per distinct
//! descriptor for its whole lifetime. Concurrent first-time requests for the same
//! descriptor are collapsed: one caller constructs and opens the backend while the
//! others wait on that descriptor's slot and then receive the winner's handle.
//! Requests for different descriptors only contend on the map lock, which is never
//! held across backend construction.
//!
//! The broker can run in-process, or be exposed over HTTP/JSON by [`server`] and
//! reached through [`client::BrokerClient`].

pub mod client;
pub mod rpc;
pub mod server;

pub use client::BrokerClient;
pub use server::{spawn_server, RunningServer};

use crate::backend::{Backend, BackendFactory, DummyBackend, HttpRequest, NativeBackends};
use crate::descriptor::parse_descriptor;
use crate::error::{AppResult, LabError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend construction policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Simulate every descriptor with a dummy backend.
    pub offline: bool,
    /// Simulate descriptors whose native transport is unavailable.
    pub dummy_fallback: bool,
}

type SharedBackend = Arc<Mutex<Box<dyn Backend>>>;

/// Reference to a broker-owned backend.
///
/// Cloning is cheap. Every operation takes the backend lock for its duration, so
/// operations on one backend run in submission order.
#[derive(Clone)]
pub struct ChannelHandle {
    descriptor: Arc<str>,
    backend: SharedBackend,
}

impl ChannelHandle {
    fn new(descriptor: String, backend: Box<dyn Backend>) -> Self {
        Self {
            descriptor: descriptor.into(),
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Canonical descriptor.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// True when both handles refer to the same backend instance.
    pub fn same_backend(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    /// Whether the backend is still open.
    pub fn is_open(&self) -> bool {
        self.backend.lock().is_open()
    }

    /// True when a simulator stands in for the transport.
    pub fn is_simulated(&self) -> bool {
        self.backend.lock().is_simulated()
    }

    /// Write raw bytes.
    pub fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.backend.lock().write(data)
    }

    /// Read up to `size` bytes, or what is available.
    pub fn read(&self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.backend.lock().read(size)
    }

    /// Read one line, terminator included.
    pub fn readline(&self) -> AppResult<Vec<u8>> {
        self.backend.lock().readline()
    }

    /// VISA device clear.
    pub fn clear(&self) -> AppResult<()> {
        self.backend.lock().clear()
    }

    /// VISA session timeout.
    pub fn set_timeout(&self, timeout: Duration) -> AppResult<()> {
        self.backend.lock().set_timeout(timeout)
    }

    /// Send one HTTP request.
    pub fn request(&self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        self.backend.lock().request(req)
    }

    /// Write then read a line while holding the backend lock.
    pub fn query_line(&self, data: &[u8]) -> AppResult<Vec<u8>> {
        let mut backend = self.backend.lock();
        backend.write(data)?;
        backend.readline()
    }

    /// Write then read one message (up to `size` bytes) while holding the backend lock.
    pub fn query(&self, data: &[u8], size: Option<usize>) -> AppResult<Vec<u8>> {
        let mut backend = self.backend.lock();
        backend.write(data)?;
        backend.read(size)
    }

    fn close_backend(&self) -> AppResult<()> {
        self.backend.lock().close()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Per-descriptor construction slot. Empty until a backend opened successfully.
type Slot = Arc<Mutex<Option<ChannelHandle>>>;

/// Descriptor → backend cache.
pub struct ChannelBroker {
    factory: Arc<dyn BackendFactory>,
    options: BrokerOptions,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Broker over the native transports.
    pub fn new() -> Self {
        Self::with_factory(Arc::new(NativeBackends), BrokerOptions::default())
    }

    /// Broker whose backends all simulate.
    pub fn offline() -> Self {
        Self::with_factory(
            Arc::new(NativeBackends),
            BrokerOptions {
                offline: true,
                dummy_fallback: false,
            },
        )
    }

    /// Broker over the standard backends.
    pub fn with_options(options: BrokerOptions) -> Self {
        Self::with_factory(Arc::new(NativeBackends), options)
    }

    /// Broker over a custom factory.
    pub fn with_factory(factory: Arc<dyn BackendFactory>, options: BrokerOptions) -> Self {
        Self {
            factory,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Options this broker was built with.
    pub fn options(&self) -> BrokerOptions {
        self.options
    }

    /// Return the handle for `descriptor`, constructing and opening its backend on
    /// first use.
    ///
    /// Descriptors are cached under their canonical form, so
    /// `serial:/dev/ttyUSB0` and `serial:/dev/ttyUSB0?baud=9600&timeout=1.0` share a
    /// backend.
    pub fn get_or_create(&self, descriptor: &str) -> AppResult<ChannelHandle> {
        let parsed = parse_descriptor(descriptor)?;
        let key = parsed.to_string();

        loop {
            let slot = {
                let mut slots = self.slots.lock();
                slots.entry(key.clone()).or_default().clone()
            };

            let mut guard = slot.lock();
            // `close` or a failed construction may have dropped this slot while we waited.
            if !self.is_current(&key, &slot) {
                debug!(descriptor = %key, "slot replaced while waiting, retrying");
                continue;
            }
            if let Some(handle) = guard.as_ref() {
                debug!(descriptor = %key, "Reusing existing channel");
                return Ok(handle.clone());
            }

            debug!(descriptor = %key, kind = parsed.kind(), "Creating new channel");
            return match self.construct(&parsed, &key) {
                Ok(backend) => {
                    let handle = ChannelHandle::new(key, backend);
                    *guard = Some(handle.clone());
                    Ok(handle)
                }
                Err(e) => {
                    self.forget(&key, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Handle for a channel that is already open. Never constructs a backend.
    ///
    /// Fails with `ChannelClosed` when `descriptor` was never acquired or has been
    /// closed since.
    pub fn get(&self, descriptor: &str) -> AppResult<ChannelHandle> {
        let key = parse_descriptor(descriptor)?.to_string();
        let slot = self.slots.lock().get(&key).cloned();
        let handle = slot.and_then(|slot| slot.lock().clone());
        handle.ok_or(LabError::ChannelClosed(key))
    }

    fn is_current(&self, key: &str, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `slot` from the map unless it has already been replaced.
    fn forget(&self, key: &str, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    fn construct(
        &self,
        parsed: &crate::descriptor::Descriptor,
        key: &str,
    ) -> AppResult<Box<dyn Backend>> {
        if self.options.offline {
            let mut backend = DummyBackend::standing_in_for(key);
            backend.open()?;
            info!(descriptor = %key, "offline: simulating channel");
            return Ok(Box::new(backend));
        }

        let mut backend = self.factory.create(parsed)?;
        match backend.open() {
            Ok(()) => Ok(backend),
            Err(LabError::BackendUnavailable { reason, .. }) if self.options.dummy_fallback => {
                warn!(descriptor = %key, %reason, "native transport unavailable, simulating channel");
                let mut fallback = DummyBackend::standing_in_for(key);
                fallback.open()?;
                Ok(Box::new(fallback))
            }
            Err(e) => Err(e),
        }
    }

    /// Close and forget the backend for `descriptor`. `false` if none was cached.
    pub fn close(&self, descriptor: &str) -> AppResult<bool> {
        let key = parse_descriptor(descriptor)?.to_string();
        let slot = self.slots.lock().remove(&key);
        let Some(slot) = slot else {
            return Ok(false);
        };
        let handle = slot.lock().take();
        match handle {
            Some(handle) => {
                handle.close_backend()?;
                info!(descriptor = %key, "channel closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every cached backend. Errors are logged; returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, Slot)> = self.slots.lock().drain().collect();
        let mut closed = 0;
        for (key, slot) in drained {
            let handle = slot.lock().take();
            if let Some(handle) = handle {
                match handle.close_backend() {
                    Ok(()) => closed += 1,
                    Err(e) => warn!(descriptor = %key, error = %e, "failed to close channel"),
                }
            }
        }
        closed
    }

    /// Descriptors with a constructed backend, sorted.
    pub fn list_descriptors(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // A slot that is locked is still being constructed and is not listed yet.
        let mut out: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| slot.try_lock().is_some_and(|guard| guard.is_some()))
            .map(|(key, _)| key)
            .collect();
        out.sort();
        out
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.list_descriptors().len()
    }

    /// True when no channel is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts constructions; builds dummies, or fails as unavailable for serial.
    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        delay: Duration,
    }

    impl BackendFactory for CountingFactory {
        fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>> {
            std::thread::sleep(self.delay);
            self.created.fetch_add(1, Ordering::SeqCst);
            match descriptor {
                Descriptor::Serial { .. } => Ok(Box::new(Unavailable(descriptor.to_string()))),
                _ => Ok(Box::new(
                    DummyBackend::standing_in_for(&descriptor.to_string())
                        .with_latency(Duration::ZERO),
                )),
            }
        }
    }

    struct Unavailable(String);

    impl Backend for Unavailable {
        fn descriptor(&self) -> &str {
            &self.0
        }
        fn open(&mut self) -> AppResult<()> {
            Err(LabError::BackendUnavailable {
                descriptor: self.0.clone(),
                reason: "no driver".into(),
            })
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            false
        }
        fn write(&mut self, _data: &[u8]) -> AppResult<usize> {
            self.open().map(|_| 0)
        }
        fn read(&mut self, _size: Option<usize>) -> AppResult<Vec<u8>> {
            self.open().map(|_| Vec::new())
        }
        fn readline(&mut self) -> AppResult<Vec<u8>> {
            self.open().map(|_| Vec::new())
        }
    }

    fn counting_broker(options: BrokerOptions) -> (Arc<CountingFactory>, ChannelBroker) {
        let factory = Arc::new(CountingFactory::default());
        let broker = ChannelBroker::with_factory(factory.clone(), options);
        (factory, broker)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (factory, broker) = counting_broker(BrokerOptions::default());
        let a = broker.get_or_create("dummy:bench").unwrap();
        let b = broker.get_or_create("dummy:bench").unwrap();
        assert!(a.same_backend(&b));
        assert!(a.is_open());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let c = broker.get_or_create("dummy:other").unwrap();
        assert!(!a.same_backend(&c));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_equivalent_descriptors_share_backend() {
        let broker = ChannelBroker::offline();
        let short = broker.get_or_create("serial:/dev/ttyUSB0").unwrap();
        let long = broker
            .get_or_create("serial:/dev/ttyUSB0?baud=9600&timeout=1.0")
            .unwrap();
        assert!(short.same_backend(&long));
        assert_eq!(
            broker.list_descriptors(),
            vec!["serial:/dev/ttyUSB0?baud=9600&timeout=1.0".to_string()]
        );
    }

    #[test]
    fn test_invalid_descriptor_is_not_cached() {
        let (factory, broker) = counting_broker(BrokerOptions::default());
        assert!(matches!(
            broker.get_or_create("tcp:10.0.0.1"),
            Err(LabError::InvalidDescriptor(_))
        ));
        assert!(broker.is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_backend_is_reported_then_retried() {
        let (factory, broker) = counting_broker(BrokerOptions::default());
        let result = broker.get_or_create("serial:/dev/ttyUSB9");
        assert!(matches!(result, Err(LabError::BackendUnavailable { .. })));
        assert!(broker.list_descriptors().is_empty());

        let _ = broker.get_or_create("serial:/dev/ttyUSB9");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_construction_leaves_no_slot() {
        let (_, broker) = counting_broker(BrokerOptions::default());
        for port in ["/dev/ttyUSB7", "/dev/ttyUSB8", "/dev/ttyUSB9"] {
            assert!(broker.get_or_create(&format!("serial:{port}")).is_err());
        }
        assert!(broker.slots.lock().is_empty());
        assert_eq!(broker.len(), 0);
    }

    #[test]
    fn test_get_never_constructs() {
        let (factory, broker) = counting_broker(BrokerOptions::default());
        assert!(matches!(
            broker.get("dummy:bench"),
            Err(LabError::ChannelClosed(d)) if d == "dummy:bench"
        ));
        let opened = broker.get_or_create("dummy:bench").unwrap();
        assert!(broker.get("dummy:bench").unwrap().same_backend(&opened));

        broker.close("dummy:bench").unwrap();
        assert!(matches!(
            broker.get("dummy:bench"),
            Err(LabError::ChannelClosed(_))
        ));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(broker.slots.lock().is_empty());
    }

    #[test]
    fn test_waiter_does_not_install_into_closed_slot() {
        let factory = Arc::new(CountingFactory {
            delay: Duration::from_millis(200),
            ..CountingFactory::default()
        });
        let broker = Arc::new(ChannelBroker::with_factory(
            factory.clone(),
            BrokerOptions::default(),
        ));

        let builder = {
            let broker = broker.clone();
            std::thread::spawn(move || broker.get_or_create("dummy:race"))
        };
        std::thread::sleep(Duration::from_millis(50));
        let waiter = {
            let broker = broker.clone();
            std::thread::spawn(move || broker.get_or_create("dummy:race"))
        };
        std::thread::sleep(Duration::from_millis(50));
        broker.close("dummy:race").unwrap();

        builder.join().unwrap().unwrap();
        let waited = waiter.join().unwrap().unwrap();
        let again = broker.get_or_create("dummy:race").unwrap();

        // Whatever the waiter got is either closed or the one listed backend.
        if waited.is_open() {
            assert!(again.same_backend(&waited));
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(broker.list_descriptors(), vec!["dummy:race".to_string()]);
    }

    #[test]
    fn test_dummy_fallback_substitutes_simulator() {
        let (_, broker) = counting_broker(BrokerOptions {
            offline: false,
            dummy_fallback: true,
        });
        let handle = broker.get_or_create("serial:/dev/ttyUSB9").unwrap();
        assert!(handle.is_simulated());
        assert_eq!(handle.descriptor(), "serial:/dev/ttyUSB9?baud=9600&timeout=1.0");
    }

    #[test]
    fn test_offline_never_calls_factory() {
        let (factory, broker) = counting_broker(BrokerOptions {
            offline: true,
            dummy_fallback: false,
        });
        let handle = broker.get_or_create("visa:GPIB0::5::INSTR").unwrap();
        assert!(handle.is_simulated());
        handle.clear().unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_removes_and_closes() {
        let broker = ChannelBroker::offline();
        let handle = broker.get_or_create("dummy:bench").unwrap();
        assert!(broker.close("dummy:bench").unwrap());
        assert!(!broker.close("dummy:bench").unwrap());
        assert!(!handle.is_open());
        assert!(matches!(handle.write(b"VOLT?"), Err(LabError::ChannelClosed(_))));

        let fresh = broker.get_or_create("dummy:bench").unwrap();
        assert!(!fresh.same_backend(&handle));
    }

    #[test]
    fn test_close_all() {
        let broker = ChannelBroker::offline();
        broker.get_or_create("dummy:a").unwrap();
        broker.get_or_create("dummy:b").unwrap();
        assert_eq!(broker.len(), 2);
        assert_eq!(broker.close_all(), 2);
        assert!(broker.is_empty());
    }
}
