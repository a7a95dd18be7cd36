//! Transport backends.
//!
//! Every backend satisfies the same synchronous contract: `open()` is idempotent and
//! is invoked before every operation (lazy connect), `close()` is terminal, and
//! `write`/`read`/`readline` move raw bytes. Per-kind verbs (`clear`, `set_timeout`,
//! `request`) default to [`LabError::Unsupported`].
//!
//! Backends are never shared directly; the broker owns each one behind a mutex and
//! hands out [`crate::broker::ChannelHandle`]s.

pub mod dummy;
pub mod http;
pub mod serial;
pub mod visa;

pub use dummy::DummyBackend;
pub use http::HttpBackend;
pub use serial::SerialBackend;
pub use visa::VisaBackend;

use crate::descriptor::Descriptor;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of a backend. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Constructed, transport not yet opened
    Unopened,
    /// Transport open
    Open,
    /// Closed by the broker
    Closed,
}

impl BackendState {
    /// Shared transition check for `open()`: `Ok(true)` when the transport still
    /// has to be opened.
    pub fn needs_open(self, descriptor: &str) -> AppResult<bool> {
        match self {
            BackendState::Unopened => Ok(true),
            BackendState::Open => Ok(false),
            BackendState::Closed => Err(LabError::ChannelClosed(descriptor.to_string())),
        }
    }
}

/// HTTP verb for [`Backend::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `PUT`
    Put,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Verb name as used in logs and RPC routes.
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "get",
            HttpMethod::Put => "put",
            HttpMethod::Post => "post",
            HttpMethod::Delete => "delete",
        }
    }
}

/// Request body for [`Backend::request`].
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    /// Serialized as JSON with `Content-Type: application/json`
    Json(serde_json::Value),
    /// Sent as-is
    Bytes(Vec<u8>),
}

/// A single HTTP request relative to the backend's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Verb
    pub method: HttpMethod,
    /// Path below the base URL
    pub path: String,
    /// Optional body
    pub body: Option<HttpBody>,
}

impl HttpRequest {
    /// Request without a body.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    /// Attach `body`.
    pub fn with_body(mut self, body: HttpBody) -> Self {
        self.body = Some(body);
        self
    }
}

/// Byte transport contract.
pub trait Backend: Send {
    /// Canonical descriptor this backend was built from.
    fn descriptor(&self) -> &str;

    /// Open the transport. Idempotent; fails with `ChannelClosed` after `close()`.
    fn open(&mut self) -> AppResult<()>;

    /// Release the transport. Idempotent.
    fn close(&mut self) -> AppResult<()>;

    /// Whether `open` has run without a later `close`.
    fn is_open(&self) -> bool;

    /// Write raw bytes, returning the number written.
    fn write(&mut self, data: &[u8]) -> AppResult<usize>;

    /// Read up to `size` bytes, or everything currently available when `None`.
    fn read(&mut self, size: Option<usize>) -> AppResult<Vec<u8>>;

    /// Read through the next `\n` (inclusive) or until the transport times out.
    fn readline(&mut self) -> AppResult<Vec<u8>>;

    /// True for simulated transports.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Device clear (VISA).
    fn clear(&mut self) -> AppResult<()> {
        Err(unsupported(self.descriptor(), "clear"))
    }

    /// Change the I/O timeout (VISA).
    fn set_timeout(&mut self, _timeout: Duration) -> AppResult<()> {
        Err(unsupported(self.descriptor(), "set_timeout"))
    }

    /// Issue an HTTP request and return the response body (HTTP).
    fn request(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        Err(unsupported(self.descriptor(), req.method.as_str()))
    }
}

pub(crate) fn unsupported(descriptor: &str, operation: &str) -> LabError {
    LabError::Unsupported {
        descriptor: descriptor.to_string(),
        operation: operation.to_string(),
    }
}

/// Remove and return up to `size` bytes (all when `None`) from the front of `buffer`.
pub(crate) fn drain_buffer(buffer: &mut Vec<u8>, size: Option<usize>) -> Vec<u8> {
    match size {
        Some(n) if n < buffer.len() => buffer.drain(..n).collect(),
        _ => std::mem::take(buffer),
    }
}

/// Remove and return bytes through the first `\n`, or everything if there is none.
pub(crate) fn drain_line(buffer: &mut Vec<u8>) -> Vec<u8> {
    match buffer.iter().position(|b| *b == b'\n') {
        Some(idx) => buffer.drain(..=idx).collect(),
        None => std::mem::take(buffer),
    }
}

/// Builds a backend for a parsed descriptor.
///
/// The broker calls this exactly once per distinct descriptor.
pub trait BackendFactory: Send + Sync {
    /// Build an unopened backend for `descriptor`.
    fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>>;
}

/// Factory for the real transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackends;

impl BackendFactory for NativeBackends {
    fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>> {
        let canonical = descriptor.to_string();
        Ok(match descriptor {
            Descriptor::Serial {
                port,
                baud,
                timeout,
            } => Box::new(SerialBackend::new(
                canonical,
                port,
                *baud,
                Duration::from_secs_f64(*timeout),
            )),
            Descriptor::Visa { resource, timeout } => Box::new(VisaBackend::new(
                canonical,
                resource,
                Duration::from_secs_f64(*timeout),
            )),
            Descriptor::Http { base_url } => Box::new(HttpBackend::new(base_url)),
            Descriptor::Dummy { name } => Box::new(DummyBackend::new(name)),
        })
    }
}

/// Factory that simulates every descriptor with a [`DummyBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedBackends;

impl BackendFactory for SimulatedBackends {
    fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>> {
        Ok(Box::new(DummyBackend::standing_in_for(&descriptor.to_string())))
    }
}
