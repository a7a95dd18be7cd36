//! Role-specific dependencies over a link.
//!
//! Each node owns its dependency values. `fork()` hands a child its own copy of the
//! same link; `release()` invalidates one copy when its node disconnects and never
//! touches the backend, which the broker alone closes.

use super::link::{HttpLink, Link, StreamLink, VisaLink};
use crate::backend::{HttpBody, HttpMethod};
use crate::error::{AppResult, LabError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Link plus a per-owner released flag.
struct Guarded<L: ?Sized + Link> {
    link: Arc<L>,
    released: bool,
}

impl<L: ?Sized + Link> Guarded<L> {
    fn new(link: Arc<L>) -> Self {
        Self {
            link,
            released: false,
        }
    }

    fn get(&self) -> AppResult<&L> {
        if self.released {
            return Err(LabError::DependencyReleased(
                self.link.descriptor().to_string(),
            ));
        }
        Ok(self.link.as_ref())
    }

    fn fork(&self) -> Self {
        Self::new(self.link.clone())
    }

    fn release(&mut self) {
        if !self.released {
            debug!(descriptor = %self.link.descriptor(), "dependency released");
        }
        self.released = true;
    }
}

fn text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).trim().to_string()
}

macro_rules! common_dep_methods {
    () => {
        /// Descriptor of the underlying channel.
        pub fn descriptor(&self) -> &str {
            self.0.link.descriptor()
        }

        /// True when the channel is simulated.
        pub fn is_simulated(&self) -> bool {
            self.0.link.is_simulated()
        }

        /// Whether this copy has been released by its owner.
        pub fn is_released(&self) -> bool {
            self.0.released
        }

        /// Invalidate this copy.
        pub fn release(&mut self) {
            self.0.release();
        }

        /// Independent copy over the same channel.
        pub fn fork(&self) -> Self {
            Self(self.0.fork())
        }
    };
}

/// Serial line dependency.
pub struct SerialDep(Guarded<dyn StreamLink>);

impl SerialDep {
    /// Serial role over `link`.
    pub fn new(link: Arc<dyn StreamLink>) -> Self {
        Self(Guarded::new(link))
    }

    common_dep_methods!();

    /// Write raw bytes.
    pub fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.0.get()?.write(data)
    }

    /// Write `command` followed by a newline.
    pub fn write_str(&self, command: &str) -> AppResult<usize> {
        self.write(command.as_bytes())
    }

    /// Read up to `size` bytes, or what is available.
    pub fn read(&self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.0.get()?.read(size)
    }

    /// Read one line, without its terminator.
    pub fn readline(&self) -> AppResult<String> {
        Ok(text(self.0.get()?.readline()?))
    }

    /// Write `command` and return the trimmed reply line.
    pub fn query(&self, command: &str) -> AppResult<String> {
        Ok(text(self.0.get()?.query_line(command.as_bytes())?))
    }
}

/// Simulated channel dependency.
pub struct DummyDep(Guarded<dyn StreamLink>);

impl DummyDep {
    /// Dummy role over `link`.
    pub fn new(link: Arc<dyn StreamLink>) -> Self {
        Self(Guarded::new(link))
    }

    common_dep_methods!();

    /// Write a command.
    pub fn write_str(&self, command: &str) -> AppResult<usize> {
        self.0.get()?.write(command.as_bytes())
    }

    /// Read the pending reply.
    pub fn read(&self) -> AppResult<String> {
        Ok(text(self.0.get()?.read(None)?))
    }

    /// Write a command and read its reply.
    pub fn query(&self, command: &str) -> AppResult<String> {
        let link = self.0.get()?;
        link.write(command.as_bytes())?;
        Ok(text(link.read(None)?))
    }
}

/// VISA session dependency.
pub struct VisaDep(Guarded<dyn VisaLink>);

impl VisaDep {
    /// VISA role over `link`.
    pub fn new(link: Arc<dyn VisaLink>) -> Self {
        Self(Guarded::new(link))
    }

    common_dep_methods!();

    /// Write a command.
    pub fn write(&self, command: &str) -> AppResult<usize> {
        self.0.get()?.write(command.as_bytes())
    }

    /// Read one message.
    pub fn read(&self) -> AppResult<String> {
        Ok(text(self.0.get()?.read()?))
    }

    /// Read up to `size` bytes.
    pub fn read_bytes(&self, size: usize) -> AppResult<Vec<u8>> {
        self.0.get()?.read_bytes(size)
    }

    /// Write a command and read its reply.
    pub fn query(&self, command: &str) -> AppResult<String> {
        Ok(text(self.0.get()?.query(command.as_bytes())?))
    }

    /// Device clear.
    pub fn clear(&self) -> AppResult<()> {
        self.0.get()?.clear()
    }

    /// Session timeout.
    pub fn set_timeout(&self, timeout: Duration) -> AppResult<()> {
        self.0.get()?.set_timeout(timeout)
    }
}

/// REST endpoint dependency.
pub struct HttpDep(Guarded<dyn HttpLink>);

impl HttpDep {
    /// HTTP role over `link`.
    pub fn new(link: Arc<dyn HttpLink>) -> Self {
        Self(Guarded::new(link))
    }

    common_dep_methods!();

    /// `GET path`
    pub fn get(&self, path: &str) -> AppResult<Vec<u8>> {
        self.0.get()?.request(HttpMethod::Get, path, None)
    }

    /// `PUT path`
    pub fn put(&self, path: &str, body: Option<HttpBody>) -> AppResult<Vec<u8>> {
        self.0.get()?.request(HttpMethod::Put, path, body)
    }

    /// `POST path`
    pub fn post(&self, path: &str, body: Option<HttpBody>) -> AppResult<Vec<u8>> {
        self.0.get()?.request(HttpMethod::Post, path, body)
    }

    /// `DELETE path`
    pub fn delete(&self, path: &str) -> AppResult<Vec<u8>> {
        self.0.get()?.request(HttpMethod::Delete, path, None)
    }

    /// GET and decode a JSON body. `None` for an empty body.
    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> AppResult<Option<T>> {
        let body = self.get(path)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// PUT a JSON body.
    pub fn put_json<T: Serialize>(&self, path: &str, value: &T) -> AppResult<Vec<u8>> {
        self.put(path, Some(HttpBody::Json(serde_json::to_value(value)?)))
    }
}
