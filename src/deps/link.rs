//! Channel links: the local/remote seam under every dependency.
//!
//! A link is a reference to one broker-owned channel. [`LocalLink`] wraps a
//! [`ChannelHandle`] directly; [`RemoteLink`] forwards every call to a broker over
//! RPC. Both implement the same role traits, so instrument code cannot tell them apart.

use crate::backend::{HttpBody, HttpMethod, HttpRequest};
use crate::broker::{BrokerClient, ChannelHandle};
use crate::error::AppResult;
use std::time::Duration;

/// Identity shared by every link.
pub trait Link: Send + Sync {
    /// Channel descriptor
    fn descriptor(&self) -> &str;
    /// True when a simulator stands in for the transport
    fn is_simulated(&self) -> bool;
}

/// Byte stream (serial and dummy channels).
pub trait StreamLink: Link {
    /// Write raw bytes.
    fn write(&self, data: &[u8]) -> AppResult<usize>;
    /// Read up to `size` bytes.
    fn read(&self, size: Option<usize>) -> AppResult<Vec<u8>>;
    /// Read one line.
    fn readline(&self) -> AppResult<Vec<u8>>;
    /// Write then read a line without another caller interleaving on the channel.
    fn query_line(&self, data: &[u8]) -> AppResult<Vec<u8>>;
}

/// VISA session.
pub trait VisaLink: Link {
    /// Write one message.
    fn write(&self, data: &[u8]) -> AppResult<usize>;
    /// Read one message.
    fn read(&self) -> AppResult<Vec<u8>>;
    /// Read exactly up to `size` bytes.
    fn read_bytes(&self, size: usize) -> AppResult<Vec<u8>>;
    /// Write then read.
    fn query(&self, data: &[u8]) -> AppResult<Vec<u8>>;
    /// Device clear.
    fn clear(&self) -> AppResult<()>;
    /// Session timeout.
    fn set_timeout(&self, timeout: Duration) -> AppResult<()>;
}

/// REST endpoint.
pub trait HttpLink: Link {
    /// Send one request; returns the response body.
    fn request(&self, method: HttpMethod, path: &str, body: Option<HttpBody>) -> AppResult<Vec<u8>>;
}

/// In-process link.
#[derive(Debug, Clone)]
pub struct LocalLink {
    handle: ChannelHandle,
}

impl LocalLink {
    /// Link over a broker in this process.
    pub fn new(handle: ChannelHandle) -> Self {
        Self { handle }
    }

    /// The underlying channel.
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl Link for LocalLink {
    fn descriptor(&self) -> &str {
        self.handle.descriptor()
    }

    fn is_simulated(&self) -> bool {
        self.handle.is_simulated()
    }
}

impl StreamLink for LocalLink {
    fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.handle.write(data)
    }

    fn read(&self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.handle.read(size)
    }

    fn readline(&self) -> AppResult<Vec<u8>> {
        self.handle.readline()
    }

    fn query_line(&self, data: &[u8]) -> AppResult<Vec<u8>> {
        self.handle.query_line(data)
    }
}

impl VisaLink for LocalLink {
    fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.handle.write(data)
    }

    fn read(&self) -> AppResult<Vec<u8>> {
        self.handle.read(None)
    }

    fn read_bytes(&self, size: usize) -> AppResult<Vec<u8>> {
        self.handle.read(Some(size))
    }

    fn query(&self, data: &[u8]) -> AppResult<Vec<u8>> {
        self.handle.query(data, None)
    }

    fn clear(&self) -> AppResult<()> {
        self.handle.clear()
    }

    fn set_timeout(&self, timeout: Duration) -> AppResult<()> {
        self.handle.set_timeout(timeout)
    }
}

impl HttpLink for LocalLink {
    fn request(&self, method: HttpMethod, path: &str, body: Option<HttpBody>) -> AppResult<Vec<u8>> {
        let mut req = HttpRequest::new(method, path);
        if let Some(body) = body {
            req = req.with_body(body);
        }
        self.handle.request(&req)
    }
}

/// Link through a remote broker.
#[derive(Debug, Clone)]
pub struct RemoteLink {
    client: BrokerClient,
    descriptor: String,
    simulated: bool,
}

impl RemoteLink {
    /// Acquire `descriptor` on the broker now so failures surface immediately.
    pub fn acquire(client: BrokerClient, descriptor: &str) -> AppResult<Self> {
        let acquired = client.acquire(descriptor)?;
        Ok(Self {
            client,
            descriptor: acquired.descriptor,
            simulated: acquired.simulated,
        })
    }

    /// Client the link calls through.
    pub fn client(&self) -> &BrokerClient {
        &self.client
    }
}

impl Link for RemoteLink {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn is_simulated(&self) -> bool {
        self.simulated
    }
}

impl StreamLink for RemoteLink {
    fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.client.write(&self.descriptor, data)
    }

    fn read(&self, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.client.read(&self.descriptor, size)
    }

    fn readline(&self) -> AppResult<Vec<u8>> {
        self.client.readline(&self.descriptor)
    }

    fn query_line(&self, data: &[u8]) -> AppResult<Vec<u8>> {
        self.client.serial_query(&self.descriptor, data)
    }
}

impl VisaLink for RemoteLink {
    fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.client.write(&self.descriptor, data)
    }

    fn read(&self) -> AppResult<Vec<u8>> {
        self.client.read(&self.descriptor, None)
    }

    fn read_bytes(&self, size: usize) -> AppResult<Vec<u8>> {
        self.client.visa_read_bytes(&self.descriptor, size)
    }

    fn query(&self, data: &[u8]) -> AppResult<Vec<u8>> {
        self.client.visa_query(&self.descriptor, data)
    }

    fn clear(&self) -> AppResult<()> {
        self.client.visa_clear(&self.descriptor)
    }

    fn set_timeout(&self, timeout: Duration) -> AppResult<()> {
        self.client.visa_set_timeout(&self.descriptor, timeout)
    }
}

impl HttpLink for RemoteLink {
    fn request(&self, method: HttpMethod, path: &str, body: Option<HttpBody>) -> AppResult<Vec<u8>> {
        self.client.http(&self.descriptor, method, path, body)
    }
}
