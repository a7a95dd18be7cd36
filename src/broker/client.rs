//! Blocking client for a remote broker.

use super::rpc::{
    AckResponse, AcquireResponse, BytesResponse, CloseResponse, DescriptorRequest,
    DescriptorsResponse, ErrorBody, HealthResponse, HttpCall, QueryRequest, ReadRequest,
    TimeoutRequest, WriteRequest, WriteResponse,
};
use crate::backend::{HttpBody, HttpMethod};
use crate::codec::{coerce_bytes, ensure_bytes};
use crate::config::validate_broker_uri;
use crate::error::{AppResult, LabError};
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Upper bound on one RPC round trip; backend timeouts apply on the server side.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to a remote broker at `http(s)://host:port`.
#[derive(Clone)]
pub struct BrokerClient {
    uri: String,
    http: Client,
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient").field("uri", &self.uri).finish()
    }
}

impl BrokerClient {
    /// Client for the broker at `uri` with the default [`RPC_TIMEOUT`].
    pub fn new(uri: &str) -> AppResult<Self> {
        Self::with_timeout(uri, RPC_TIMEOUT)
    }

    /// Client whose calls give up after `timeout`.
    pub fn with_timeout(uri: &str, timeout: Duration) -> AppResult<Self> {
        validate_broker_uri(uri)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            uri: uri.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Base URI without a trailing slash.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.uri, route)
    }

    fn send<Resp: DeserializeOwned>(&self, route: &str, request: RequestBuilder) -> AppResult<Resp> {
        let response = request.send().map_err(|e| self.transport_error(route, e))?;
        let status = response.status();
        if status.is_success() {
            debug!(uri = %self.uri, route, "broker rpc ok");
            return Ok(response.json()?);
        }
        let body: Option<ErrorBody> = response.json().ok();
        Err(match body {
            Some(body) => remote_error(status.as_u16(), body),
            None => LabError::Remote {
                status: status.as_u16(),
                message: format!("{route} failed"),
            },
        })
    }

    fn post<Req: Serialize, Resp: DeserializeOwned>(&self, route: &str, body: &Req) -> AppResult<Resp> {
        self.send(route, self.http.post(self.url(route)).json(body))
    }

    fn get<Resp: DeserializeOwned>(&self, route: &str) -> AppResult<Resp> {
        self.send(route, self.http.get(self.url(route)))
    }

    /// Unreachable brokers are `RemoteUnavailable`. A timeout means the broker accepted
    /// the call but the backend behind it was slow, so it stays a `Timeout`.
    fn transport_error(&self, route: &str, err: reqwest::Error) -> LabError {
        if err.is_connect() {
            LabError::RemoteUnavailable {
                uri: self.uri.clone(),
                reason: err.to_string(),
            }
        } else if err.is_timeout() {
            LabError::Timeout(format!("{route} on {}", self.uri))
        } else {
            LabError::Http(err)
        }
    }

    /// Liveness and open channel count.
    pub fn health(&self) -> AppResult<HealthResponse> {
        self.get("health")
    }

    /// Descriptors open on the broker, sorted.
    pub fn list_descriptors(&self) -> AppResult<Vec<String>> {
        let resp: DescriptorsResponse = self.get("descriptors")?;
        Ok(resp.descriptors)
    }

    /// Ask the broker to construct (or reuse) the channel now.
    pub fn acquire(&self, descriptor: &str) -> AppResult<AcquireResponse> {
        self.post(
            "acquire",
            &DescriptorRequest {
                descriptor: descriptor.to_string(),
            },
        )
    }

    /// Write on an acquired channel.
    pub fn write(&self, descriptor: &str, data: &[u8]) -> AppResult<usize> {
        let resp: WriteResponse = self.post(
            "write",
            &WriteRequest {
                descriptor: descriptor.to_string(),
                data: ensure_bytes(data),
            },
        )?;
        Ok(resp.written)
    }

    /// Read up to `size` bytes, or whatever is available.
    pub fn read(&self, descriptor: &str, size: Option<usize>) -> AppResult<Vec<u8>> {
        self.bytes(
            "read",
            &ReadRequest {
                descriptor: descriptor.to_string(),
                size,
            },
        )
    }

    /// Read one line.
    pub fn readline(&self, descriptor: &str) -> AppResult<Vec<u8>> {
        self.bytes(
            "readline",
            &DescriptorRequest {
                descriptor: descriptor.to_string(),
            },
        )
    }

    /// Close the channel on the broker. `false` if it was not open.
    pub fn close(&self, descriptor: &str) -> AppResult<bool> {
        let resp: CloseResponse = self.post(
            "close",
            &DescriptorRequest {
                descriptor: descriptor.to_string(),
            },
        )?;
        Ok(resp.closed)
    }

    /// Serial write followed by a line read, executed atomically on the broker.
    pub fn serial_query(&self, descriptor: &str, command: &[u8]) -> AppResult<Vec<u8>> {
        self.bytes(
            "serial/query",
            &QueryRequest {
                descriptor: descriptor.to_string(),
                data: ensure_bytes(command),
                size: None,
            },
        )
    }

    /// Read exactly up to `size` bytes from a VISA session.
    pub fn visa_read_bytes(&self, descriptor: &str, size: usize) -> AppResult<Vec<u8>> {
        self.bytes(
            "visa/read_bytes",
            &ReadRequest {
                descriptor: descriptor.to_string(),
                size: Some(size),
            },
        )
    }

    /// VISA write followed by a read, executed atomically on the broker.
    pub fn visa_query(&self, descriptor: &str, command: &[u8]) -> AppResult<Vec<u8>> {
        self.bytes(
            "visa/query",
            &QueryRequest {
                descriptor: descriptor.to_string(),
                data: ensure_bytes(command),
                size: None,
            },
        )
    }

    /// Device clear.
    pub fn visa_clear(&self, descriptor: &str) -> AppResult<()> {
        let _: AckResponse = self.post(
            "visa/clear",
            &DescriptorRequest {
                descriptor: descriptor.to_string(),
            },
        )?;
        Ok(())
    }

    /// Set the session timeout on the broker side.
    pub fn visa_set_timeout(&self, descriptor: &str, timeout: Duration) -> AppResult<()> {
        let _: AckResponse = self.post(
            "visa/set_timeout",
            &TimeoutRequest {
                descriptor: descriptor.to_string(),
                timeout: timeout.as_secs_f64(),
            },
        )?;
        Ok(())
    }

    /// Relay one HTTP request to the channel's endpoint.
    pub fn http(
        &self,
        descriptor: &str,
        method: HttpMethod,
        path: &str,
        body: Option<HttpBody>,
    ) -> AppResult<Vec<u8>> {
        let (json, data) = match body {
            Some(HttpBody::Json(value)) => (Some(value), None),
            Some(HttpBody::Bytes(bytes)) => (None, Some(ensure_bytes(&bytes))),
            None => (None, None),
        };
        self.bytes(
            &format!("http/{}", method.as_str()),
            &HttpCall {
                descriptor: descriptor.to_string(),
                path: path.to_string(),
                json,
                data,
            },
        )
    }

    fn bytes<Req: Serialize>(&self, route: &str, body: &Req) -> AppResult<Vec<u8>> {
        let resp: BytesResponse = self.post(route, body)?;
        Ok(coerce_bytes(resp.data))
    }
}

/// Map a server error body back onto the matching local error where one exists.
fn remote_error(status: u16, body: ErrorBody) -> LabError {
    let ErrorBody {
        error,
        kind,
        descriptor,
        detail,
    } = body;
    match (kind.as_str(), descriptor) {
        ("invalid_descriptor", _) => LabError::InvalidDescriptor(detail.unwrap_or(error)),
        ("timeout", _) => LabError::Timeout(detail.unwrap_or(error)),
        ("backend_unavailable", Some(descriptor)) => LabError::BackendUnavailable {
            descriptor,
            reason: detail.unwrap_or(error),
        },
        ("channel_closed", Some(descriptor)) => LabError::ChannelClosed(descriptor),
        ("unsupported", Some(descriptor)) => LabError::Unsupported {
            descriptor,
            operation: detail.unwrap_or(error),
        },
        _ => LabError::Remote {
            status,
            message: error,
        },
    }
}
