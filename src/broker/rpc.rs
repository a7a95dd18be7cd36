//! JSON bodies of the broker RPC surface.
//!
//! | Route | Request | Response |
//! |---|---|---|
//! | `GET /health` | | [`HealthResponse`] |
//! | `GET /descriptors` | | [`DescriptorsResponse`] |
//! | `POST /acquire` | [`DescriptorRequest`] | [`AcquireResponse`] |
//! | `POST /write` | [`WriteRequest`] | [`WriteResponse`] |
//! | `POST /read` | [`ReadRequest`] | [`BytesResponse`] |
//! | `POST /readline` | [`DescriptorRequest`] | [`BytesResponse`] |
//! | `POST /close` | [`DescriptorRequest`] | [`CloseResponse`] |
//! | `POST /serial/query` | [`QueryRequest`] | [`BytesResponse`] |
//! | `POST /visa/read_bytes` | [`ReadRequest`] | [`BytesResponse`] |
//! | `POST /visa/query` | [`QueryRequest`] | [`BytesResponse`] |
//! | `POST /visa/clear` | [`DescriptorRequest`] | [`AckResponse`] |
//! | `POST /visa/set_timeout` | [`TimeoutRequest`] | [`AckResponse`] |
//! | `POST /http/{get,put,post,delete}` | [`HttpCall`] | [`BytesResponse`] |
//!
//! Errors come back as [`ErrorBody`] with a 4xx/5xx status.

use crate::codec::Payload;
use crate::error::LabError;
use serde::{Deserialize, Serialize};

/// Request naming one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorRequest {
    /// Channel descriptor
    pub descriptor: String,
}

/// Bytes to write on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Channel descriptor
    pub descriptor: String,
    /// Payload, raw text or base64 envelope
    pub data: Payload,
}

/// Read from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Channel descriptor
    pub descriptor: String,
    /// Maximum bytes; everything available when absent
    #[serde(default)]
    pub size: Option<usize>,
}

/// Write `data`, then read the reply on the same backend without interleaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Channel descriptor
    pub descriptor: String,
    /// Command bytes
    pub data: Payload,
    /// Maximum reply bytes
    #[serde(default)]
    pub size: Option<usize>,
}

/// New session timeout for a VISA channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutRequest {
    /// Channel descriptor
    pub descriptor: String,
    /// Seconds
    pub timeout: f64,
}

/// Request relayed to an HTTP backend; `json` wins over `data` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCall {
    /// Channel descriptor (`http://host:port[/base]`)
    pub descriptor: String,
    /// Path below the base URL
    pub path: String,
    /// JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    /// Raw body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

/// Broker liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    /// Open channels
    pub channels: usize,
}

/// Open channels, sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorsResponse {
    /// Canonical descriptors
    pub descriptors: Vec<String>,
}

/// Channel now open on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireResponse {
    /// Canonical descriptor the broker cached the channel under
    pub descriptor: String,
    /// Descriptor kind (`serial`, `visa`, `http`, `dummy`)
    pub kind: String,
    /// Whether a simulator stands in for the transport
    pub simulated: bool,
}

/// Bytes accepted by a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Byte count
    pub written: usize,
}

/// Bytes returned by a read or query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytesResponse {
    /// Reply, wrapped as a base64 envelope
    pub data: Payload,
}

/// Result of a close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResponse {
    /// False when the channel was not open
    pub closed: bool,
}

/// Acknowledgement of a call without a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    /// Always true on success
    pub ok: bool,
}

/// Error reply. `descriptor` and `detail` carry the fields of the variants the
/// client rebuilds, so a remote error prints like the local one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Display text of the error
    pub error: String,
    /// [`LabError::kind`] tag
    pub kind: String,
    /// Channel the error is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    /// Variant payload without the descriptor (reason, operation, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    /// Body for `err`.
    pub fn from_error(err: &LabError) -> Self {
        let (descriptor, detail) = match err {
            LabError::InvalidDescriptor(detail) | LabError::Timeout(detail) => {
                (None, Some(detail.clone()))
            }
            LabError::BackendUnavailable { descriptor, reason } => {
                (Some(descriptor.clone()), Some(reason.clone()))
            }
            LabError::Unsupported {
                descriptor,
                operation,
            } => (Some(descriptor.clone()), Some(operation.clone())),
            LabError::ChannelClosed(descriptor) => (Some(descriptor.clone()), None),
            _ => (None, None),
        };
        Self {
            error: err.to_string(),
            kind: err.kind().to_string(),
            descriptor,
            detail,
        }
    }
}
