//! Custom error types for the crate.
//!
//! This module defines the primary error type, `LabError`, used by every layer of
//! labwire: descriptors, backends, the channel broker (local and remote), the
//! dependency objects handed between instruments, and the instrument tree itself.
//!
//! ## Error Hierarchy
//!
//! - **Addressing**: `InvalidDescriptor` for malformed channel descriptors. These are
//!   never retried.
//! - **Transport**: `BackendUnavailable` when the native transport (serial port driver,
//!   VISA library) is missing at `open()` time, `Unsupported` for per-kind verbs issued
//!   against the wrong backend, `ChannelClosed` when a handle outlives its backend.
//!   Plain I/O failures are wrapped in `Io`/`Http` and propagate unchanged.
//! - **Tree validation**: `TooManyChildren`, `SlotOutOfRange` and `InvalidSlotKey` are
//!   raised while validating Params, before any hardware I/O.
//! - **Composition**: `TypeMismatch` and `UnknownKind` indicate a config or registry bug.
//! - **Remote**: `RemoteUnavailable` when the broker cannot be reached, `Remote` for an
//!   error reported by a reachable broker.
//! - **Instrument protocols**: `VerificationFailed` and `InvalidResponse`.
//!
//! By using `#[from]`, `LabError` can be created from the underlying error types with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Errors produced anywhere in labwire.
#[derive(Error, Debug)]
pub enum LabError {
    /// Descriptor string did not match any supported grammar.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Native transport for a descriptor is not available in this build or on this host.
    #[error("Backend unavailable for '{descriptor}': {reason}")]
    BackendUnavailable {
        /// Descriptor that was being opened
        descriptor: String,
        /// Why the transport is unavailable
        reason: String,
    },

    /// A per-kind verb was issued against a backend that does not implement it.
    #[error("Operation '{operation}' is not supported by '{descriptor}'")]
    Unsupported {
        /// Descriptor of the backend
        descriptor: String,
        /// Verb that was requested
        operation: String,
    },

    /// The broker closed this channel.
    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    /// A dependency was used after its owning node released it.
    #[error("Dependency for '{0}' has been released")]
    DependencyReleased(String),

    /// More children configured than the parent holds.
    #[error("Too many children: {count} exceeds capacity {capacity}")]
    TooManyChildren { count: usize, capacity: usize },

    /// Integer key outside `0..capacity`.
    #[error("Slot key '{key}' is out of range (capacity {capacity})")]
    SlotOutOfRange { key: String, capacity: usize },

    /// Key that is not a canonical integer.
    #[error("Slot key '{0}' cannot be converted to an integer")]
    InvalidSlotKey(String),

    /// A factory received a Params variant or dependency it does not implement.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// No factory is registered for this type discriminator.
    #[error("Unknown instrument type '{0}'")]
    UnknownKind(String),

    /// Operation attempted on a node after `disconnect()`.
    #[error("Instrument '{0}' is disconnected")]
    NotConnected(String),

    /// Remote mode was requested but the broker could not be reached.
    #[error("Remote broker at '{uri}' is unavailable: {reason}")]
    RemoteUnavailable { uri: String, reason: String },

    /// The remote broker answered with an error.
    #[error("Remote broker error ({status}): {message}")]
    Remote {
        /// HTTP status of the reply
        status: u16,
        /// Error text reported by the broker
        message: String,
    },

    /// A reachable broker did not answer a call in time, e.g. a slow backend read.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A value written to an instrument did not read back as expected.
    #[error("Verification of {quantity} failed: expected {expected}, read back {actual}")]
    VerificationFailed {
        quantity: String,
        expected: String,
        actual: String,
    },

    /// Instrument reply could not be interpreted.
    #[error("Invalid instrument response: {0}")]
    InvalidResponse(String),

    /// A node marked itself disconnected but some of its own teardown steps failed.
    #[error("Teardown incomplete ({} errors)", .0.len())]
    TeardownIncomplete(Vec<LabError>),

    /// Semantic configuration error (validated values).
    #[error("Configuration validation error: {0}")]
    Config(String),

    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure talking to a remote broker.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<figment::Error> for LabError {
    fn from(err: figment::Error) -> Self {
        LabError::Figment(Box::new(err))
    }
}

impl LabError {
    /// Short machine-readable tag used on the broker wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::InvalidDescriptor(_) => "invalid_descriptor",
            LabError::BackendUnavailable { .. } => "backend_unavailable",
            LabError::Unsupported { .. } => "unsupported",
            LabError::ChannelClosed(_) => "channel_closed",
            LabError::DependencyReleased(_) => "dependency_released",
            LabError::TooManyChildren { .. } => "too_many_children",
            LabError::SlotOutOfRange { .. } => "slot_out_of_range",
            LabError::InvalidSlotKey(_) => "invalid_slot_key",
            LabError::TypeMismatch { .. } => "type_mismatch",
            LabError::UnknownKind(_) => "unknown_kind",
            LabError::NotConnected(_) => "not_connected",
            LabError::RemoteUnavailable { .. } => "remote_unavailable",
            LabError::Remote { .. } => "remote",
            LabError::Timeout(_) => "timeout",
            LabError::VerificationFailed { .. } => "verification_failed",
            LabError::InvalidResponse(_) => "invalid_response",
            LabError::TeardownIncomplete(_) => "teardown_incomplete",
            LabError::Config(_) | LabError::Figment(_) => "config",
            LabError::Io(_) => "io",
            LabError::Http(_) => "http",
            LabError::Json(_) => "json",
            LabError::Yaml(_) => "yaml",
        }
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        LabError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}
