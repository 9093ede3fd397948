//! Portable failure form and the codecs that carry it across a boundary.

use super::capture::PanicTrace;
use crate::error::{Error, Result};
use crate::isolation::BoundaryId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialized form of a failure crossing an isolation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEnvelope {
    /// Type name of the original payload.
    pub type_name: String,
    /// Message text of the original failure.
    pub message: String,
    /// Trace recorded where the failure was raised.
    pub trace: Option<PanicTrace>,
    /// Boundary the failure was raised in.
    pub origin: BoundaryId,
    /// Structured payload as encoded by the owning unit.
    pub body: Option<serde_json::Value>,
}

/// Format used for the round trip.
pub trait FailureCodec: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Encodes an envelope to bytes.
    fn encode(&self, envelope: &FailureEnvelope) -> Result<Vec<u8>>;

    /// Decodes bytes produced by [`FailureCodec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<FailureEnvelope>;
}

/// `serde_json` codec. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FailureCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &FailureEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| {
            Error::bridge(
                format!("failed to encode failure envelope: {e}"),
                Some(&envelope.type_name),
                envelope.origin,
            )
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<FailureEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::bridge(
                format!("failed to decode failure envelope: {e}"),
                None,
                BoundaryId::HOME,
            )
        })
    }
}

/// A failure reconstructed on the home side of a boundary.
///
/// Keeps the original type name, message, trace, and origin; the original
/// payload itself is available only in its encoded form via
/// [`RemoteFailure::body_as`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    type_name: String,
    message: String,
    trace: Option<PanicTrace>,
    origin: BoundaryId,
    body: Option<serde_json::Value>,
}

impl RemoteFailure {
    /// Type name of the original payload.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Original message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Trace recorded where the original failure was raised.
    #[must_use]
    pub fn trace(&self) -> Option<&PanicTrace> {
        self.trace.as_ref()
    }

    /// Boundary the original failure was raised in.
    #[must_use]
    pub const fn origin(&self) -> BoundaryId {
        self.origin
    }

    /// Decodes the structured payload into a home-side type of the same shape.
    pub fn body_as<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.body.clone().map(serde_json::from_value)
    }
}

impl From<FailureEnvelope> for RemoteFailure {
    fn from(envelope: FailureEnvelope) -> Self {
        Self {
            type_name: envelope.type_name,
            message: envelope.message,
            trace: envelope.trace,
            origin: envelope.origin,
            body: envelope.body,
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteFailure {}
