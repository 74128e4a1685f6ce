//! Wire protocol spoken with the embedding extractor.
//!
//! One JSON object per line in each direction. Requests carry a
//! [`CorrelationId`]; extractors that echo it back let the client pair
//! responses exactly, others are paired in request order.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Tag pairing one extractor request with its response.
///
/// Process-wide unique, so a stale id can never collide with a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed extractor message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages sent to the extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtractorRequest {
    Detect {
        id: CorrelationId,
        /// Base64-encoded JPEG.
        #[serde(alias = "base64")]
        image: String,
    },
}

impl ExtractorRequest {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages received from the extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtractorMessage {
    /// One-time readiness signal once models are initialised.
    ModelsLoaded,
    /// Free-form progress text.
    Status { message: String },
    FaceDetected {
        descriptor: Embedding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
    },
    NoFace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
    },
}

impl ExtractorMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Whether this message answers a detect request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            ExtractorMessage::FaceDetected { .. }
                | ExtractorMessage::NoFace { .. }
                | ExtractorMessage::Error { .. }
        )
    }

    /// Correlation id echoed by the extractor, if any.
    pub fn correlation(&self) -> Option<CorrelationId> {
        match self {
            ExtractorMessage::FaceDetected { id, .. }
            | ExtractorMessage::NoFace { id }
            | ExtractorMessage::Error { id, .. } => *id,
            ExtractorMessage::ModelsLoaded | ExtractorMessage::Status { .. } => None,
        }
    }
}
