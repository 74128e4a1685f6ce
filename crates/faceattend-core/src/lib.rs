//! faceattend-core — Roster matching for face attendance.
//!
//! Pure, synchronous building blocks: embedding distance, nearest-neighbour
//! matching against an enrolled roster, and the JSON message protocol spoken
//! with the out-of-process embedding extractor.

pub mod matcher;
pub mod protocol;
pub mod types;

pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use protocol::{CorrelationId, ExtractorMessage, ExtractorRequest, ProtocolError};
pub use types::{distance, Embedding, EnrolledIdentity, IdentityId, Match, MatchResult, Roster};
