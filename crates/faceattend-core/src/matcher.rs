//! Nearest-neighbour matching of a probe embedding against a roster.

use crate::types::{Embedding, EnrolledIdentity, Match, MatchResult, Roster};
use std::sync::Arc;

/// Maximum Euclidean distance accepted as a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a probe embedding against the enrolled roster.
pub trait Matcher {
    fn find_best_match(&self, probe: &Embedding, roster: &Roster, threshold: f32) -> MatchResult;
}

/// Brute-force Euclidean matcher.
///
/// Scans every sample of every identity in roster order, then sample order.
/// The globally closest sample wins; on an exact tie the first one scanned
/// is kept. Ordering is done on squared distances and the square root is
/// taken once for the winner.
///
/// A match requires `distance < threshold`, so a threshold of zero or below
/// never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_best_match(&self, probe: &Embedding, roster: &Roster, threshold: f32) -> MatchResult {
        let mut best: Option<(&Arc<EnrolledIdentity>, f32)> = None;

        for identity in roster.iter() {
            for sample in &identity.embeddings {
                // Mismatched lengths and NaN components are never candidates.
                let Some(sq) = probe.squared_distance(sample) else {
                    continue;
                };
                if sq.is_nan() {
                    continue;
                }
                if best.map_or(true, |(_, best_sq)| sq < best_sq) {
                    best = Some((identity, sq));
                }
            }
        }

        let Some((identity, best_sq)) = best else {
            tracing::debug!(identities = roster.len(), "no comparable samples in roster");
            return MatchResult::NoMatch { closest: None };
        };

        let distance = best_sq.sqrt();
        if distance < threshold {
            return MatchResult::Match(Match {
                identity: Arc::clone(identity),
                distance,
            });
        }

        MatchResult::NoMatch {
            closest: Some(distance),
        }
    }
}
