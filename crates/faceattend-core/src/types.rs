use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// Face embedding vector (128-dimensional for the face-api extractor).
///
/// Immutable once produced: the values are only reachable as a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of squared component differences.
    ///
    /// Returns `None` when the lengths differ or either side is empty; such a
    /// pair has no meaningful distance and must never be selected as a match.
    pub fn squared_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>(),
        )
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Incomparable pairs yield `f32::INFINITY`, which is larger than any real
    /// distance and therefore fails every threshold.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.squared_distance(other)
            .map_or(f32::INFINITY, f32::sqrt)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Distance between two possibly-absent embeddings.
///
/// Absent inputs are treated like mismatched lengths: the sentinel
/// `f32::INFINITY` is returned and nothing panics.
pub fn distance(a: Option<&Embedding>, b: Option<&Embedding>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => a.euclidean_distance(b),
        _ => f32::INFINITY,
    }
}

/// Identifier of an enrolled identity, kept in the JSON form the server used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentityId {
    Number(i64),
    Text(String),
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityId::Number(n) => write!(f, "{n}"),
            IdentityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for IdentityId {
    fn from(n: i64) -> Self {
        IdentityId::Number(n)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        IdentityId::Text(s.to_string())
    }
}

/// An enrolled employee with one or more reference embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub id: IdentityId,
    #[serde(default)]
    pub name: String,
    /// Enrolled samples. Malformed entries are dropped while decoding, so an
    /// identity may end up with none; the matcher skips it.
    #[serde(
        rename = "descriptors",
        alias = "embeddings",
        default,
        deserialize_with = "lenient_embeddings"
    )]
    pub embeddings: Vec<Embedding>,
}

impl EnrolledIdentity {
    pub fn new(id: impl Into<IdentityId>, name: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            embeddings,
        }
    }
}

/// Accept `null`, non-arrays, and arrays with junk entries; keep only
/// non-empty numeric sequences.
fn lenient_embeddings<'de, D>(deserializer: D) -> Result<Vec<Embedding>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(serde_json::Value::Array(items)) = raw else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<Vec<f32>>(item).ok())
        .filter(|values| !values.is_empty())
        .map(Embedding::new)
        .collect())
}

/// Read-only snapshot of the enrolled identities.
///
/// Shared behind `Arc` by whoever holds it; a reload builds a new snapshot
/// rather than mutating this one.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    identities: Vec<Arc<EnrolledIdentity>>,
}

impl Roster {
    pub fn new(identities: Vec<EnrolledIdentity>) -> Self {
        Self {
            identities: identities.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EnrolledIdentity>> {
        self.identities.iter()
    }

    /// Total number of enrolled samples across all identities.
    pub fn sample_count(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }
}

impl FromIterator<EnrolledIdentity> for Roster {
    fn from_iter<T: IntoIterator<Item = EnrolledIdentity>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A positive match of a probe against the roster.
#[derive(Debug, Clone)]
pub struct Match {
    pub identity: Arc<EnrolledIdentity>,
    /// Euclidean distance to the closest enrolled sample.
    pub distance: f32,
}

impl Match {
    /// Display confidence, `(1 - distance) * 100` rounded to one decimal.
    ///
    /// Derived from the distance; it plays no part in matching.
    pub fn confidence_percent(&self) -> f32 {
        ((1.0 - self.distance) * 1000.0).round() / 10.0
    }
}

/// Result of matching a probe embedding against a roster.
#[derive(Debug, Clone)]
pub enum MatchResult {
    Match(Match),
    /// No sample was close enough. `closest` is the best distance seen, if
    /// any comparable sample existed.
    NoMatch { closest: Option<f32> },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Match(_))
    }

    pub fn into_match(self) -> Option<Match> {
        match self {
            MatchResult::Match(m) => Some(m),
            MatchResult::NoMatch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = emb(&[0.25, -1.5, 3.0, 0.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[-0.5, 4.0, 2.5]);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
    }

    #[test]
    fn test_distance_known_value() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.squared_distance(&b), Some(25.0));
    }

    #[test]
    fn test_mismatched_lengths_yield_sentinel() {
        let a = emb(&[1.0, 2.0]);
        let b = emb(&[1.0, 2.0, 3.0]);
        assert_eq!(a.squared_distance(&b), None);
        assert_eq!(a.euclidean_distance(&b), f32::INFINITY);
        assert!(a.euclidean_distance(&b) > f32::MAX);
    }

    #[test]
    fn test_absent_inputs_yield_sentinel() {
        let a = emb(&[1.0]);
        assert_eq!(distance(Some(&a), None), f32::INFINITY);
        assert_eq!(distance(None, Some(&a)), f32::INFINITY);
        assert_eq!(distance(None, None), f32::INFINITY);
        assert_eq!(distance(Some(&a), Some(&a)), 0.0);
    }

    #[test]
    fn test_empty_embeddings_are_incomparable() {
        let empty = emb(&[]);
        assert_eq!(empty.euclidean_distance(&empty), f32::INFINITY);
    }

    #[test]
    fn test_confidence_is_derived_from_distance() {
        let identity = Arc::new(EnrolledIdentity::new(1, "Ada", vec![emb(&[0.0])]));
        let m = Match { identity: identity.clone(), distance: 0.3 };
        assert!((m.confidence_percent() - 70.0).abs() < 1e-4);

        let m = Match { identity, distance: 0.4567 };
        assert!((m.confidence_percent() - 54.3).abs() < 1e-4);
    }

    #[test]
    fn test_identity_decodes_numeric_and_text_ids() {
        let json = r#"[
            {"id": 7, "name": "Ada", "descriptors": [[0.1, 0.2]]},
            {"id": "emp-9", "name": "Grace", "descriptors": [[0.3, 0.4], [0.5, 0.6]]}
        ]"#;
        let ids: Vec<EnrolledIdentity> = serde_json::from_str(json).unwrap();
        assert_eq!(ids[0].id, IdentityId::Number(7));
        assert_eq!(ids[1].id, IdentityId::from("emp-9"));
        assert_eq!(ids[1].id.to_string(), "emp-9");
        assert_eq!(ids[1].embeddings.len(), 2);
        assert_eq!(serde_json::to_value(&ids[0].id).unwrap(), serde_json::json!(7));
    }

    #[test]
    fn test_identity_tolerates_malformed_descriptors() {
        let json = r#"[
            {"id": 1, "name": "missing"},
            {"id": 2, "name": "null", "descriptors": null},
            {"id": 3, "name": "object", "descriptors": {"a": 1}},
            {"id": 4, "name": "mixed", "descriptors": [[0.1, 0.2], "junk", [], [0.3, "x"], [0.5, 0.6]]}
        ]"#;
        let ids: Vec<EnrolledIdentity> = serde_json::from_str(json).unwrap();
        assert!(ids[0].embeddings.is_empty());
        assert!(ids[1].embeddings.is_empty());
        assert!(ids[2].embeddings.is_empty());
        assert_eq!(ids[3].embeddings, vec![emb(&[0.1, 0.2]), emb(&[0.5, 0.6])]);
    }

    #[test]
    fn test_roster_counts() {
        let roster: Roster = vec![
            EnrolledIdentity::new(1, "a", vec![emb(&[0.0]), emb(&[1.0])]),
            EnrolledIdentity::new(2, "b", vec![]),
        ]
        .into_iter()
        .collect();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.sample_count(), 2);
        assert!(!roster.is_empty());
        assert!(Roster::default().is_empty());
    }
}
