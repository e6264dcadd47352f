use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label returned for a face that matches no registered identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("identity {0:?} is reserved for unmatched faces")]
    ReservedIdentity(String),
    #[error("scope must have at least one segment")]
    EmptyScope,
    #[error("invalid scope segment {0:?}: segments must be non-empty and must not contain '/'")]
    InvalidScopeSegment(String),
    #[error("embedding dimension mismatch: reference set holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding must not be empty")]
    EmptyEmbedding,
}

/// Bounding box for a detected face, in pixels of the (normalized) input image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, confidence: 1.0 }
    }

    /// Intersect with a `width` × `height` image.
    ///
    /// Returns `(x, y, w, h)` with non-negative origin, or `None` when the
    /// box lies entirely outside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = i64::from(self.x).max(0);
        let y0 = i64::from(self.y).max(0);
        let x1 = (i64::from(self.x) + i64::from(self.width)).min(i64::from(width));
        let y1 = (i64::from(self.y) + i64::from(self.height)).min(i64::from(height));

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) distance: `sqrt(sum((a_i - b_i)^2))`.
    ///
    /// Every distance comparison in the crate goes through this one formula.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque label (roll number) of an enrolled individual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(label: impl Into<String>) -> Result<Self, TypeError> {
        let label = label.into();
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(TypeError::EmptyIdentity);
        }
        if trimmed.eq_ignore_ascii_case(UNKNOWN_LABEL) {
            return Err(TypeError::ReservedIdentity(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// Grouping key (batch/program, or dept/program/semester/class) under which
/// a reference set is stored and queried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    key: String,
}

impl Scope {
    pub fn new<I, S>(segments: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = Vec::new();
        for segment in segments {
            let segment = segment.as_ref().trim();
            if segment.is_empty() || segment.contains('/') {
                return Err(TypeError::InvalidScopeSegment(segment.to_string()));
            }
            parts.push(segment.to_string());
        }
        if parts.is_empty() {
            return Err(TypeError::EmptyScope);
        }
        Ok(Self { key: parts.join("/") })
    }

    /// The `/`-joined key used for persistence.
    pub fn as_key(&self) -> &str {
        &self.key
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.key.split('/')
    }
}

impl FromStr for Scope {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TypeError::EmptyScope);
        }
        Self::new(s.split('/'))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Parallel (embeddings, identities) sequences used for nearest-neighbour
/// matching. Index `i` of one sequence corresponds to index `i` of the other.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    embeddings: Vec<Embedding>,
    identities: Vec<Identity>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one (embedding, identity) pair.
    pub fn push(&mut self, embedding: Embedding, identity: Identity) -> Result<(), TypeError> {
        if embedding.values.is_empty() {
            return Err(TypeError::EmptyEmbedding);
        }
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(TypeError::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }
        self.embeddings.push(embedding);
        self.identities.push(identity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.embeddings.len(), self.identities.len());
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Dimension shared by every stored embedding, `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dimension)
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Embedding, &Identity)> {
        self.embeddings.iter().zip(self.identities.iter())
    }
}

/// Outcome of matching one face against a reference set.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Known { identity: Identity, distance: f32 },
    /// No reference embedding was strictly closer than the threshold.
    /// `nearest` is the best distance seen, `None` for an empty reference set.
    Unknown { nearest: Option<f32> },
}

impl Recognition {
    pub fn label(&self) -> &str {
        match self {
            Recognition::Known { identity, .. } => identity.as_str(),
            Recognition::Unknown { .. } => UNKNOWN_LABEL,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Recognition::Known { identity, .. } => Some(identity),
            Recognition::Unknown { .. } => None,
        }
    }

    /// Distance to the nearest reference embedding, if there was one.
    pub fn distance(&self) -> Option<f32> {
        match self {
            Recognition::Known { distance, .. } => Some(*distance),
            Recognition::Unknown { nearest } => *nearest,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Recognition::Known { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), 5.0);
        assert_eq!(b.euclidean_distance(&a), 5.0);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_identity_trims_and_rejects_sentinel() {
        assert_eq!(id("  101 ").as_str(), "101");
        assert_eq!(Identity::new("   "), Err(TypeError::EmptyIdentity));
        assert!(matches!(Identity::new("Unknown"), Err(TypeError::ReservedIdentity(_))));
        assert!(matches!(Identity::new("unknown"), Err(TypeError::ReservedIdentity(_))));
    }

    #[test]
    fn test_identity_serde_validates() {
        let ok: Identity = serde_json::from_str("\"101\"").unwrap();
        assert_eq!(ok.as_str(), "101");
        assert!(serde_json::from_str::<Identity>("\"\"").is_err());
    }

    #[test]
    fn test_scope_parse_and_display() {
        let scope: Scope = "CS/BS CS/Fall 2020/CS101".parse().unwrap();
        assert_eq!(scope.as_key(), "CS/BS CS/Fall 2020/CS101");
        assert_eq!(scope.segments().count(), 4);

        let built = Scope::new(["32", "ai"]).unwrap();
        assert_eq!(built.to_string(), "32/ai");
    }

    #[test]
    fn test_scope_rejects_bad_segments() {
        assert_eq!("".parse::<Scope>(), Err(TypeError::EmptyScope));
        assert!(matches!("32//ai".parse::<Scope>(), Err(TypeError::InvalidScopeSegment(_))));
        assert!(matches!(Scope::new(["a/b"]), Err(TypeError::InvalidScopeSegment(_))));
        assert_eq!(Scope::new(Vec::<String>::new()), Err(TypeError::EmptyScope));
    }

    #[test]
    fn test_reference_set_keeps_sequences_parallel() {
        let mut set = ReferenceSet::new();
        assert!(set.is_empty());
        assert_eq!(set.dimension(), None);

        set.push(Embedding::new(vec![1.0, 0.0]), id("101")).unwrap();
        set.push(Embedding::new(vec![0.0, 1.0]), id("102")).unwrap();
        let err = set.push(Embedding::new(vec![0.0, 1.0, 0.0]), id("103"));
        assert_eq!(err, Err(TypeError::DimensionMismatch { expected: 2, actual: 3 }));

        assert_eq!(set.len(), 2);
        assert_eq!(set.embeddings().len(), set.identities().len());
        assert_eq!(set.identities()[1].as_str(), "102");
    }

    #[test]
    fn test_reference_set_rejects_empty_embedding() {
        let mut set = ReferenceSet::new();
        assert_eq!(set.push(Embedding::new(vec![]), id("101")), Err(TypeError::EmptyEmbedding));
        assert!(set.is_empty());
    }

    #[test]
    fn test_bbox_clamp() {
        let b = BoundingBox::new(-10, 5, 30, 20);
        assert_eq!(b.clamp_to(100, 100), Some((0, 5, 20, 20)));

        let edge = BoundingBox::new(90, 90, 30, 30);
        assert_eq!(edge.clamp_to(100, 100), Some((90, 90, 10, 10)));

        let outside = BoundingBox::new(200, 200, 10, 10);
        assert_eq!(outside.clamp_to(100, 100), None);
    }

    #[test]
    fn test_recognition_label() {
        let known = Recognition::Known { identity: id("101"), distance: 0.3 };
        assert_eq!(known.label(), "101");
        assert_eq!(known.distance(), Some(0.3));

        let unknown = Recognition::Unknown { nearest: None };
        assert_eq!(unknown.label(), UNKNOWN_LABEL);
        assert!(!unknown.is_known());
        assert_eq!(unknown.identity(), None);
    }
}
