use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted identity string, after trimming.
pub const MAX_IDENTITY_LEN: usize = 50;

/// Default maximum distance for a positive match.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor value at index {index} is not finite")]
    NonFinite { index: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity is {len} characters long, limit is {max}")]
    TooLong { len: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("threshold must be a finite value above zero, got {0}")]
pub struct ThresholdError(pub f32);

/// Stable identifier of one enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity. Surrounding whitespace is trimmed.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentityError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        let len = trimmed.chars().count();
        if len > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong {
                len,
                max: MAX_IDENTITY_LEN,
            });
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

impl std::str::FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

/// Face descriptor: a fixed-length embedding produced by an extractor.
///
/// Immutable once built. Descriptors of different lengths are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    /// Number of dimensions (N).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to `other`, or `None` when the dimensions differ.
    ///
    /// Accumulates in f64 so that distinct descriptors never collapse to 0.
    pub fn distance(&self, other: &Descriptor) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum();
        Some(sum.sqrt() as f32)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(value: Descriptor) -> Self {
        value.values
    }
}

/// Distance metric an extractor's descriptors are calibrated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DistanceMetric {
    Euclidean,
}

/// Maximum distance (exclusive) for a positive match.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, ThresholdError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ThresholdError(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// Strict less-than: a distance equal to the threshold is not a match.
    pub fn accepts(self, distance: f32) -> bool {
        distance < self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

/// One enrolled reference descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    /// Store key (UUID v4 for locally created entries).
    pub id: String,
    pub identity: Identity,
    pub descriptor: Descriptor,
    pub enrolled_at: DateTime<Utc>,
}

impl GalleryEntry {
    /// New entry stamped with a fresh id and the current time.
    pub fn new(identity: Identity, descriptor: Descriptor) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            descriptor,
            enrolled_at: Utc::now(),
        }
    }
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    /// Closest enrolled descriptor is under the threshold.
    Matched { identity: Identity, distance: f32 },
    /// Nothing under the threshold. `best_distance` is +inf for an empty gallery.
    NoMatch { best_distance: f32 },
    NoFaceDetected,
    /// More than one face where exactly one was required.
    AmbiguousCapture,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Matched { distance, .. } => Some(*distance),
            MatchResult::NoMatch { best_distance } => Some(*best_distance),
            MatchResult::NoFaceDetected | MatchResult::AmbiguousCapture => None,
        }
    }

    /// Confidence percentage, `max(0, 1 - distance) * 100`.
    pub fn confidence(&self) -> Option<f32> {
        self.distance().map(|d| ((1.0 - d).max(0.0)) * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = desc(&[0.25, -1.5, 3.0, 0.0]);
        assert_eq!(a.distance(&a), Some(0.0));
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = desc(&[0.1, 0.7, -0.3]);
        let b = desc(&[0.9, -0.2, 0.4]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_known_value() {
        let a = desc(&[0.0, 0.0]);
        let b = desc(&[3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_tiny_difference_is_nonzero() {
        let a = desc(&[1.0, 1.0]);
        let b = desc(&[1.0, 1.0 + f32::EPSILON]);
        assert!(a.distance(&b).unwrap() > 0.0);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = desc(&[1.0, 0.0]);
        let b = desc(&[1.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), None);
    }

    #[test]
    fn test_descriptor_rejects_empty_and_nan() {
        assert_eq!(Descriptor::new(vec![]), Err(DescriptorError::Empty));
        assert_eq!(
            Descriptor::new(vec![0.0, f32::NAN]),
            Err(DescriptorError::NonFinite { index: 1 })
        );
    }

    #[test]
    fn test_descriptor_deserialize_validates() {
        let ok: Descriptor = serde_json::from_str("[0.5, 0.25]").unwrap();
        assert_eq!(ok.as_slice(), &[0.5, 0.25]);
        assert!(serde_json::from_str::<Descriptor>("[]").is_err());
    }

    #[test]
    fn test_identity_validation() {
        assert_eq!(Identity::new("  E1 ").unwrap().as_str(), "E1");
        assert_eq!(Identity::new("   "), Err(IdentityError::Empty));
        assert!(Identity::new("x".repeat(MAX_IDENTITY_LEN)).is_ok());
        assert_eq!(
            Identity::new("x".repeat(MAX_IDENTITY_LEN + 1)),
            Err(IdentityError::TooLong {
                len: MAX_IDENTITY_LEN + 1,
                max: MAX_IDENTITY_LEN
            })
        );
    }

    #[test]
    fn test_threshold_validation() {
        assert_eq!(Threshold::default().value(), DEFAULT_THRESHOLD);
        assert!(Threshold::new(0.0).is_err());
        assert!(Threshold::new(-0.1).is_err());
        assert!(Threshold::new(f32::INFINITY).is_err());
        let t = Threshold::new(0.6).unwrap();
        assert!(t.accepts(0.59));
        assert!(!t.accepts(0.6));
    }

    #[test]
    fn test_confidence() {
        let matched = MatchResult::Matched {
            identity: Identity::new("E1").unwrap(),
            distance: 0.25,
        };
        assert!((matched.confidence().unwrap() - 75.0).abs() < 1e-4);

        let far = MatchResult::NoMatch { best_distance: 1.4 };
        assert_eq!(far.confidence(), Some(0.0));
        assert_eq!(MatchResult::NoFaceDetected.confidence(), None);
    }

    #[test]
    fn test_match_result_json_shape() {
        let matched = MatchResult::Matched {
            identity: Identity::new("E2").unwrap(),
            distance: 0.5,
        };
        let json = serde_json::to_value(&matched).unwrap();
        assert_eq!(json["outcome"], "matched");
        assert_eq!(json["identity"], "E2");

        let json = serde_json::to_value(MatchResult::AmbiguousCapture).unwrap();
        assert_eq!(json["outcome"], "ambiguous_capture");
    }
}
