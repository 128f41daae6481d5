//! Server-side vectorization used by enrollment.

use crate::types::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorizeError {
    #[error("identity already has enrolled descriptors")]
    AlreadyEnrolled,
    #[error("image rejected: {0}")]
    Rejected(String),
    #[error("vectorization service failure: {0}")]
    Upstream(String),
}

/// Where the vectorization service should fetch the enrollment image from.
///
/// Only `https://` URLs are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageLocator(String);

impl ImageLocator {
    pub fn new(url: impl AsRef<str>) -> Result<Self, VectorizeError> {
        let url = url.as_ref().trim();
        if !url.starts_with("https://") || url.len() <= "https://".len() {
            return Err(VectorizeError::Rejected(format!(
                "image locator must be an https:// URL, got {url:?}"
            )));
        }
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ImageLocator {
    type Error = VectorizeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageLocator> for String {
    fn from(value: ImageLocator) -> Self {
        value.0
    }
}

impl fmt::Display for ImageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to a vector the service stored on our behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRef(pub String);

impl fmt::Display for VectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates and persists a descriptor for an identity from a remote image.
///
/// May take materially longer than live extraction.
#[async_trait]
pub trait VectorizationService: Send + Sync {
    async fn vectorize(
        &self,
        identity: &Identity,
        locator: &ImageLocator,
    ) -> Result<VectorRef, VectorizeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_requires_https() {
        assert!(ImageLocator::new("https://cdn.example.com/faces/e1.jpg").is_ok());
        assert!(ImageLocator::new("http://cdn.example.com/faces/e1.jpg").is_err());
        assert!(ImageLocator::new("https://").is_err());
        assert!(ImageLocator::new("/tmp/face.jpg").is_err());
    }
}
