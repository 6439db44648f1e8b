//! Fixed-length embedding vectors.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// A dense vector embedding.
///
/// The length is fixed when the vector is built; there is no way to push to
/// or truncate an `Embedding` afterwards. Producers check the length against
/// the provider dimension with [`Embedding::ensure_dimension`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Box<[f32]>);

impl Embedding {
    /// A vector of `dimension` zeros.
    pub fn zeros(dimension: usize) -> Self {
        Self(vec![0.0; dimension].into_boxed_slice())
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean norm.
    pub fn magnitude(&self) -> f32 {
        self.norm() as f32
    }

    fn norm(&self) -> f64 {
        self.0
            .iter()
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }

    /// Whether every component is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }

    /// Fail with [`EmbeddingError::DimensionMismatch`] unless the vector has
    /// exactly `expected` components.
    pub fn ensure_dimension(&self, expected: usize) -> Result<()> {
        if self.dimension() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: self.dimension(),
            });
        }
        Ok(())
    }

    /// Scale the vector to unit length. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm = self.norm();
        if norm > 0.0 && norm.is_finite() {
            for x in self.0.iter_mut() {
                *x = (f64::from(*x) / norm) as f32;
            }
        }
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0.into_vec()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values.into_boxed_slice())
    }
}

impl From<&[f32]> for Embedding {
    fn from(values: &[f32]) -> Self {
        Self(values.into())
    }
}

impl FromIterator<f32> for Embedding {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for Embedding {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl AsRef<[f32]> for Embedding {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize() {
        let mut v = Embedding::from(vec![3.0, 4.0]);
        v.normalize();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = Embedding::zeros(3);
        v.normalize();
        assert_eq!(v.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_normalize_huge_components() {
        let mut v = Embedding::from(vec![3.0e19, 4.0e19]);
        v.normalize();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!((v.magnitude() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::from(vec![1.0, f32::MAX]).is_finite());
        assert!(!Embedding::from(vec![1.0, f32::NAN]).is_finite());
        assert!(!Embedding::from(vec![f32::NEG_INFINITY]).is_finite());
    }

    #[test]
    fn test_ensure_dimension() {
        let v = Embedding::from(vec![1.0, 2.0]);
        assert!(v.ensure_dimension(2).is_ok());
        match v.ensure_dimension(3) {
            Err(EmbeddingError::DimensionMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (3, 2));
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let v = Embedding::from(vec![0.5, -1.25]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[0.5,-1.25]");

        let back: Embedding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
