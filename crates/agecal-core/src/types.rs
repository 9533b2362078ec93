use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of the face embeddings consumed by the age estimator.
pub const EMBEDDING_DIM: usize = 512;

/// Tolerance used when checking that a cosine similarity lies in [-1, 1].
const SIMILARITY_SLACK: f32 = 1e-4;

#[derive(Error, Debug, PartialEq)]
pub enum FeatureError {
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{0} must be finite")]
    NonFinite(&'static str),
    #[error("age difference must be non-negative, got {0}")]
    NegativeAgeDiff(f32),
    #[error("similarity {0} outside [-1, 1]")]
    SimilarityOutOfRange(f32),
    #[error("uncertainty must be non-negative, got {0}")]
    NegativeUncertainty(f32),
    #[error("age must be non-negative, got {0}")]
    NegativeAge(f32),
}

/// Face embedding vector (512-dimensional for the MobileFaceNet/ArcFace family).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobilefacenet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    /// Wrap raw provider output, rejecting empty or non-finite vectors.
    pub fn new(values: Vec<f32>) -> Result<Self, FeatureError> {
        if values.is_empty() {
            return Err(FeatureError::EmptyEmbedding);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FeatureError::NonFinite("embedding"));
        }
        Ok(Self {
            values,
            model_version: None,
        })
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the raw vector.
    pub fn norm(&self) -> f32 {
        self.values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Unit-normalized copy. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity: dot product of the two unit-normalized vectors.
    ///
    /// Both sides are normalized here, so callers may pass raw provider
    /// output. Returns a value clamped to [-1, 1]; 0.0 if either vector
    /// is all zeros.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }
}

/// Age estimate for one face, derived from its embedding by the age estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeEstimate {
    /// Estimated age in years.
    pub age: f32,
    /// Estimator uncertainty (years-scale, strictly positive in practice).
    pub uncertainty: f32,
}

impl AgeEstimate {
    pub fn new(age: f32, uncertainty: f32) -> Result<Self, FeatureError> {
        if !age.is_finite() {
            return Err(FeatureError::NonFinite("age"));
        }
        if !uncertainty.is_finite() {
            return Err(FeatureError::NonFinite("uncertainty"));
        }
        if age < 0.0 {
            return Err(FeatureError::NegativeAge(age));
        }
        if uncertainty < 0.0 {
            return Err(FeatureError::NegativeUncertainty(uncertainty));
        }
        Ok(Self { age, uncertainty })
    }
}

/// Per-pair features fed to the calibration strategies.
///
/// Fields are private so every instance has passed validation; build one
/// with [`FacePairFeature::new`] or [`crate::features::assemble`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFeature", into = "RawFeature")]
pub struct FacePairFeature {
    similarity: f32,
    age_diff: f32,
    uncertainty: f32,
}

/// Unvalidated wire form of [`FacePairFeature`].
#[derive(Serialize, Deserialize)]
struct RawFeature {
    similarity: f32,
    age_diff: f32,
    uncertainty: f32,
}

impl TryFrom<RawFeature> for FacePairFeature {
    type Error = FeatureError;

    fn try_from(raw: RawFeature) -> Result<Self, Self::Error> {
        FacePairFeature::new(raw.similarity, raw.age_diff, raw.uncertainty)
    }
}

impl From<FacePairFeature> for RawFeature {
    fn from(f: FacePairFeature) -> Self {
        RawFeature {
            similarity: f.similarity,
            age_diff: f.age_diff,
            uncertainty: f.uncertainty,
        }
    }
}

impl FacePairFeature {
    pub fn new(similarity: f32, age_diff: f32, uncertainty: f32) -> Result<Self, FeatureError> {
        if !similarity.is_finite() {
            return Err(FeatureError::NonFinite("similarity"));
        }
        if !age_diff.is_finite() {
            return Err(FeatureError::NonFinite("age_diff"));
        }
        if !uncertainty.is_finite() {
            return Err(FeatureError::NonFinite("uncertainty"));
        }
        if !(-1.0 - SIMILARITY_SLACK..=1.0 + SIMILARITY_SLACK).contains(&similarity) {
            return Err(FeatureError::SimilarityOutOfRange(similarity));
        }
        if age_diff < 0.0 {
            return Err(FeatureError::NegativeAgeDiff(age_diff));
        }
        if uncertainty < 0.0 {
            return Err(FeatureError::NegativeUncertainty(uncertainty));
        }
        Ok(Self {
            similarity: similarity.clamp(-1.0, 1.0),
            age_diff,
            uncertainty,
        })
    }

    pub fn similarity(&self) -> f32 {
        self.similarity
    }

    /// Absolute age gap in years.
    pub fn age_diff(&self) -> f32 {
        self.age_diff
    }

    pub fn age_diff_squared(&self) -> f32 {
        self.age_diff * self.age_diff
    }

    /// Mean of the two per-face uncertainties.
    pub fn uncertainty(&self) -> f32 {
        self.uncertainty
    }

    /// `[similarity, age_diff, uncertainty]`, the learned calibrator input.
    pub fn to_learned_input(&self) -> [f32; 3] {
        [self.similarity, self.age_diff, self.uncertainty]
    }

    /// `[similarity, age_diff, age_diff², uncertainty]`, the linear calibrator input.
    pub fn to_linear_input(&self) -> [f64; 4] {
        let age = f64::from(self.age_diff);
        [
            f64::from(self.similarity),
            age,
            age * age,
            f64::from(self.uncertainty),
        ]
    }
}

/// A pair feature with its ground-truth (or heuristic) identity label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledPair {
    pub feature: FacePairFeature,
    /// `true` = same person (label 1), `false` = different people (label 0).
    pub same: bool,
}

impl LabeledPair {
    pub fn new(feature: FacePairFeature, same: bool) -> Self {
        Self { feature, same }
    }

    /// Binary target as a float (1.0 same, 0.0 different).
    pub fn target(&self) -> f32 {
        if self.same {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_identical() {
        let a = Embedding::new(vec![0.3, -0.7, 2.0]).unwrap();
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![0.0, 1.0]).unwrap();
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![-4.0, 0.0]).unwrap();
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]).unwrap();
        let b = Embedding::new(vec![1.0, 0.0]).unwrap();
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_ignores_scale() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]).unwrap();
        let b = Embedding::new(vec![10.0, 20.0, 30.0]).unwrap();
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let a = Embedding::new(vec![3.0, 4.0]).unwrap();
        assert!((a.normalized().norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_rejects_empty_and_nan() {
        assert_eq!(Embedding::new(vec![]), Err(FeatureError::EmptyEmbedding));
        assert!(Embedding::new(vec![1.0, f32::NAN]).is_err());
    }

    #[test]
    fn test_feature_rejects_negative_age_diff() {
        let err = FacePairFeature::new(0.5, -1.0, 0.0).unwrap_err();
        assert_eq!(err, FeatureError::NegativeAgeDiff(-1.0));
    }

    #[test]
    fn test_feature_rejects_bad_similarity_and_uncertainty() {
        assert!(FacePairFeature::new(1.5, 0.0, 0.0).is_err());
        assert!(FacePairFeature::new(0.5, 0.0, -0.1).is_err());
        assert!(FacePairFeature::new(f32::NAN, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_feature_deserialize_validates() {
        let ok: FacePairFeature =
            serde_json::from_str(r#"{"similarity":0.4,"age_diff":12.0,"uncertainty":2.0}"#).unwrap();
        assert_eq!(ok.age_diff_squared(), 144.0);

        let bad = serde_json::from_str::<FacePairFeature>(
            r#"{"similarity":0.4,"age_diff":-3.0,"uncertainty":2.0}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_age_estimate_validation() {
        assert!(AgeEstimate::new(30.0, 2.0).is_ok());
        assert!(AgeEstimate::new(-1.0, 2.0).is_err());
        assert!(AgeEstimate::new(30.0, -2.0).is_err());
    }
}
