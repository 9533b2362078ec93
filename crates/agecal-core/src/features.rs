//! Feature assembly: two (embedding, age estimate) pairs → [`FacePairFeature`].

use crate::types::{AgeEstimate, Embedding, FacePairFeature, FeatureError};

/// Build the pair feature for two faces.
///
/// `similarity` is the dot product of the unit-normalized embeddings,
/// `age_diff` the absolute age gap, and `uncertainty` the mean of the two
/// per-face uncertainties. Pure and deterministic.
pub fn assemble(
    first: &Embedding,
    first_age: &AgeEstimate,
    second: &Embedding,
    second_age: &AgeEstimate,
) -> Result<FacePairFeature, FeatureError> {
    if first.dim() != second.dim() {
        return Err(FeatureError::DimensionMismatch {
            expected: first.dim(),
            got: second.dim(),
        });
    }

    let similarity = first.similarity(second);
    let age_diff = (first_age.age - second_age.age).abs();
    let uncertainty = (first_age.uncertainty + second_age.uncertainty) / 2.0;

    FacePairFeature::new(similarity, age_diff, uncertainty)
}

/// One face as seen by the calibrators: its embedding and estimated age.
#[derive(Debug, Clone)]
pub struct Face {
    pub embedding: Embedding,
    pub age: AgeEstimate,
}

impl Face {
    pub fn new(embedding: Embedding, age: AgeEstimate) -> Self {
        Self { embedding, age }
    }

    pub fn pair_feature(&self, other: &Face) -> Result<FacePairFeature, FeatureError> {
        assemble(&self.embedding, &self.age, &other.embedding, &other.age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_assemble_self_pair() {
        let e = emb(&[0.2, 0.4, -0.1, 0.9]);
        let a = AgeEstimate::new(31.0, 3.0).unwrap();
        let f = assemble(&e, &a, &e, &a).unwrap();
        assert!((f.similarity() - 1.0).abs() < 1e-6);
        assert_eq!(f.age_diff(), 0.0);
        assert_eq!(f.uncertainty(), 3.0);
    }

    #[test]
    fn test_assemble_age_diff_is_symmetric() {
        let e1 = emb(&[1.0, 0.0]);
        let e2 = emb(&[0.6, 0.8]);
        let young = AgeEstimate::new(20.0, 2.0).unwrap();
        let old = AgeEstimate::new(65.0, 6.0).unwrap();

        let forward = assemble(&e1, &young, &e2, &old).unwrap();
        let backward = assemble(&e2, &old, &e1, &young).unwrap();

        assert_eq!(forward.age_diff(), 45.0);
        assert_eq!(forward, backward);
        assert_eq!(forward.age_diff_squared(), 2025.0);
        assert_eq!(forward.uncertainty(), 4.0);
        assert!((forward.similarity() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_assemble_normalizes_raw_embeddings() {
        let e1 = emb(&[3.0, 4.0]);
        let e2 = emb(&[0.3, 0.4]);
        let a = AgeEstimate::new(40.0, 1.0).unwrap();
        let f = assemble(&e1, &a, &e2, &a).unwrap();
        assert!((f.similarity() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_assemble_dimension_mismatch() {
        let a = AgeEstimate::new(40.0, 1.0).unwrap();
        let err = assemble(&emb(&[1.0, 0.0]), &a, &emb(&[1.0, 0.0, 0.0]), &a).unwrap_err();
        assert_eq!(err, FeatureError::DimensionMismatch { expected: 2, got: 3 });
    }
}
