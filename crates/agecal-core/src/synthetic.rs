//! Fallback training pairs for when no verified cross-age identity pairs
//! exist.
//!
//! Negatives are random distinct pairs from a pool assumed to hold no
//! repeated identities. Positives are pairs within a sliding window whose
//! similarity exceeds a fixed threshold. That proxy conflates "very similar"
//! with "same person", so calibrators fitted on it tend to re-derive a
//! similarity threshold; see [`HEURISTIC_CAVEAT`].

use crate::features::Face;
use crate::types::LabeledPair;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HEURISTIC_CAVEAT: &str = "same-person labels come from a similarity threshold, not verified identities; \
a calibrator fitted on them is expected to reproduce that threshold and ignore age gap. \
Use verified cross-age pairs (e.g. AgeDB-30 or CALFW) for a meaningful calibrator";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SyntheticError {
    #[error("pool has {0} faces; at least 2 are needed")]
    PoolTooSmall(usize),
}

/// Where a set of labeled pairs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairProvenance {
    /// Labels from a verified identity list.
    Verified,
    /// Labels from [`generate`]'s similarity proxy.
    SimilarityHeuristic,
}

impl PairProvenance {
    pub fn caveat(&self) -> Option<&'static str> {
        match self {
            PairProvenance::Verified => None,
            PairProvenance::SimilarityHeuristic => Some(HEURISTIC_CAVEAT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub negative_pairs: usize,
    pub positive_pairs: usize,
    /// Each face is compared with the next `window` faces.
    pub window: usize,
    /// Similarity strictly above this is labeled same-person.
    pub positive_threshold: f32,
    pub seed: u64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            negative_pairs: 1000,
            positive_pairs: 200,
            window: 200,
            positive_threshold: 0.75,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticPairs {
    pub pairs: Vec<LabeledPair>,
    pub positives: usize,
    pub negatives: usize,
    /// Positive candidates found before sampling.
    pub candidates: usize,
    /// Pairs whose feature failed validation.
    pub skipped: usize,
}

impl SyntheticPairs {
    pub fn provenance(&self) -> PairProvenance {
        PairProvenance::SimilarityHeuristic
    }

    pub fn caveat(&self) -> &'static str {
        HEURISTIC_CAVEAT
    }
}

/// Build heuristically labeled pairs from an unlabeled pool.
pub fn generate(pool: &[Face], options: &SyntheticOptions) -> Result<SyntheticPairs, SyntheticError> {
    if pool.len() < 2 {
        return Err(SyntheticError::PoolTooSmall(pool.len()));
    }
    tracing::warn!(caveat = HEURISTIC_CAVEAT, "labeling pairs with the similarity heuristic");

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut pairs = Vec::with_capacity(options.negative_pairs + options.positive_pairs);
    let mut skipped = 0usize;

    for _ in 0..options.negative_pairs {
        let picked = sample(&mut rng, pool.len(), 2);
        match pool[picked.index(0)].pair_feature(&pool[picked.index(1)]) {
            Ok(feature) => pairs.push(LabeledPair::new(feature, false)),
            Err(e) => {
                skipped += 1;
                tracing::warn!(error = %e, "negative pair skipped");
            }
        }
    }
    let negatives = pairs.len();

    let mut candidates = Vec::new();
    for i in 0..pool.len() {
        for j in (i + 1)..pool.len().min(i + 1 + options.window) {
            match pool[i].pair_feature(&pool[j]) {
                Ok(feature) if feature.similarity() > options.positive_threshold => candidates.push(feature),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
    }
    let found = candidates.len();
    candidates.shuffle(&mut rng);
    candidates.truncate(options.positive_pairs);
    let positives = candidates.len();
    pairs.extend(candidates.into_iter().map(|f| LabeledPair::new(f, true)));

    if positives == 0 {
        tracing::warn!(
            threshold = options.positive_threshold,
            window = options.window,
            "no pair exceeded the similarity threshold; corpus has no positives"
        );
    }
    tracing::info!(negatives, positives, candidates = found, skipped, "synthetic pairs generated");

    // Interleave classes so downstream splits see no ordering artifact.
    pairs.shuffle(&mut rng);

    Ok(SyntheticPairs {
        pairs,
        positives,
        negatives,
        candidates: found,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgeEstimate, Embedding};

    fn face(values: Vec<f32>, age: f32) -> Face {
        Face::new(Embedding::new(values).unwrap(), AgeEstimate::new(age, 2.0).unwrap())
    }

    /// Orthogonal identities, with every third face a near-duplicate of the
    /// previous one.
    fn pool(n: usize) -> Vec<Face> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0f32; n];
                if i % 3 == 2 {
                    v[i - 1] = 1.0;
                    v[i] = 0.2;
                } else {
                    v[i] = 1.0;
                }
                face(v, 20.0 + i as f32)
            })
            .collect()
    }

    #[test]
    fn test_generate_counts_and_labels() {
        let options = SyntheticOptions {
            negative_pairs: 50,
            positive_pairs: 5,
            window: 3,
            ..SyntheticOptions::default()
        };
        let out = generate(&pool(30), &options).unwrap();
        assert_eq!(out.negatives, 50);
        // 10 near-duplicate pairs exist; 5 are kept.
        assert_eq!(out.candidates, 10);
        assert_eq!(out.positives, 5);
        assert_eq!(out.pairs.len(), 55);
        assert!(out
            .pairs
            .iter()
            .filter(|p| p.same)
            .all(|p| p.feature.similarity() > options.positive_threshold));
        assert_eq!(out.provenance(), PairProvenance::SimilarityHeuristic);
    }

    #[test]
    fn test_window_bounds_positive_search() {
        let options = SyntheticOptions {
            negative_pairs: 0,
            window: 0,
            ..SyntheticOptions::default()
        };
        let out = generate(&pool(12), &options).unwrap();
        assert_eq!(out.candidates, 0);
        assert!(out.pairs.is_empty());
    }

    #[test]
    fn test_generate_is_seeded() {
        let options = SyntheticOptions {
            negative_pairs: 20,
            ..SyntheticOptions::default()
        };
        let p = pool(15);
        let a = generate(&p, &options).unwrap();
        let b = generate(&p, &options).unwrap();
        assert_eq!(a.pairs, b.pairs);
    }

    #[test]
    fn test_pool_too_small() {
        let err = generate(&pool(1), &SyntheticOptions::default()).unwrap_err();
        assert_eq!(err, SyntheticError::PoolTooSmall(1));
    }

    #[test]
    fn test_caveat_is_surfaced() {
        assert!(PairProvenance::SimilarityHeuristic.caveat().is_some());
        assert!(PairProvenance::Verified.caveat().is_none());
    }
}
