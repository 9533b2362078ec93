//! Verification metrics over same-person / different-person score sets:
//! ROC curve, AUC, EER and TAR@FAR.
//!
//! A score is accepted at threshold `t` when `score >= t`. Every metric is
//! computed the same way regardless of which calibrator produced the scores.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default operating point for TAR@FAR.
pub const DEFAULT_TARGET_FAR: f64 = 1e-3;

/// A metric is undefined for the given score sets.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationError {
    #[error("no same-person pairs; TPR is undefined")]
    NoPositives,
    #[error("no different-person pairs; FPR is undefined")]
    NoNegatives,
    #[error("non-finite score")]
    NonFiniteScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub fpr: f64,
    pub tpr: f64,
}

impl RocPoint {
    pub fn fnr(&self) -> f64 {
        1.0 - self.tpr
    }
}

/// Which thresholds to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdGrid {
    /// One threshold per distinct observed score (exact curve).
    #[default]
    UniqueScores,
    /// `n` thresholds evenly spaced across the observed score range.
    Uniform(usize),
}

/// Score sets sorted ascending, for counting acceptances by bisection.
struct SortedScores {
    same: Vec<f64>,
    diff: Vec<f64>,
}

impl SortedScores {
    fn new(same: &[f64], diff: &[f64]) -> Result<Self, ValidationError> {
        if same.is_empty() {
            return Err(ValidationError::NoPositives);
        }
        if diff.is_empty() {
            return Err(ValidationError::NoNegatives);
        }
        if same.iter().chain(diff).any(|s| !s.is_finite()) {
            return Err(ValidationError::NonFiniteScore);
        }
        let mut same = same.to_vec();
        let mut diff = diff.to_vec();
        same.sort_by(f64::total_cmp);
        diff.sort_by(f64::total_cmp);
        Ok(Self { same, diff })
    }

    fn accepted(sorted: &[f64], threshold: f64) -> usize {
        sorted.len() - sorted.partition_point(|&s| s < threshold)
    }

    fn point(&self, threshold: f64) -> RocPoint {
        RocPoint {
            threshold,
            tpr: Self::accepted(&self.same, threshold) as f64 / self.same.len() as f64,
            fpr: Self::accepted(&self.diff, threshold) as f64 / self.diff.len() as f64,
        }
    }

    fn range(&self) -> (f64, f64) {
        let lo = self.same[0].min(self.diff[0]);
        let hi = self.same[self.same.len() - 1].max(self.diff[self.diff.len() - 1]);
        (lo, hi)
    }

    /// Thresholds from highest to lowest.
    fn thresholds(&self, grid: ThresholdGrid) -> Vec<f64> {
        match grid {
            ThresholdGrid::UniqueScores => {
                let mut all: Vec<f64> = self.same.iter().chain(&self.diff).copied().collect();
                all.sort_by(|a, b| b.total_cmp(a));
                all.dedup();
                all
            }
            ThresholdGrid::Uniform(n) => {
                let (lo, hi) = self.range();
                let n = n.max(2);
                if hi <= lo {
                    return vec![hi];
                }
                let step = (hi - lo) / (n - 1) as f64;
                (0..n).map(|i| if i == n - 1 { lo } else { hi - step * i as f64 }).collect()
            }
        }
    }
}

/// ROC curve ordered by descending threshold, hence non-decreasing FPR and
/// TPR. The first point is the `+∞` threshold (nothing accepted); the last
/// accepts every score.
pub fn roc(same: &[f64], diff: &[f64], grid: ThresholdGrid) -> Result<Vec<RocPoint>, ValidationError> {
    let scores = SortedScores::new(same, diff)?;
    let mut points = Vec::new();
    points.push(RocPoint {
        threshold: f64::INFINITY,
        fpr: 0.0,
        tpr: 0.0,
    });
    points.extend(scores.thresholds(grid).into_iter().map(|t| scores.point(t)));
    Ok(points)
}

/// Trapezoidal area under TPR over FPR. `points` must be ordered by FPR
/// ascending, as returned by [`roc`].
pub fn auc(points: &[RocPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].fpr - w[0].fpr) * (w[0].tpr + w[1].tpr) / 2.0)
        .sum()
}

/// Equal error rate and its threshold: the point minimizing `|FPR − FNR|`,
/// reported as `(FPR + FNR) / 2`. Ties keep the highest threshold.
pub fn eer(points: &[RocPoint]) -> Option<(f64, f64)> {
    let mut best: Option<&RocPoint> = None;
    for p in points {
        let gap = (p.fpr - p.fnr()).abs();
        if best.map_or(true, |b| gap < (b.fpr - b.fnr()).abs()) {
            best = Some(p);
        }
    }
    best.map(|p| ((p.fpr + p.fnr()) / 2.0, p.threshold))
}

/// TPR at the first threshold, scanning from highest to lowest, whose FPR
/// reaches `target_far`. Zero when the target is never reached.
pub fn tar_at_far(points: &[RocPoint], target_far: f64) -> f64 {
    points.iter().find(|p| p.fpr >= target_far).map_or(0.0, |p| p.tpr)
}

/// EER straight from score sets, without materializing the curve. Used as
/// an optimization objective.
pub fn eer_from_scores(same: &[f64], diff: &[f64]) -> Result<f64, ValidationError> {
    let curve = roc(same, diff, ThresholdGrid::UniqueScores)?;
    eer(&curve).map(|(rate, _)| rate).ok_or(ValidationError::NoPositives)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub same_pairs: usize,
    pub different_pairs: usize,
    pub roc: Vec<RocPoint>,
    pub auc: Option<f64>,
    pub eer: Option<f64>,
    pub eer_threshold: Option<f64>,
    pub target_far: f64,
    pub tar_at_far: Option<f64>,
    /// Why the metrics above are `None`, if they are.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undefined: Option<ValidationError>,
}

impl EvaluationMetrics {
    pub fn is_defined(&self) -> bool {
        self.undefined.is_none()
    }
}

/// Compute every metric. Insufficient or invalid score sets yield `None`
/// metrics and the reason, never an error.
pub fn evaluate(same: &[f64], diff: &[f64], target_far: f64) -> EvaluationMetrics {
    match roc(same, diff, ThresholdGrid::UniqueScores) {
        Ok(curve) => {
            let eer = eer(&curve);
            EvaluationMetrics {
                same_pairs: same.len(),
                different_pairs: diff.len(),
                auc: Some(auc(&curve)),
                eer: eer.map(|(rate, _)| rate),
                eer_threshold: eer.map(|(_, t)| t),
                target_far,
                tar_at_far: Some(tar_at_far(&curve, target_far)),
                roc: curve,
                undefined: None,
            }
        }
        Err(reason) => {
            tracing::warn!(
                same = same.len(),
                different = diff.len(),
                %reason,
                "metrics undefined"
            );
            EvaluationMetrics {
                same_pairs: same.len(),
                different_pairs: diff.len(),
                roc: Vec::new(),
                auc: None,
                eer: None,
                eer_threshold: None,
                target_far,
                tar_at_far: None,
                undefined: Some(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_perfect_separator() {
        let same = [0.9, 0.8, 0.95];
        let diff = [0.1, 0.3, 0.2, 0.05];
        let m = evaluate(&same, &diff, DEFAULT_TARGET_FAR);
        assert!((m.auc.unwrap() - 1.0).abs() < 1e-12);
        assert!(m.eer.unwrap().abs() < 1e-12);
        assert_eq!(m.tar_at_far, Some(1.0));
        // Threshold separates the classes.
        let t = m.eer_threshold.unwrap();
        assert!(t > 0.3 && t <= 0.8);
    }

    #[test]
    fn test_scenario_constant_scores() {
        let same = vec![0.9; 50];
        let diff = vec![0.2; 50];
        let m = evaluate(&same, &diff, DEFAULT_TARGET_FAR);
        assert!(m.eer.unwrap() < 1e-9);
        assert!((m.auc.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverted_separator() {
        let m = evaluate(&[0.1, 0.2], &[0.8, 0.9], DEFAULT_TARGET_FAR);
        assert!(m.auc.unwrap().abs() < 1e-12);
        assert!((m.eer.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_random_scores_auc_near_half() {
        let mut rng = StdRng::seed_from_u64(11);
        let same: Vec<f64> = (0..3000).map(|_| rng.gen()).collect();
        let diff: Vec<f64> = (0..3000).map(|_| rng.gen()).collect();
        let m = evaluate(&same, &diff, DEFAULT_TARGET_FAR);
        assert!((m.auc.unwrap() - 0.5).abs() < 0.03, "auc {:?}", m.auc);
        assert!((m.eer.unwrap() - 0.5).abs() < 0.05, "eer {:?}", m.eer);
    }

    #[test]
    fn test_eer_is_minimal_over_grid() {
        let mut rng = StdRng::seed_from_u64(3);
        let same: Vec<f64> = (0..400).map(|_| rng.gen_range(0.3..1.0)).collect();
        let diff: Vec<f64> = (0..600).map(|_| rng.gen_range(0.0..0.7)).collect();
        let curve = roc(&same, &diff, ThresholdGrid::UniqueScores).unwrap();
        let (rate, threshold) = eer(&curve).unwrap();
        assert!((0.0..=1.0).contains(&rate));

        let at = curve.iter().find(|p| p.threshold == threshold).unwrap();
        let gap = (at.fpr - at.fnr()).abs();
        assert!(curve.iter().all(|p| (p.fpr - p.fnr()).abs() >= gap));
    }

    #[test]
    fn test_roc_monotone_and_anchored() {
        let curve = roc(&[0.4, 0.6, 0.6], &[0.1, 0.5], ThresholdGrid::UniqueScores).unwrap();
        assert_eq!(curve[0].threshold, f64::INFINITY);
        assert_eq!((curve[0].fpr, curve[0].tpr), (0.0, 0.0));
        let last = curve.last().unwrap();
        assert_eq!((last.fpr, last.tpr), (1.0, 1.0));
        assert!(curve.windows(2).all(|w| w[1].fpr >= w[0].fpr && w[1].tpr >= w[0].tpr));
        // Duplicate 0.6 collapses to one threshold.
        assert_eq!(curve.len(), 5);
    }

    #[test]
    fn test_uniform_grid() {
        let curve = roc(&[0.5, 1.0], &[0.0, 0.25], ThresholdGrid::Uniform(5)).unwrap();
        let thresholds: Vec<f64> = curve[1..].iter().map(|p| p.threshold).collect();
        assert_eq!(thresholds, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
        assert!((auc(&curve) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tar_at_far_scan() {
        // Diff scores 0..=9 / 10, same scores spread above and below.
        let diff: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        let same = [0.95, 0.85, 0.55, 0.05];
        let curve = roc(&same, &diff, ThresholdGrid::UniqueScores).unwrap();
        // First threshold with FPR >= 0.1 is 0.9 (one negative accepted):
        // same scores >= 0.9 are 0.95 only.
        assert!((tar_at_far(&curve, 0.1) - 0.25).abs() < 1e-12);
        assert_eq!(tar_at_far(&curve, 2.0), 0.0);
    }

    #[test]
    fn test_undefined_metrics() {
        let m = evaluate(&[0.5, 0.7], &[], DEFAULT_TARGET_FAR);
        assert_eq!(m.undefined, Some(ValidationError::NoNegatives));
        assert!(m.auc.is_none() && m.eer.is_none() && m.tar_at_far.is_none());
        assert!(!m.is_defined());

        let m = evaluate(&[], &[0.1], DEFAULT_TARGET_FAR);
        assert_eq!(m.undefined, Some(ValidationError::NoPositives));

        let m = evaluate(&[f64::NAN], &[0.1], DEFAULT_TARGET_FAR);
        assert_eq!(m.undefined, Some(ValidationError::NonFiniteScore));
    }
}
