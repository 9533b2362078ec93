//! Penalty model: `score = s − α·clamp(ageDiff − τ, 0, M)`.
//!
//! Three scalars, fitted by bounded compass search to minimize the EER of
//! the calibrated scores. Emits a raw score, not a probability; pairs are
//! accepted at the fitted `threshold`.

use super::{class_counts, CalibrationError, Calibrator, OutputKind};
use crate::eval::{eer, roc, ThresholdGrid};
use crate::optim::{compass_search, Bound, CompassOptions, OptimizationError};
use crate::types::{FacePairFeature, LabeledPair};
use serde::{Deserialize, Serialize};

/// Penalty per year beyond `τ`.
pub const ALPHA_BOUNDS: Bound = Bound { lower: 0.0, upper: 0.02 };
/// No-penalty age gap, years.
pub const TAU_BOUNDS: Bound = Bound { lower: 0.0, upper: 20.0 };
/// Cap on the penalized span, years.
pub const MAX_PENALTY_BOUNDS: Bound = Bound { lower: 10.0, upper: 80.0 };
pub const INITIAL_GUESS: [f64; 3] = [0.005, 5.0, 30.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyModel {
    alpha: f64,
    tau: f64,
    #[serde(rename = "M")]
    max_penalty: f64,
    /// Accept pairs whose calibrated score is at least this.
    #[serde(default)]
    threshold: f64,
    #[serde(default = "default_converged")]
    converged: bool,
}

fn default_converged() -> bool {
    true
}

impl PenaltyModel {
    /// A model with every parameter inside its search bounds.
    pub fn new(alpha: f64, tau: f64, max_penalty: f64) -> Result<Self, CalibrationError> {
        let model = Self::bounded(alpha, tau, max_penalty);
        model.validate().map_err(CalibrationError::InvalidModel)?;
        Ok(model)
    }

    /// Caller guarantees the bounds; used on optimizer iterates.
    fn bounded(alpha: f64, tau: f64, max_penalty: f64) -> Self {
        Self {
            alpha,
            tau,
            max_penalty,
            threshold: 0.0,
            converged: true,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Result<Self, CalibrationError> {
        if !threshold.is_finite() {
            return Err(CalibrationError::InvalidModel(format!("threshold {threshold} is not finite")));
        }
        self.threshold = threshold;
        Ok(self)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn max_penalty(&self) -> f64 {
        self.max_penalty
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Every parameter inside its bounds and the threshold finite.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value, bound) in [
            ("alpha", self.alpha, ALPHA_BOUNDS),
            ("tau", self.tau, TAU_BOUNDS),
            ("M", self.max_penalty, MAX_PENALTY_BOUNDS),
        ] {
            if !bound.contains(value) {
                return Err(format!("{name} = {value} outside [{}, {}]", bound.lower, bound.upper));
            }
        }
        if !self.threshold.is_finite() {
            return Err(format!("threshold {} is not finite", self.threshold));
        }
        Ok(())
    }

    pub fn calibrated_score(&self, similarity: f64, age_diff: f64) -> f64 {
        similarity - self.alpha * (age_diff - self.tau).clamp(0.0, self.max_penalty)
    }

    /// Largest possible subtraction, `α·M`.
    pub fn max_total_penalty(&self) -> f64 {
        self.alpha * self.max_penalty
    }
}

impl Calibrator for PenaltyModel {
    fn score(&self, feature: &FacePairFeature) -> f64 {
        self.calibrated_score(f64::from(feature.similarity()), f64::from(feature.age_diff()))
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::RawScore
    }

    fn decision_threshold(&self) -> f64 {
        self.threshold
    }
}

/// EER of the calibrated scores and the threshold it is reached at.
fn calibrated_eer(model: &PenaltyModel, same: &[(f64, f64)], different: &[(f64, f64)]) -> (f64, f64) {
    let score = |&(s, a): &(f64, f64)| model.calibrated_score(s, a);
    let same_scores: Vec<f64> = same.iter().map(score).collect();
    let different_scores: Vec<f64> = different.iter().map(score).collect();
    roc(&same_scores, &different_scores, ThresholdGrid::UniqueScores)
        .ok()
        .and_then(|curve| eer(&curve))
        .unwrap_or((1.0, 0.0))
}

/// Fit `(α, τ, M)` from the fixed initial guess. The search objective is
/// the EER plus a tie-break `α·M / (α_max·M_max) / (4·n)`, which is below a
/// single-pair EER change, so among equal-EER settings the smaller total
/// penalty wins.
pub fn fit(train: &[LabeledPair]) -> Result<(PenaltyModel, Option<OptimizationError>), CalibrationError> {
    if train.is_empty() {
        return Err(CalibrationError::EmptyTrainingSet);
    }
    let (n_same, n_different) = class_counts(train);
    if n_same == 0 || n_different == 0 {
        return Err(CalibrationError::SingleClass {
            same: n_same,
            different: n_different,
        });
    }

    let as_inputs = |same: bool| -> Vec<(f64, f64)> {
        train
            .iter()
            .filter(|p| p.same == same)
            .map(|p| (f64::from(p.feature.similarity()), f64::from(p.feature.age_diff())))
            .collect()
    };
    let same = as_inputs(true);
    let different = as_inputs(false);

    let tie_scale = ALPHA_BOUNDS.upper * MAX_PENALTY_BOUNDS.upper * 4.0 * train.len() as f64;
    let objective = |params: &[f64]| -> f64 {
        let model = PenaltyModel::bounded(params[0], params[1], params[2]);
        let (rate, _) = calibrated_eer(&model, &same, &different);
        rate + model.max_total_penalty() / tie_scale
    };

    let bounds = [ALPHA_BOUNDS, TAU_BOUNDS, MAX_PENALTY_BOUNDS];
    let solution = compass_search(objective, &INITIAL_GUESS, &bounds, &CompassOptions::default());

    let mut model = PenaltyModel::bounded(solution.params[0], solution.params[1], solution.params[2]);
    let (rate, threshold) = calibrated_eer(&model, &same, &different);
    // The +∞ sentinel wins only when every score ties; accept from the top
    // score instead so the artifact stays serializable.
    model.threshold = if threshold.is_finite() {
        threshold
    } else {
        same.iter()
            .chain(&different)
            .map(|&(s, a)| model.calibrated_score(s, a))
            .fold(f64::NEG_INFINITY, f64::max)
    };
    model.converged = solution.converged;
    tracing::info!(
        alpha = model.alpha,
        tau = model.tau,
        max_penalty = model.max_penalty,
        threshold = model.threshold,
        eer = rate,
        evaluations = solution.iterations,
        converged = solution.converged,
        "penalty model fitted"
    );
    Ok((model, solution.error()))
}
