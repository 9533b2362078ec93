//! Sign-constrained logistic model.
//!
//! `logit = bias + w_sim·sim + w_age·ageDiff + w_age2·ageDiff² + w_unc·unc`
//! with `w_sim ≥ 0` and `w_age, w_age2, w_unc ≤ 0`, so the probability never
//! decreases with similarity and never increases with age gap or
//! uncertainty, for any input.
//!
//! Fitted by spectral projected gradient on standardized features. Scaling
//! a column by a positive factor preserves the sign of its weight, so the
//! box constraints carry over unchanged; the L2 term is evaluated on the
//! original-scale weights.

use super::{class_counts, CalibrationError, Calibrator, OutputKind};
use crate::optim::{projected_gradient, Bound, GradientOptions, OptimizationError};
use crate::types::{FacePairFeature, LabeledPair};
use serde::{Deserialize, Serialize};

const WEIGHTS: usize = 4;
const INITIAL_WEIGHTS: [f64; WEIGHTS] = [1.0, -0.01, -0.0001, -0.01];
const MAX_ITERATIONS: usize = 1000;
const MIN_SCALE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    bias: f64,
    w_sim: f64,
    w_age: f64,
    w_age2: f64,
    w_unc: f64,
    /// `false` when the solver ran out of iterations.
    #[serde(default = "default_converged")]
    converged: bool,
}

fn default_converged() -> bool {
    true
}

impl LinearModel {
    /// A model inside the sign box; anything else is rejected.
    pub fn new(bias: f64, w_sim: f64, w_age: f64, w_age2: f64, w_unc: f64) -> Result<Self, CalibrationError> {
        let model = Self {
            bias,
            w_sim,
            w_age,
            w_age2,
            w_unc,
            converged: true,
        };
        model.validate().map_err(CalibrationError::InvalidModel)?;
        Ok(model)
    }

    pub fn logit(&self, feature: &FacePairFeature) -> f64 {
        let [sim, age, age2, unc] = feature.to_linear_input();
        self.bias + self.w_sim * sim + self.w_age * age + self.w_age2 * age2 + self.w_unc * unc
    }

    pub fn probability(&self, feature: &FacePairFeature) -> f64 {
        sigmoid(self.logit(feature))
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// `[w_sim, w_age, w_age2, w_unc]`.
    pub fn weights(&self) -> [f64; WEIGHTS] {
        [self.w_sim, self.w_age, self.w_age2, self.w_unc]
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Whether every sign constraint holds.
    pub fn is_monotone(&self) -> bool {
        self.w_sim >= 0.0 && self.w_age <= 0.0 && self.w_age2 <= 0.0 && self.w_unc <= 0.0
    }

    /// Finite parameters inside the sign box.
    pub fn validate(&self) -> Result<(), String> {
        if !self.bias.is_finite() || !self.weights().iter().all(|w| w.is_finite()) {
            return Err("non-finite parameter".to_string());
        }
        if !self.is_monotone() {
            return Err(format!(
                "weights {:?} violate the sign box (w_sim >= 0; w_age, w_age2, w_unc <= 0)",
                self.weights()
            ));
        }
        Ok(())
    }
}

impl Calibrator for LinearModel {
    fn score(&self, feature: &FacePairFeature) -> f64 {
        self.probability(feature)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Probability
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// Per-column centering and scaling of the four linear inputs.
struct Standardizer {
    mean: [f64; WEIGHTS],
    scale: [f64; WEIGHTS],
}

impl Standardizer {
    fn fit(rows: &[[f64; WEIGHTS]]) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = [0.0; WEIGHTS];
        for row in rows {
            for j in 0..WEIGHTS {
                mean[j] += row[j] / n;
            }
        }
        let mut var = [0.0; WEIGHTS];
        for row in rows {
            for j in 0..WEIGHTS {
                var[j] += (row[j] - mean[j]).powi(2) / n;
            }
        }
        let scale = var.map(|v| if v.sqrt() > MIN_SCALE { v.sqrt() } else { 1.0 });
        Self { mean, scale }
    }

    fn apply(&self, row: &[f64; WEIGHTS]) -> [f64; WEIGHTS] {
        let mut z = [0.0; WEIGHTS];
        for j in 0..WEIGHTS {
            z[j] = (row[j] - self.mean[j]) / self.scale[j];
        }
        z
    }

    /// Original-scale `(bias, w)` → standardized `[b', v…]`.
    fn to_standard(&self, bias: f64, w: &[f64; WEIGHTS]) -> Vec<f64> {
        let mut params = vec![bias + (0..WEIGHTS).map(|j| w[j] * self.mean[j]).sum::<f64>()];
        params.extend((0..WEIGHTS).map(|j| w[j] * self.scale[j]));
        params
    }

    /// Standardized `[b', v…]` → original-scale `(bias, w)`.
    fn to_original(&self, params: &[f64]) -> (f64, [f64; WEIGHTS]) {
        let mut w = [0.0; WEIGHTS];
        let mut bias = params[0];
        for j in 0..WEIGHTS {
            w[j] = params[j + 1] / self.scale[j];
            bias -= w[j] * self.mean[j];
        }
        (bias, w)
    }
}

/// Bias free, similarity non-negative, the rest non-positive.
fn sign_box() -> [Bound; WEIGHTS + 1] {
    [
        Bound::FREE,
        Bound::NON_NEGATIVE,
        Bound::NON_POSITIVE,
        Bound::NON_POSITIVE,
        Bound::NON_POSITIVE,
    ]
}

/// Fit by minimizing `mean BCE + λ·Σw²` over the sign box. A solver that
/// runs out of iterations still yields a feasible model, flagged
/// `converged = false`, together with the diagnostic.
pub fn fit(train: &[LabeledPair], regularization: f64) -> Result<(LinearModel, Option<OptimizationError>), CalibrationError> {
    if train.is_empty() {
        return Err(CalibrationError::EmptyTrainingSet);
    }
    let (same, different) = class_counts(train);
    if same == 0 || different == 0 {
        return Err(CalibrationError::SingleClass { same, different });
    }

    let rows: Vec<[f64; WEIGHTS]> = train.iter().map(|p| p.feature.to_linear_input()).collect();
    let standardizer = Standardizer::fit(&rows);
    let z: Vec<[f64; WEIGHTS]> = rows.iter().map(|r| standardizer.apply(r)).collect();
    let y: Vec<f64> = train.iter().map(|p| f64::from(p.target())).collect();
    let n = train.len() as f64;
    let lambda = regularization.max(0.0);
    // d/dv of λ·(v/s)² is 2λ·v/s².
    let l2: [f64; WEIGHTS] = standardizer.scale.map(|s| lambda / (s * s));

    let objective = |params: &[f64]| -> (f64, Vec<f64>) {
        let mut value = 0.0;
        let mut grad = vec![0.0; WEIGHTS + 1];
        for (zi, &yi) in z.iter().zip(&y) {
            let logit = params[0] + (0..WEIGHTS).map(|j| params[j + 1] * zi[j]).sum::<f64>();
            value += softplus(logit) - yi * logit;
            let residual = sigmoid(logit) - yi;
            grad[0] += residual;
            for j in 0..WEIGHTS {
                grad[j + 1] += residual * zi[j];
            }
        }
        value /= n;
        for g in grad.iter_mut() {
            *g /= n;
        }
        for j in 0..WEIGHTS {
            let v = params[j + 1];
            value += l2[j] * v * v;
            grad[j + 1] += 2.0 * l2[j] * v;
        }
        (value, grad)
    };

    let start = standardizer.to_standard(0.0, &INITIAL_WEIGHTS);
    let options = GradientOptions {
        max_iterations: MAX_ITERATIONS,
        ..GradientOptions::default()
    };
    let solution = projected_gradient(objective, &start, &sign_box(), &options);
    let (bias, w) = standardizer.to_original(&solution.params);

    let model = LinearModel {
        bias,
        // Guard the sign box against rounding in the back-transform.
        w_sim: w[0].max(0.0),
        w_age: w[1].min(0.0),
        w_age2: w[2].min(0.0),
        w_unc: w[3].min(0.0),
        converged: solution.converged,
    };
    tracing::info!(
        bias = model.bias,
        w_sim = model.w_sim,
        w_age = model.w_age,
        w_age2 = model.w_age2,
        w_unc = model.w_unc,
        iterations = solution.iterations,
        converged = solution.converged,
        objective = solution.value,
        "constrained linear model fitted"
    );
    Ok((model, solution.error()))
}
