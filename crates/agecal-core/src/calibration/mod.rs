//! Calibration strategies: fuse similarity, age gap and uncertainty into a
//! decision score.
//!
//! Three interchangeable variants share the [`Calibrator`] capability and
//! persist through one tagged document ([`CalibrationModel`]):
//!
//! - [`LearnedModel`]: small MLP, outputs a probability.
//! - [`LinearModel`]: sign-constrained logistic model, outputs a probability.
//! - [`PenaltyModel`]: `s − α·clamp(ageDiff − τ, 0, M)`, outputs a raw score.

pub mod learned;
pub mod linear;
pub mod penalty;

pub use learned::{LearnedModel, LearnedOptions};
pub use linear::LinearModel;
pub use penalty::PenaltyModel;

use crate::artifact::{read_json, write_json_atomic, ModelLoadError};
use crate::eval::{evaluate, EvaluationMetrics, DEFAULT_TARGET_FAR};
use crate::optim::OptimizationError;
use crate::train::{split_train_validation, TrainError};
use crate::types::{FacePairFeature, LabeledPair};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default L2 strength for the constrained linear model.
pub const DEFAULT_REGULARIZATION: f64 = 0.01;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("training set needs both classes (same: {same}, different: {different})")]
    SingleClass { same: usize, different: usize },
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid model parameters: {0}")]
    InvalidModel(String),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("model load failed: {0}")]
    Load(#[from] ModelLoadError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What a calibrator's output means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Same-person probability in `[0, 1]`; decide at 0.5.
    Probability,
    /// Calibrated similarity; decide at a fixed threshold on the score.
    RawScore,
}

/// Scoring capability shared by every fitted calibrator.
///
/// Scoring only reads fitted parameters, so a model can be shared across
/// threads and queried concurrently.
pub trait Calibrator {
    fn score(&self, feature: &FacePairFeature) -> f64;

    fn output_kind(&self) -> OutputKind;

    /// Score at which a pair is accepted as the same person.
    fn decision_threshold(&self) -> f64 {
        0.5
    }

    fn score_all(&self, features: &[FacePairFeature]) -> Vec<f64> {
        features.iter().map(|f| self.score(f)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Learned,
    ConstrainedLinear,
    Penalty,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Learned, Strategy::ConstrainedLinear, Strategy::Penalty];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Learned => "learned",
            Strategy::ConstrainedLinear => "constrained_linear",
            Strategy::Penalty => "penalty",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "learned" | "mlp" => Ok(Strategy::Learned),
            "constrained_linear" | "linear" => Ok(Strategy::ConstrainedLinear),
            "penalty" => Ok(Strategy::Penalty),
            _ => Err(CalibrationError::UnknownStrategy(s.to_string())),
        }
    }
}

/// A fitted calibrator of any variant; the persisted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationModel {
    Learned(LearnedModel),
    ConstrainedLinear(LinearModel),
    Penalty(PenaltyModel),
}

impl CalibrationModel {
    pub fn strategy(&self) -> Strategy {
        match self {
            CalibrationModel::Learned(_) => Strategy::Learned,
            CalibrationModel::ConstrainedLinear(_) => Strategy::ConstrainedLinear,
            CalibrationModel::Penalty(_) => Strategy::Penalty,
        }
    }

    /// `false` when the solver ran out of budget; treat such a model as
    /// unreliable.
    pub fn converged(&self) -> bool {
        match self {
            CalibrationModel::Learned(_) => true,
            CalibrationModel::ConstrainedLinear(m) => m.converged(),
            CalibrationModel::Penalty(m) => m.converged(),
        }
    }

    /// Parameter constraints of the variant; checked on every load.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CalibrationModel::Learned(m) => m.validate(),
            CalibrationModel::ConstrainedLinear(m) => m.validate(),
            CalibrationModel::Penalty(m) => m.validate(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        write_json_atomic(path, self)?;
        tracing::info!(path = %path.display(), strategy = %self.strategy(), "calibration model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let model: CalibrationModel = read_json(path)?;
        model.validate().map_err(|reason| ModelLoadError::Corrupt {
            path: path.display().to_string(),
            reason,
        })?;
        tracing::info!(path = %path.display(), strategy = %model.strategy(), "calibration model loaded");
        Ok(model)
    }
}

impl Calibrator for CalibrationModel {
    fn score(&self, feature: &FacePairFeature) -> f64 {
        match self {
            CalibrationModel::Learned(m) => m.score(feature),
            CalibrationModel::ConstrainedLinear(m) => m.score(feature),
            CalibrationModel::Penalty(m) => m.score(feature),
        }
    }

    fn output_kind(&self) -> OutputKind {
        match self {
            CalibrationModel::Learned(m) => m.output_kind(),
            CalibrationModel::ConstrainedLinear(m) => m.output_kind(),
            CalibrationModel::Penalty(m) => m.output_kind(),
        }
    }

    fn decision_threshold(&self) -> f64 {
        match self {
            CalibrationModel::Learned(m) => m.decision_threshold(),
            CalibrationModel::ConstrainedLinear(m) => m.decision_threshold(),
            CalibrationModel::Penalty(m) => m.decision_threshold(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    /// L2 strength on the linear model's non-bias weights.
    pub regularization: f64,
    /// Held-out share of each class, used for early stopping and metrics.
    pub validation_fraction: f32,
    pub seed: u64,
    pub target_far: f64,
    pub learned: LearnedOptions,
    /// Checkpoint path for the learned model's best snapshot.
    pub checkpoint: Option<PathBuf>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            regularization: DEFAULT_REGULARIZATION,
            validation_fraction: 0.2,
            seed: 42,
            target_far: DEFAULT_TARGET_FAR,
            learned: LearnedOptions::default(),
            checkpoint: None,
        }
    }
}

/// Result of [`fit`]: the model, its solver diagnostic and metrics on both
/// splits.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub model: CalibrationModel,
    /// Present when the solver hit its budget; the model holds the last
    /// feasible parameters and reports `converged() == false`.
    pub convergence: Option<OptimizationError>,
    pub train_pairs: usize,
    pub validation_pairs: usize,
    pub train_metrics: EvaluationMetrics,
    pub validation_metrics: EvaluationMetrics,
}

/// Seeded split that keeps the class ratio in both halves.
pub fn stratified_split(pairs: &[LabeledPair], validation_fraction: f32, seed: u64) -> (Vec<LabeledPair>, Vec<LabeledPair>) {
    let (same, different): (Vec<LabeledPair>, Vec<LabeledPair>) = pairs.iter().partition(|p| p.same);
    let (mut train, mut validation) = split_train_validation(&same, validation_fraction, seed);
    let (train_diff, validation_diff) = split_train_validation(&different, validation_fraction, seed.wrapping_add(1));
    train.extend(train_diff);
    validation.extend(validation_diff);
    (train, validation)
}

pub(crate) fn class_counts(pairs: &[LabeledPair]) -> (usize, usize) {
    let same = pairs.iter().filter(|p| p.same).count();
    (same, pairs.len() - same)
}

fn require_both_classes(pairs: &[LabeledPair]) -> Result<(), CalibrationError> {
    if pairs.is_empty() {
        return Err(CalibrationError::EmptyTrainingSet);
    }
    let (same, different) = class_counts(pairs);
    if same == 0 || different == 0 {
        return Err(CalibrationError::SingleClass { same, different });
    }
    Ok(())
}

/// Score labeled pairs and compute every metric.
pub fn evaluate_model<C: Calibrator + ?Sized>(model: &C, pairs: &[LabeledPair], target_far: f64) -> EvaluationMetrics {
    let mut same = Vec::new();
    let mut different = Vec::new();
    for pair in pairs {
        let score = model.score(&pair.feature);
        if pair.same {
            same.push(score);
        } else {
            different.push(score);
        }
    }
    evaluate(&same, &different, target_far)
}

/// Fit one strategy on labeled pairs.
pub fn fit(strategy: Strategy, pairs: &[LabeledPair], options: &FitOptions) -> Result<FitOutcome, CalibrationError> {
    require_both_classes(pairs)?;
    let (train, validation) = stratified_split(pairs, options.validation_fraction, options.seed);
    tracing::info!(
        %strategy,
        train = train.len(),
        validation = validation.len(),
        "fitting calibrator"
    );

    let (model, convergence) = match strategy {
        Strategy::Learned => {
            let mut learned = options.learned.clone();
            learned.train.seed = options.seed;
            learned.train.checkpoint = options.checkpoint.clone();
            let model = learned::fit(&train, &validation, &learned)?;
            (CalibrationModel::Learned(model), None)
        }
        Strategy::ConstrainedLinear => {
            let (model, err) = linear::fit(&train, options.regularization)?;
            (CalibrationModel::ConstrainedLinear(model), err)
        }
        Strategy::Penalty => {
            let (model, err) = penalty::fit(&train)?;
            (CalibrationModel::Penalty(model), err)
        }
    };

    if let Some(err) = &convergence {
        tracing::warn!(%strategy, error = %err, "solver did not converge; model flagged unreliable");
    }

    let train_metrics = evaluate_model(&model, &train, options.target_far);
    let validation_metrics = evaluate_model(&model, &validation, options.target_far);
    tracing::info!(
        %strategy,
        converged = model.converged(),
        auc = ?validation_metrics.auc,
        eer = ?validation_metrics.eer,
        "calibrator fitted"
    );

    Ok(FitOutcome {
        model,
        convergence,
        train_pairs: train.len(),
        validation_pairs: validation.len(),
        train_metrics,
        validation_metrics,
    })
}
