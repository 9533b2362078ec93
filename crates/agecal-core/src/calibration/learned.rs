//! Learned probability model: `[similarity, age_diff, uncertainty]` →
//! P(same person).
//!
//! dense(3→32) + ReLU + dropout(0.2) → dense(32→16) + ReLU + dropout(0.1) →
//! dense(16→1) + sigmoid, trained with binary cross-entropy. Inputs are
//! standardized with statistics stored in the model.
//!
//! Trained only on similarity-heuristic pairs this model tends to collapse
//! into a similarity threshold; [`crate::audit`] detects that.

use super::{class_counts, CalibrationError, Calibrator, OutputKind};
use crate::nn::{apply_mask, dropout_mask, relu, relu_backward, softplus_scalar, sigmoid_scalar, Dense, DenseGrad};
use crate::train::{train_network, Network, TrainOptions};
use crate::types::{FacePairFeature, LabeledPair};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

const INPUTS: usize = 3;
const HIDDEN: [usize; 2] = [32, 16];
const DROPOUT: [f32; 2] = [0.2, 0.1];
const MIN_STD: f32 = 1e-6;
/// Logits are clamped so the probability stays strictly inside (0, 1).
const MAX_LOGIT: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct LearnedOptions {
    pub train: TrainOptions,
}

impl Default for LearnedOptions {
    fn default() -> Self {
        Self {
            train: TrainOptions {
                max_epochs: 100,
                batch_size: 32,
                learning_rate: 1e-3,
                weight_decay: 1e-4,
                lr_factor: 0.5,
                lr_patience: 5,
                stop_patience: 15,
                seed: 42,
                checkpoint: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedModel {
    feature_mean: [f32; INPUTS],
    feature_std: [f32; INPUTS],
    hidden_1: Dense,
    hidden_2: Dense,
    output: Dense,
}

struct Cache {
    x: Array2<f32>,
    pre_1: Array2<f32>,
    h_1: Array2<f32>,
    mask_1: Option<Array2<f32>>,
    pre_2: Array2<f32>,
    h_2: Array2<f32>,
    mask_2: Option<Array2<f32>>,
    logits: Array2<f32>,
}

impl LearnedModel {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            feature_mean: [0.0; INPUTS],
            feature_std: [1.0; INPUTS],
            hidden_1: Dense::new(INPUTS, HIDDEN[0], &mut rng),
            hidden_2: Dense::new(HIDDEN[0], HIDDEN[1], &mut rng),
            output: Dense::new(HIDDEN[1], 1, &mut rng),
        }
    }

    fn with_standardization(mut self, pairs: &[LabeledPair]) -> Self {
        let n = pairs.len().max(1) as f32;
        let mut mean = [0.0f32; INPUTS];
        for p in pairs {
            for (m, v) in mean.iter_mut().zip(p.feature.to_learned_input()) {
                *m += v / n;
            }
        }
        let mut var = [0.0f32; INPUTS];
        for p in pairs {
            for ((s, v), m) in var.iter_mut().zip(p.feature.to_learned_input()).zip(mean) {
                *s += (v - m) * (v - m) / n;
            }
        }
        self.feature_mean = mean;
        self.feature_std = var.map(|v| if v.sqrt() < MIN_STD { 1.0 } else { v.sqrt() });
        self
    }

    /// Layer shapes match 3→32→16→1 and every parameter is finite, with
    /// positive scales.
    pub fn validate(&self) -> Result<(), String> {
        if !self.feature_mean.iter().all(|m| m.is_finite()) {
            return Err("non-finite feature mean".to_string());
        }
        if !self.feature_std.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(format!("feature scales {:?} must be finite and positive", self.feature_std));
        }
        let shapes = [(INPUTS, HIDDEN[0]), (HIDDEN[0], HIDDEN[1]), (HIDDEN[1], 1)];
        for ((name, layer), (inputs, outputs)) in ["hidden_1", "hidden_2", "output"]
            .into_iter()
            .zip(self.layers())
            .zip(shapes)
        {
            layer
                .check_shape(inputs, outputs)
                .map_err(|reason| format!("{name}: {reason}"))?;
        }
        Ok(())
    }

    fn input_matrix<'a>(&self, features: impl ExactSizeIterator<Item = &'a FacePairFeature>) -> Array2<f32> {
        let mut x = Array2::<f32>::zeros((features.len(), INPUTS));
        for (i, f) in features.enumerate() {
            for (j, v) in f.to_learned_input().into_iter().enumerate() {
                x[[i, j]] = (v - self.feature_mean[j]) / self.feature_std[j];
            }
        }
        x
    }

    fn logits(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let h_1 = relu(&self.hidden_1.forward(x));
        let h_2 = relu(&self.hidden_2.forward(h_1.view()));
        self.output.forward(h_2.view())
    }

    fn forward_train(&self, x: Array2<f32>, rng: &mut StdRng) -> Cache {
        let pre_1 = self.hidden_1.forward(x.view());
        let mask_1 = dropout_mask(pre_1.dim(), DROPOUT[0], rng);
        let h_1 = apply_mask(relu(&pre_1), mask_1.as_ref());
        let pre_2 = self.hidden_2.forward(h_1.view());
        let mask_2 = dropout_mask(pre_2.dim(), DROPOUT[1], rng);
        let h_2 = apply_mask(relu(&pre_2), mask_2.as_ref());
        let logits = self.output.forward(h_2.view());
        Cache {
            x,
            pre_1,
            h_1,
            mask_1,
            pre_2,
            h_2,
            mask_2,
            logits,
        }
    }

    /// Same-person probability in (0, 1).
    pub fn probability(&self, feature: &FacePairFeature) -> f64 {
        let x = self.input_matrix(std::iter::once(feature));
        let logit = f64::from(self.logits(x.view())[[0, 0]]);
        1.0 / (1.0 + (-logit.clamp(-MAX_LOGIT, MAX_LOGIT)).exp())
    }

    pub fn probabilities(&self, features: &[FacePairFeature]) -> Vec<f64> {
        if features.is_empty() {
            return Vec::new();
        }
        let x = self.input_matrix(features.iter());
        self.logits(x.view())
            .column(0)
            .iter()
            .map(|&z| 1.0 / (1.0 + (-f64::from(z).clamp(-MAX_LOGIT, MAX_LOGIT)).exp()))
            .collect()
    }
}

/// Binary cross-entropy from a logit: `softplus(z) − y·z`.
fn bce_with_logit(z: f32, y: f32) -> f32 {
    softplus_scalar(z) - y * z
}

impl Network for LearnedModel {
    type Sample = LabeledPair;

    fn layers(&self) -> Vec<&Dense> {
        vec![&self.hidden_1, &self.hidden_2, &self.output]
    }

    fn layers_mut(&mut self) -> Vec<&mut Dense> {
        vec![&mut self.hidden_1, &mut self.hidden_2, &mut self.output]
    }

    fn backprop(&self, batch: &[&LabeledPair], rng: &mut StdRng) -> (f32, Vec<DenseGrad>) {
        let n = batch.len().max(1) as f32;
        let x = self.input_matrix(batch.iter().map(|p| &p.feature));
        let c = self.forward_train(x, rng);

        let mut loss = 0.0f32;
        let mut d_logits = Array2::<f32>::zeros((batch.len(), 1));
        for (i, pair) in batch.iter().enumerate() {
            let z = c.logits[[i, 0]];
            let y = pair.target();
            loss += bce_with_logit(z, y);
            d_logits[[i, 0]] = (sigmoid_scalar(z) - y) / n;
        }

        let (g_out, d_h2) = self.output.backward(c.h_2.view(), &d_logits);
        let d_pre_2 = relu_backward(&c.pre_2, &apply_mask(d_h2, c.mask_2.as_ref()));
        let (g_2, d_h1) = self.hidden_2.backward(c.h_1.view(), &d_pre_2);
        let d_pre_1 = relu_backward(&c.pre_1, &apply_mask(d_h1, c.mask_1.as_ref()));
        let (g_1, _) = self.hidden_1.backward(c.x.view(), &d_pre_1);

        (loss / n, vec![g_1, g_2, g_out])
    }

    fn loss(&self, samples: &[LabeledPair]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let x = self.input_matrix(samples.iter().map(|p| &p.feature));
        let logits = self.logits(x.view());
        let total: f32 = samples
            .iter()
            .enumerate()
            .map(|(i, p)| bce_with_logit(logits[[i, 0]], p.target()))
            .sum();
        total / samples.len() as f32
    }
}

impl Calibrator for LearnedModel {
    fn score(&self, feature: &FacePairFeature) -> f64 {
        self.probability(feature)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Probability
    }

    fn score_all(&self, features: &[FacePairFeature]) -> Vec<f64> {
        self.probabilities(features)
    }
}

/// Train on `train`, early-stopping on `validation`, and keep the best
/// validation snapshot.
pub fn fit(train: &[LabeledPair], validation: &[LabeledPair], options: &LearnedOptions) -> Result<LearnedModel, CalibrationError> {
    let (same, different) = class_counts(train);
    if same == 0 || different == 0 {
        return Err(CalibrationError::SingleClass { same, different });
    }

    let model = LearnedModel::new(options.train.seed).with_standardization(train);
    let trained = train_network(model, train, validation, &options.train)?;
    tracing::info!(
        epochs = trained.epochs_run,
        best_epoch = trained.best_epoch,
        validation_loss = trained.best_validation_loss,
        stopped_early = trained.stopped_early,
        "learned calibrator trained"
    );
    Ok(trained.network)
}
