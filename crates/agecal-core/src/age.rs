//! Age estimator: embedding → (age, uncertainty).
//!
//! A shared trunk (512→128→64, ReLU + dropout) feeds two heads: an age head
//! (64→32→1, ReLU output) and an uncertainty head (64→16→1, softplus output).
//! Both outputs are non-negative by construction.
//!
//! Training minimizes `mean(|age_pred − age_true| + λ·uncertainty_pred)` with
//! λ = [`UNCERTAINTY_WEIGHT`], which penalizes inaccurate predictions while
//! discouraging inflated uncertainty.

use crate::artifact::{read_json, write_json_atomic, ModelLoadError};
use crate::nn::{
    apply_mask, dropout_mask, relu, relu_backward, softplus, softplus_backward, Dense, DenseGrad,
};
use crate::train::{split_train_validation, train_network, Network, TrainError, TrainOptions};
use crate::types::{AgeEstimate, Embedding, FeatureError, EMBEDDING_DIM};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// λ in the training objective.
pub const UNCERTAINTY_WEIGHT: f32 = 0.1;
/// Labels above this age are treated as outliers and skipped.
pub const MAX_LABEL_AGE: f32 = 100.0;

const TRUNK_HIDDEN: [usize; 2] = [128, 64];
const AGE_HIDDEN: usize = 32;
const UNCERTAINTY_HIDDEN: usize = 16;
const TRUNK_DROPOUT: [f32; 2] = [0.2, 0.1];
const MODEL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum AgeError {
    #[error("no usable training samples")]
    EmptyTrainingSet,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid estimate: {0}")]
    Feature(#[from] FeatureError),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("model load failed: {0}")]
    Load(#[from] ModelLoadError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can turn an embedding into an [`AgeEstimate`]: the native
/// estimator below or an ONNX graph artifact.
pub trait AgeSource {
    fn estimate(&mut self, embedding: &Embedding) -> Result<AgeEstimate, AgeError>;
}

/// One labeled training example.
#[derive(Debug, Clone)]
pub struct AgeSample {
    pub embedding: Embedding,
    pub age: f32,
}

/// Native age estimator network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeEstimator {
    pub model_version: u32,
    pub embedding_dim: usize,
    trunk_1: Dense,
    trunk_2: Dense,
    age_1: Dense,
    age_out: Dense,
    uncertainty_1: Dense,
    uncertainty_out: Dense,
}

/// Intermediate activations of one training-mode forward pass.
struct ForwardCache {
    pre_1: Array2<f32>,
    mask_1: Option<Array2<f32>>,
    h_1: Array2<f32>,
    pre_2: Array2<f32>,
    mask_2: Option<Array2<f32>>,
    h_2: Array2<f32>,
    pre_age_1: Array2<f32>,
    age_hidden: Array2<f32>,
    pre_age: Array2<f32>,
    age: Array2<f32>,
    pre_unc_1: Array2<f32>,
    unc_hidden: Array2<f32>,
    pre_unc: Array2<f32>,
    uncertainty: Array2<f32>,
}

impl AgeEstimator {
    pub fn new(embedding_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            model_version: MODEL_VERSION,
            embedding_dim,
            trunk_1: Dense::new(embedding_dim, TRUNK_HIDDEN[0], &mut rng),
            trunk_2: Dense::new(TRUNK_HIDDEN[0], TRUNK_HIDDEN[1], &mut rng),
            age_1: Dense::new(TRUNK_HIDDEN[1], AGE_HIDDEN, &mut rng),
            age_out: Dense::new(AGE_HIDDEN, 1, &mut rng),
            uncertainty_1: Dense::new(TRUNK_HIDDEN[1], UNCERTAINTY_HIDDEN, &mut rng),
            uncertainty_out: Dense::new(UNCERTAINTY_HIDDEN, 1, &mut rng),
        }
    }

    /// Estimate age and uncertainty for one embedding.
    pub fn predict(&self, embedding: &Embedding) -> Result<AgeEstimate, AgeError> {
        let estimates = self.predict_batch(std::slice::from_ref(embedding))?;
        estimates
            .into_iter()
            .next()
            .ok_or_else(|| AgeError::InferenceFailed("empty batch output".into()))
    }

    pub fn predict_batch(&self, embeddings: &[Embedding]) -> Result<Vec<AgeEstimate>, AgeError> {
        for e in embeddings {
            if e.dim() != self.embedding_dim {
                return Err(AgeError::DimensionMismatch {
                    expected: self.embedding_dim,
                    got: e.dim(),
                });
            }
        }
        let x = embedding_matrix(embeddings.iter(), self.embedding_dim);
        let (age, uncertainty) = self.forward(x.view());

        age.column(0)
            .iter()
            .zip(uncertainty.column(0).iter())
            .map(|(&a, &u)| AgeEstimate::new(a, u).map_err(AgeError::from))
            .collect()
    }

    /// Mean absolute age error over `samples` in inference mode.
    pub fn mean_absolute_error(&self, samples: &[AgeSample]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let x = embedding_matrix(samples.iter().map(|s| &s.embedding), self.embedding_dim);
        let (age, _) = self.forward(x.view());
        let total: f32 = age
            .column(0)
            .iter()
            .zip(samples)
            .map(|(&pred, s)| (pred - s.age).abs())
            .sum();
        total / samples.len() as f32
    }

    /// Inference-mode forward pass: returns `(age, uncertainty)`, each `(n, 1)`.
    fn forward(&self, x: ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
        let h_1 = relu(&self.trunk_1.forward(x));
        let h_2 = relu(&self.trunk_2.forward(h_1.view()));
        let age_hidden = relu(&self.age_1.forward(h_2.view()));
        let age = relu(&self.age_out.forward(age_hidden.view()));
        let unc_hidden = relu(&self.uncertainty_1.forward(h_2.view()));
        let uncertainty = softplus(&self.uncertainty_out.forward(unc_hidden.view()));
        (age, uncertainty)
    }

    fn forward_train(&self, x: ArrayView2<'_, f32>, rng: &mut StdRng) -> ForwardCache {
        let n = x.nrows();
        let pre_1 = self.trunk_1.forward(x);
        let mask_1 = dropout_mask((n, TRUNK_HIDDEN[0]), TRUNK_DROPOUT[0], rng);
        let h_1 = apply_mask(relu(&pre_1), mask_1.as_ref());

        let pre_2 = self.trunk_2.forward(h_1.view());
        let mask_2 = dropout_mask((n, TRUNK_HIDDEN[1]), TRUNK_DROPOUT[1], rng);
        let h_2 = apply_mask(relu(&pre_2), mask_2.as_ref());

        let pre_age_1 = self.age_1.forward(h_2.view());
        let age_hidden = relu(&pre_age_1);
        let pre_age = self.age_out.forward(age_hidden.view());
        let age = relu(&pre_age);

        let pre_unc_1 = self.uncertainty_1.forward(h_2.view());
        let unc_hidden = relu(&pre_unc_1);
        let pre_unc = self.uncertainty_out.forward(unc_hidden.view());
        let uncertainty = softplus(&pre_unc);

        ForwardCache {
            pre_1,
            mask_1,
            h_1,
            pre_2,
            mask_2,
            h_2,
            pre_age_1,
            age_hidden,
            pre_age,
            age,
            pre_unc_1,
            unc_hidden,
            pre_unc,
            uncertainty,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AgeError> {
        write_json_atomic(path, self)?;
        tracing::info!(path = %path.display(), "saved age estimator");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AgeError> {
        let model: AgeEstimator = read_json(path)?;
        model.validate().map_err(|reason| ModelLoadError::Corrupt {
            path: path.display().to_string(),
            reason,
        })?;
        tracing::info!(path = %path.display(), embedding_dim = model.embedding_dim, "loaded age estimator");
        Ok(model)
    }

    /// Every layer wired for `embedding_dim` inputs and the fixed trunk and
    /// head widths, with finite parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding_dim == 0 {
            return Err("embedding_dim is zero".to_string());
        }
        let shapes = [
            ("trunk_1", &self.trunk_1, self.embedding_dim, TRUNK_HIDDEN[0]),
            ("trunk_2", &self.trunk_2, TRUNK_HIDDEN[0], TRUNK_HIDDEN[1]),
            ("age_1", &self.age_1, TRUNK_HIDDEN[1], AGE_HIDDEN),
            ("age_out", &self.age_out, AGE_HIDDEN, 1),
            ("uncertainty_1", &self.uncertainty_1, TRUNK_HIDDEN[1], UNCERTAINTY_HIDDEN),
            ("uncertainty_out", &self.uncertainty_out, UNCERTAINTY_HIDDEN, 1),
        ];
        for (name, layer, inputs, outputs) in shapes {
            layer
                .check_shape(inputs, outputs)
                .map_err(|reason| format!("{name}: {reason}"))?;
        }
        Ok(())
    }
}

impl AgeSource for AgeEstimator {
    fn estimate(&mut self, embedding: &Embedding) -> Result<AgeEstimate, AgeError> {
        self.predict(embedding)
    }
}

impl Network for AgeEstimator {
    type Sample = AgeSample;

    fn layers(&self) -> Vec<&Dense> {
        vec![
            &self.trunk_1,
            &self.trunk_2,
            &self.age_1,
            &self.age_out,
            &self.uncertainty_1,
            &self.uncertainty_out,
        ]
    }

    fn layers_mut(&mut self) -> Vec<&mut Dense> {
        vec![
            &mut self.trunk_1,
            &mut self.trunk_2,
            &mut self.age_1,
            &mut self.age_out,
            &mut self.uncertainty_1,
            &mut self.uncertainty_out,
        ]
    }

    fn backprop(&self, batch: &[&AgeSample], rng: &mut StdRng) -> (f32, Vec<DenseGrad>) {
        let n = batch.len().max(1) as f32;
        let x = embedding_matrix(batch.iter().map(|s| &s.embedding), self.embedding_dim);
        let c = self.forward_train(x.view(), rng);

        let mut loss = 0.0f32;
        let mut d_age = Array2::<f32>::zeros((batch.len(), 1));
        for (i, sample) in batch.iter().enumerate() {
            let err = c.age[[i, 0]] - sample.age;
            loss += err.abs() + UNCERTAINTY_WEIGHT * c.uncertainty[[i, 0]];
            d_age[[i, 0]] = if err > 0.0 {
                1.0 / n
            } else if err < 0.0 {
                -1.0 / n
            } else {
                0.0
            };
        }
        loss /= n;

        // Age head.
        let d_pre_age = relu_backward(&c.pre_age, &d_age);
        let (g_age_out, d_age_hidden) = self.age_out.backward(c.age_hidden.view(), &d_pre_age);
        let d_pre_age_1 = relu_backward(&c.pre_age_1, &d_age_hidden);
        let (g_age_1, d_h2_age) = self.age_1.backward(c.h_2.view(), &d_pre_age_1);

        // Uncertainty head: d(λ·u)/du = λ / n for every row.
        let d_unc = Array2::<f32>::from_elem((batch.len(), 1), UNCERTAINTY_WEIGHT / n);
        let d_pre_unc = softplus_backward(&c.pre_unc, &d_unc);
        let (g_unc_out, d_unc_hidden) = self.uncertainty_out.backward(c.unc_hidden.view(), &d_pre_unc);
        let d_pre_unc_1 = relu_backward(&c.pre_unc_1, &d_unc_hidden);
        let (g_unc_1, d_h2_unc) = self.uncertainty_1.backward(c.h_2.view(), &d_pre_unc_1);

        // Trunk.
        let d_h2 = apply_mask(d_h2_age + &d_h2_unc, c.mask_2.as_ref());
        let d_pre_2 = relu_backward(&c.pre_2, &d_h2);
        let (g_trunk_2, d_h1) = self.trunk_2.backward(c.h_1.view(), &d_pre_2);
        let d_h1 = apply_mask(d_h1, c.mask_1.as_ref());
        let d_pre_1 = relu_backward(&c.pre_1, &d_h1);
        let (g_trunk_1, _) = self.trunk_1.backward(x.view(), &d_pre_1);

        (loss, vec![g_trunk_1, g_trunk_2, g_age_1, g_age_out, g_unc_1, g_unc_out])
    }

    fn loss(&self, samples: &[AgeSample]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let x = embedding_matrix(samples.iter().map(|s| &s.embedding), self.embedding_dim);
        let (age, uncertainty) = self.forward(x.view());
        let total: f32 = samples
            .iter()
            .enumerate()
            .map(|(i, s)| (age[[i, 0]] - s.age).abs() + UNCERTAINTY_WEIGHT * uncertainty[[i, 0]])
            .sum();
        total / samples.len() as f32
    }
}

/// Options for [`train_age_estimator`]. Defaults follow the reference
/// training recipe: 15% validation, batch 64, Adam 1e-3 with 1e-5 weight
/// decay, LR halved after 5 stagnant epochs, stop after 10.
#[derive(Debug, Clone)]
pub struct AgeTrainOptions {
    pub validation_fraction: f32,
    pub train: TrainOptions,
}

impl Default for AgeTrainOptions {
    fn default() -> Self {
        Self {
            validation_fraction: 0.15,
            train: TrainOptions {
                max_epochs: 100,
                batch_size: 64,
                learning_rate: 1e-3,
                weight_decay: 1e-5,
                lr_factor: 0.5,
                lr_patience: 5,
                stop_patience: 10,
                seed: 42,
                checkpoint: None,
            },
        }
    }
}

impl AgeTrainOptions {
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.train.checkpoint = Some(path.into());
        self
    }
}

/// Result of training: the best-validation estimator and its statistics.
#[derive(Debug, Clone)]
pub struct AgeTraining {
    pub estimator: AgeEstimator,
    pub train_samples: usize,
    pub validation_samples: usize,
    /// Samples rejected for wrong dimension or out-of-range age.
    pub skipped: usize,
    pub validation_loss: f32,
    pub validation_mae: f32,
    pub epochs_run: usize,
}

/// Train a fresh estimator on labeled embeddings.
///
/// The input dimension is the most common one among `samples`. Samples of
/// any other dimension, or with a non-finite, negative or
/// > [`MAX_LABEL_AGE`] label are skipped and counted, not fatal.
pub fn train_age_estimator(samples: &[AgeSample], options: &AgeTrainOptions) -> Result<AgeTraining, AgeError> {
    let dim = dominant_dim(samples);
    let usable: Vec<AgeSample> = samples
        .iter()
        .filter(|s| s.embedding.dim() == dim && s.age.is_finite() && (0.0..=MAX_LABEL_AGE).contains(&s.age))
        .map(|s| AgeSample {
            embedding: s.embedding.normalized(),
            age: s.age,
        })
        .collect();
    let skipped = samples.len() - usable.len();
    if skipped > 0 {
        tracing::warn!(skipped, "skipped unusable age samples");
    }
    if usable.is_empty() {
        return Err(AgeError::EmptyTrainingSet);
    }

    let (train, validation) = split_train_validation(&usable, options.validation_fraction, options.train.seed);

    let mut estimator = AgeEstimator::new(dim, options.train.seed);
    // Start the age output at the mean label so the rectified head is active.
    let mean_age = train.iter().map(|s| s.age).sum::<f32>() / train.len() as f32;
    estimator.age_out.bias.fill(mean_age);

    tracing::info!(
        train = train.len(),
        validation = validation.len(),
        mean_age,
        "training age estimator"
    );

    let trained = train_network(estimator, &train, &validation, &options.train)?;
    let monitored = if validation.is_empty() { &train } else { &validation };
    let validation_mae = trained.network.mean_absolute_error(monitored);

    tracing::info!(
        epochs = trained.epochs_run,
        best_epoch = trained.best_epoch,
        validation_loss = trained.best_validation_loss,
        validation_mae,
        "age estimator trained"
    );

    Ok(AgeTraining {
        estimator: trained.network,
        train_samples: train.len(),
        validation_samples: validation.len(),
        skipped,
        validation_loss: trained.best_validation_loss,
        validation_mae,
        epochs_run: trained.epochs_run,
    })
}

/// Most common embedding dimension; ties go to the larger one.
fn dominant_dim(samples: &[AgeSample]) -> usize {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for s in samples {
        *counts.entry(s.embedding.dim()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(dim, count)| (count, dim))
        .map(|(dim, _)| dim)
        .unwrap_or(EMBEDDING_DIM)
}

/// Stack unit-normalized embeddings into an `(n, dim)` matrix.
fn embedding_matrix<'a, I>(embeddings: I, dim: usize) -> Array2<f32>
where
    I: ExactSizeIterator<Item = &'a Embedding>,
{
    let n = embeddings.len();
    let mut x = Array2::<f32>::zeros((n, dim));
    for (mut row, e) in x.rows_mut().into_iter().zip(embeddings) {
        let norm = e.norm();
        for (dst, &v) in row.iter_mut().zip(&e.values) {
            *dst = if norm > 0.0 { v / norm } else { v };
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const DIM: usize = 16;

    /// Embeddings whose first coordinate encodes age.
    fn synthetic_samples(n: usize, seed: u64) -> Vec<AgeSample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let age: f32 = rng.gen_range(5.0..80.0);
                let mut values: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-0.1..0.1)).collect();
                values[0] = age / 80.0;
                values[1] = 1.0 - age / 80.0;
                AgeSample {
                    embedding: Embedding::new(values).unwrap(),
                    age,
                }
            })
            .collect()
    }

    #[test]
    fn test_outputs_are_non_negative() {
        let model = AgeEstimator::new(DIM, 1);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let values: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-5.0..5.0)).collect();
            let estimate = model.predict(&Embedding::new(values).unwrap()).unwrap();
            assert!(estimate.age >= 0.0);
            assert!(estimate.uncertainty > 0.0);
        }
    }

    #[test]
    fn test_predict_is_deterministic() {
        let model = AgeEstimator::new(DIM, 1);
        let e = Embedding::new(vec![0.5; DIM]).unwrap();
        assert_eq!(model.predict(&e).unwrap(), model.predict(&e).unwrap());
    }

    #[test]
    fn test_predict_dimension_mismatch() {
        let model = AgeEstimator::new(DIM, 1);
        let e = Embedding::new(vec![0.5; DIM + 1]).unwrap();
        assert!(matches!(
            model.predict(&e),
            Err(AgeError::DimensionMismatch { expected: DIM, got: 17 })
        ));
    }

    #[test]
    fn test_training_reduces_error() {
        let samples = synthetic_samples(400, 3);
        let baseline = AgeEstimator::new(DIM, 42);
        let baseline_mae = baseline.mean_absolute_error(&samples);

        let options = AgeTrainOptions {
            train: TrainOptions {
                max_epochs: 150,
                learning_rate: 1e-2,
                ..AgeTrainOptions::default().train
            },
            ..AgeTrainOptions::default()
        };
        let trained = train_age_estimator(&samples, &options).unwrap();
        assert_eq!(trained.train_samples + trained.validation_samples, 400);
        assert_eq!(trained.validation_samples, 60);
        assert!(
            trained.validation_mae < baseline_mae,
            "mae {} vs baseline {}",
            trained.validation_mae,
            baseline_mae
        );
        // Predicting the mean label alone gives ~18.75 on uniform 5..80.
        assert!(trained.validation_mae < 16.0, "mae {}", trained.validation_mae);
    }

    #[test]
    fn test_training_skips_out_of_range_labels() {
        let mut samples = synthetic_samples(40, 4);
        samples[0].age = 130.0;
        samples[1].age = f32::NAN;
        let options = AgeTrainOptions {
            train: TrainOptions {
                max_epochs: 2,
                ..AgeTrainOptions::default().train
            },
            ..AgeTrainOptions::default()
        };
        let trained = train_age_estimator(&samples, &options).unwrap();
        assert_eq!(trained.skipped, 2);
        assert_eq!(trained.train_samples + trained.validation_samples, 38);
    }

    #[test]
    fn test_training_skips_malformed_first_sample() {
        let mut samples = vec![AgeSample {
            embedding: Embedding::new(vec![0.3; 8]).unwrap(),
            age: 30.0,
        }];
        samples.extend(synthetic_samples(40, 6));
        let options = AgeTrainOptions {
            train: TrainOptions {
                max_epochs: 2,
                ..AgeTrainOptions::default().train
            },
            ..AgeTrainOptions::default()
        };
        let trained = train_age_estimator(&samples, &options).unwrap();
        assert_eq!(trained.skipped, 1);
        assert_eq!(trained.train_samples + trained.validation_samples, 40);
        assert_eq!(trained.estimator.embedding_dim, DIM);
    }

    #[test]
    fn test_training_requires_samples() {
        let result = train_age_estimator(&[], &AgeTrainOptions::default());
        assert!(matches!(result, Err(AgeError::EmptyTrainingSet)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("age_estimator.json");
        let model = AgeEstimator::new(DIM, 8);
        model.save(&path).unwrap();
        let loaded = AgeEstimator::load(&path).unwrap();
        let e = Embedding::new(vec![0.25; DIM]).unwrap();
        assert_eq!(model.predict(&e).unwrap(), loaded.predict(&e).unwrap());
    }

    #[test]
    fn test_load_rejects_mismatched_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let mut wrong_head = AgeEstimator::new(DIM, 8);
        wrong_head.age_1 = Dense::new(TRUNK_HIDDEN[0], AGE_HIDDEN, &mut rng);
        let path = dir.path().join("wrong_head.json");
        wrong_head.save(&path).unwrap();
        let err = AgeEstimator::load(&path).unwrap_err();
        assert!(matches!(err, AgeError::Load(ModelLoadError::Corrupt { ref reason, .. }) if reason.contains("age_1")), "{err}");

        let mut wrong_dim = AgeEstimator::new(DIM, 8);
        wrong_dim.embedding_dim = DIM + 4;
        let path = dir.path().join("wrong_dim.json");
        wrong_dim.save(&path).unwrap();
        assert!(matches!(
            AgeEstimator::load(&path),
            Err(AgeError::Load(ModelLoadError::Corrupt { .. }))
        ));
    }
}
