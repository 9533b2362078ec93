//! Generic mini-batch training loop shared by the age estimator and the
//! learned calibrator.
//!
//! The loop owns all mutable training state explicitly: Adam moments, the
//! plateau and early-stop counters, and the best-validation snapshot.

use crate::artifact::write_json_atomic;
use crate::nn::{Adam, AdamSlot, Dense, DenseGrad};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("network returned {got} gradients for {expected} layers")]
    GradientCount { expected: usize, got: usize },
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] std::io::Error),
}

/// A trainable network built from [`Dense`] layers.
pub trait Network: Clone + Serialize {
    type Sample;

    fn layers(&self) -> Vec<&Dense>;

    fn layers_mut(&mut self) -> Vec<&mut Dense>;

    /// Forward and backward pass over one batch in training mode (dropout
    /// active). Returns the mean batch loss and one gradient per layer, in
    /// [`layers`](Self::layers) order.
    fn backprop(&self, batch: &[&Self::Sample], rng: &mut StdRng) -> (f32, Vec<DenseGrad>);

    /// Mean loss in inference mode.
    fn loss(&self, samples: &[Self::Sample]) -> f32;
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// Multiplier applied to the learning rate on a validation plateau.
    pub lr_factor: f32,
    /// Stagnant epochs before the learning rate is reduced.
    pub lr_patience: usize,
    /// Stagnant epochs before training stops.
    pub stop_patience: usize,
    pub seed: u64,
    /// Written on every strict validation improvement.
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            batch_size: 64,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            lr_factor: 0.5,
            lr_patience: 5,
            stop_patience: 10,
            seed: 42,
            checkpoint: None,
        }
    }
}

/// Patience counter over a loss that should decrease.
#[derive(Debug, Clone)]
pub struct Patience {
    limit: usize,
    best: f32,
    stagnant: usize,
}

impl Patience {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            best: f32::INFINITY,
            stagnant: 0,
        }
    }

    /// Record an epoch's loss. Returns `true` on strict improvement.
    pub fn observe(&mut self, loss: f32) -> bool {
        if loss < self.best {
            self.best = loss;
            self.stagnant = 0;
            true
        } else {
            self.stagnant += 1;
            false
        }
    }

    pub fn exhausted(&self) -> bool {
        self.stagnant >= self.limit
    }

    pub fn reset(&mut self) {
        self.stagnant = 0;
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

/// Outcome of [`train_network`]: the best-validation snapshot plus history.
#[derive(Debug, Clone)]
pub struct Trained<N> {
    pub network: N,
    pub best_validation_loss: f32,
    pub best_epoch: usize,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub final_learning_rate: f32,
}

/// Train `network` and return the parameters with the lowest validation
/// loss. With an empty `validation` set the training loss is monitored.
pub fn train_network<N: Network>(
    mut network: N,
    train: &[N::Sample],
    validation: &[N::Sample],
    options: &TrainOptions,
) -> Result<Trained<N>, TrainError> {
    if train.is_empty() {
        return Err(TrainError::EmptyTrainingSet);
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut adam = Adam::new(options.learning_rate, options.weight_decay);
    let mut slots: Vec<AdamSlot> = network.layers().into_iter().map(AdamSlot::for_layer).collect();
    let monitored = if validation.is_empty() { train } else { validation };

    let mut indices: Vec<usize> = (0..train.len()).collect();
    let batch_size = options.batch_size.max(1);
    let mut plateau = Patience::new(options.lr_patience);
    let mut early_stop = Patience::new(options.stop_patience);
    let mut best = network.clone();
    let mut best_epoch = 0;
    let mut epochs_run = 0;
    let mut stopped_early = false;

    for epoch in 0..options.max_epochs {
        epochs_run = epoch + 1;
        indices.shuffle(&mut rng);

        let mut train_loss = 0.0f32;
        let mut batches = 0usize;
        for chunk in indices.chunks(batch_size) {
            let batch: Vec<&N::Sample> = chunk.iter().map(|&i| &train[i]).collect();
            let (loss, grads) = network.backprop(&batch, &mut rng);
            if grads.len() != slots.len() {
                return Err(TrainError::GradientCount {
                    expected: slots.len(),
                    got: grads.len(),
                });
            }

            adam.tick();
            for ((layer, grad), slot) in network.layers_mut().into_iter().zip(&grads).zip(slots.iter_mut()) {
                adam.update(layer, grad, slot);
            }
            train_loss += loss;
            batches += 1;
        }
        train_loss /= batches.max(1) as f32;

        let validation_loss = network.loss(monitored);
        tracing::debug!(
            epoch = epoch + 1,
            train_loss,
            validation_loss,
            lr = adam.learning_rate,
            "epoch finished"
        );

        if early_stop.observe(validation_loss) {
            best = network.clone();
            best_epoch = epoch + 1;
            if let Some(path) = &options.checkpoint {
                write_json_atomic(path, &best)?;
            }
        }

        if !plateau.observe(validation_loss) && plateau.exhausted() {
            adam.learning_rate *= options.lr_factor;
            plateau.reset();
            tracing::debug!(lr = adam.learning_rate, "validation plateau; learning rate reduced");
        }

        if early_stop.exhausted() {
            stopped_early = true;
            tracing::info!(epoch = epoch + 1, "early stopping");
            break;
        }
    }

    Ok(Trained {
        network: best,
        best_validation_loss: early_stop.best(),
        best_epoch,
        epochs_run,
        stopped_early,
        final_learning_rate: adam.learning_rate,
    })
}

/// Seeded shuffle-and-split. Returns `(train, validation)`; at least one
/// item stays in `train` whenever `items` is non-empty.
pub fn split_train_validation<T: Clone>(items: &[T], validation_fraction: f32, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut indices: Vec<usize> = (0..items.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let fraction = validation_fraction.clamp(0.0, 1.0);
    let mut n_validation = (items.len() as f32 * fraction).round() as usize;
    if n_validation >= items.len() {
        n_validation = items.len().saturating_sub(1);
    }

    let validation: Vec<T> = indices[..n_validation].iter().map(|&i| items[i].clone()).collect();
    let train: Vec<T> = indices[n_validation..].iter().map(|&i| items[i].clone()).collect();
    (train, validation)
}
