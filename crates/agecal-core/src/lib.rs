//! agecal-core — age-aware face-similarity calibration.
//!
//! Estimates age (with uncertainty) from face embeddings, fuses similarity,
//! age gap and uncertainty into a calibrated same-person score with one of
//! three strategies, and compares strategies with shared verification
//! metrics (ROC, AUC, EER, TAR@FAR).

pub mod age;
pub mod artifact;
pub mod audit;
pub mod calibration;
pub mod eval;
pub mod features;
pub mod nn;
pub mod onnx;
pub mod optim;
pub mod synthetic;
pub mod train;
pub mod types;

pub use age::{AgeEstimator, AgeSource};
pub use calibration::{CalibrationModel, Calibrator, FitOptions, FitOutcome, Strategy};
pub use eval::{EvaluationMetrics, ValidationError};
pub use features::{assemble, Face};
pub use types::{AgeEstimate, Embedding, FacePairFeature, FeatureError, LabeledPair, EMBEDDING_DIM};
