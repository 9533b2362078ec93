//! ONNX Runtime adapters for externally trained graphs.
//!
//! - [`OnnxEmbedder`]: face crop → 512-d embedding (MobileFaceNet / ArcFace
//!   family, 112×112 RGB input).
//! - [`OnnxAgeEstimator`]: embeddings → age and uncertainty.
//! - [`OnnxCalibrator`]: learned calibrator graph, features → probability.

use crate::age::{AgeError, AgeSource};
use crate::artifact::ModelLoadError;
use crate::calibration::{Calibrator, OutputKind};
use crate::types::{AgeEstimate, Embedding, FacePairFeature, FeatureError, EMBEDDING_DIM};
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
const INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid embedding: {0}")]
    Feature(#[from] FeatureError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Black-box embedding network: face image → fixed-length vector.
pub trait EmbeddingProvider {
    fn embed_image(&mut self, image: &DynamicImage) -> Result<Embedding, EmbedError>;

    fn embed_path(&mut self, path: &Path) -> Result<Embedding, EmbedError> {
        let image = image::open(path)?;
        self.embed_image(&image)
    }
}

fn open_session(path: &Path, kind: &str) -> Result<Session, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::NotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(path)?;
    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {kind} model"
    );
    Ok(session)
}

fn output_names(session: &Session) -> Vec<String> {
    session.outputs().iter().map(|o| o.name().to_string()).collect()
}

/// Output positions for the age graph: by name when both `age` and
/// `uncertainty` are present, otherwise `[0]` = age, `[1]` = uncertainty.
/// `None` when the graph has fewer than two outputs.
fn discover_age_outputs(names: &[String]) -> Option<(usize, usize)> {
    if names.len() < 2 {
        return None;
    }
    let find = |target: &str| names.iter().position(|n| n == target);
    match (find("age"), find("uncertainty")) {
        (Some(age), Some(uncertainty)) => Some((age, uncertainty)),
        _ => {
            tracing::info!(?names, "age outputs not recognized by name, using positional mapping [0]=age, [1]=uncertainty");
            Some((0, 1))
        }
    }
}

/// Reject graphs with fewer outputs than the adapter reads.
fn require_outputs(session: &Session, path: &Path, needed: usize) -> Result<(), ModelLoadError> {
    let found = session.outputs().len();
    if found < needed {
        return Err(ModelLoadError::Corrupt {
            path: path.display().to_string(),
            reason: format!("graph has {found} outputs, expected at least {needed}"),
        });
    }
    Ok(())
}

/// Embedding network over ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    model_version: String,
}

impl OnnxEmbedder {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = open_session(path, "embedding")?;
        require_outputs(&session, path, 1)?;
        let model_version = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self { session, model_version })
    }

    /// RGB crop → `(1, 3, 112, 112)` tensor normalized to `[-1, 1]`.
    fn preprocess(image: &DynamicImage) -> Array4<f32> {
        let size = EMBEDDER_INPUT_SIZE;
        let rgb = image
            .resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgb8();
        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (f32::from(pixel[c]) - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
        tensor
    }
}

impl EmbeddingProvider for OnnxEmbedder {
    fn embed_image(&mut self, image: &DynamicImage) -> Result<Embedding, EmbedError> {
        let input = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec())?
            .normalized()
            .with_model_version(self.model_version.clone()))
    }
}

/// Age estimator graph: input `embeddings` `[batch, 512]`, outputs `age`
/// and `uncertainty`, each `[batch, 1]`.
pub struct OnnxAgeEstimator {
    session: Session,
    age_index: usize,
    uncertainty_index: usize,
}

impl OnnxAgeEstimator {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = open_session(path, "age")?;
        require_outputs(&session, path, 2)?;
        let (age_index, uncertainty_index) =
            discover_age_outputs(&output_names(&session)).ok_or_else(|| ModelLoadError::Corrupt {
                path: path.display().to_string(),
                reason: "age graph needs age and uncertainty outputs".to_string(),
            })?;
        Ok(Self {
            session,
            age_index,
            uncertainty_index,
        })
    }

    pub fn estimate_batch(&mut self, embeddings: &[Embedding]) -> Result<Vec<AgeEstimate>, AgeError> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = Array2::<f32>::zeros((embeddings.len(), EMBEDDING_DIM));
        for (i, e) in embeddings.iter().enumerate() {
            if e.dim() != EMBEDDING_DIM {
                return Err(AgeError::DimensionMismatch {
                    expected: EMBEDDING_DIM,
                    got: e.dim(),
                });
            }
            for (j, v) in e.normalized().values.into_iter().enumerate() {
                input[[i, j]] = v;
            }
        }

        let run = |e: ort::Error| AgeError::InferenceFailed(e.to_string());
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view()).map_err(run)?])
            .map_err(run)?;
        let (_, ages) = outputs[self.age_index]
            .try_extract_tensor::<f32>()
            .map_err(|e| AgeError::InferenceFailed(format!("age output: {e}")))?;
        let (_, uncertainties) = outputs[self.uncertainty_index]
            .try_extract_tensor::<f32>()
            .map_err(|e| AgeError::InferenceFailed(format!("uncertainty output: {e}")))?;

        if ages.len() != embeddings.len() || uncertainties.len() != embeddings.len() {
            return Err(AgeError::InferenceFailed(format!(
                "expected {} estimates, got {} ages and {} uncertainties",
                embeddings.len(),
                ages.len(),
                uncertainties.len()
            )));
        }
        ages.iter()
            .zip(uncertainties)
            .map(|(&age, &uncertainty)| Ok(AgeEstimate::new(age, uncertainty)?))
            .collect()
    }
}

impl AgeSource for OnnxAgeEstimator {
    fn estimate(&mut self, embedding: &Embedding) -> Result<AgeEstimate, AgeError> {
        let mut estimates = self.estimate_batch(std::slice::from_ref(embedding))?;
        estimates
            .pop()
            .ok_or_else(|| AgeError::InferenceFailed("empty age output".to_string()))
    }
}

/// Learned calibrator graph: input `features` `[batch, 3]`, output
/// `probability` `[batch, 1]`.
///
/// `ort` sessions need exclusive access to run, so scoring serializes on an
/// internal lock; a failed run scores as NaN, which the evaluation engine
/// reports as an undefined metric.
pub struct OnnxCalibrator {
    session: Mutex<Session>,
}

impl OnnxCalibrator {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = open_session(path, "calibrator")?;
        require_outputs(&session, path, 1)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    pub fn probabilities(&self, features: &[FacePairFeature]) -> Result<Vec<f64>, EmbedError> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = Array2::<f32>::zeros((features.len(), 3));
        for (i, f) in features.iter().enumerate() {
            for (j, v) in f.to_learned_input().into_iter().enumerate() {
                input[[i, j]] = v;
            }
        }
        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedError::InferenceFailed("calibrator session lock poisoned".to_string()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("probability output: {e}")))?;
        if raw.len() != features.len() {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {} probabilities, got {}",
                features.len(),
                raw.len()
            )));
        }
        Ok(raw.iter().map(|&p| f64::from(p).clamp(0.0, 1.0)).collect())
    }
}

impl Calibrator for OnnxCalibrator {
    fn score(&self, feature: &FacePairFeature) -> f64 {
        match self.probabilities(std::slice::from_ref(feature)) {
            Ok(p) => p.first().copied().unwrap_or(f64::NAN),
            Err(e) => {
                tracing::warn!(error = %e, "calibrator inference failed");
                f64::NAN
            }
        }
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Probability
    }

    fn score_all(&self, features: &[FacePairFeature]) -> Vec<f64> {
        match self.probabilities(features) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "calibrator inference failed");
                vec![f64::NAN; features.len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_shape_and_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 150, Rgb([255, 0, 128])));
        let tensor = OnnxEmbedder::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 10, 10]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        assert!((tensor[[0, 2, 50, 60]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let img = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
        let tensor = OnnxEmbedder::preprocess(&DynamicImage::ImageRgb8(img));
        let px = |c: usize| tensor[[0, c, 7, 3]] * EMBEDDER_STD + EMBEDDER_MEAN;
        assert!((px(0) - 10.0).abs() < 1e-3);
        assert!((px(1) - 20.0).abs() < 1e-3);
        assert!((px(2) - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_discover_age_outputs() {
        let named = vec!["uncertainty".to_string(), "age".to_string()];
        assert_eq!(discover_age_outputs(&named), Some((1, 0)));
        let anonymous = vec!["out_0".to_string(), "out_1".to_string()];
        assert_eq!(discover_age_outputs(&anonymous), Some((0, 1)));
    }

    #[test]
    fn test_single_output_age_graph_is_rejected() {
        assert_eq!(discover_age_outputs(&["age".to_string()]), None);
        assert_eq!(discover_age_outputs(&["output".to_string()]), None);
        assert_eq!(discover_age_outputs(&[]), None);
    }

    #[test]
    fn test_missing_models_are_reported() {
        let missing = Path::new("/nonexistent/agecal/model.onnx");
        assert!(matches!(OnnxEmbedder::load(missing), Err(ModelLoadError::NotFound(_))));
        assert!(matches!(OnnxAgeEstimator::load(missing), Err(ModelLoadError::NotFound(_))));
        assert!(matches!(OnnxCalibrator::load(missing), Err(ModelLoadError::NotFound(_))));
    }
}
