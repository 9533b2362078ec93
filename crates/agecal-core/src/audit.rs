//! Age-sensitivity audit for a fitted calibrator.
//!
//! Probes the model on a fixed feature grid to answer one question: does
//! the decision depend on age gap at all, or has the model collapsed into a
//! plain similarity threshold (the expected outcome when it was trained on
//! similarity-heuristic pairs)?

use crate::calibration::{Calibrator, OutputKind};
use crate::types::{FacePairFeature, FeatureError};
use serde::Serialize;

pub const GRID_SIMILARITIES: [f32; 5] = [0.3, 0.5, 0.7, 0.8, 0.9];
pub const GRID_AGE_DIFFS: [f32; 4] = [0.0, 10.0, 30.0, 60.0];
pub const THRESHOLD_AGE_DIFFS: [f32; 3] = [0.0, 20.0, 40.0];
/// Total age sensitivity below this flags the model as collapsed.
pub const COLLAPSE_TOLERANCE: f64 = 0.05;

const BASELINE: (f32, f32, f32) = (0.6, 20.0, 0.0);
const ABLATION_SIMILARITIES: [f32; 5] = [0.2, 0.4, 0.6, 0.8, 0.95];
const ABLATION_AGE_DIFFS: [f32; 5] = [0.0, 10.0, 20.0, 40.0, 80.0];
const ABLATION_UNCERTAINTIES: [f32; 5] = [0.0, 5.0, 10.0, 20.0, 40.0];
const EDGE_SIMILARITIES: [f32; 5] = [0.65, 0.68, 0.70, 0.72, 0.75];
const BISECTION_STEPS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct GridRow {
    pub similarity: f32,
    /// One score per entry of [`GRID_AGE_DIFFS`].
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub value: f32,
    pub score: f64,
    /// Change from the ablation baseline.
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ablation {
    pub baseline: f64,
    pub similarity: Vec<Probe>,
    pub age_diff: Vec<Probe>,
    pub uncertainty: Vec<Probe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeCase {
    pub similarity: f32,
    pub same_age: f64,
    pub sixty_year_gap: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdProbe {
    pub age_diff: f32,
    /// Similarity at which the decision flips, by bisection on [0, 1].
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub output_kind: OutputKind,
    pub decision_threshold: f64,
    pub grid: Vec<GridRow>,
    pub ablation: Ablation,
    pub edge_cases: Vec<EdgeCase>,
    pub thresholds: Vec<ThresholdProbe>,
    /// `|s(0.85,0) − s(0.85,80)| + |s(0.4,0) − s(0.4,80)|` at zero uncertainty.
    pub age_sensitivity: f64,
    /// The model ignores age gap: it is a similarity threshold.
    pub collapsed: bool,
}

fn probe<C: Calibrator + ?Sized>(model: &C, similarity: f32, age_diff: f32, uncertainty: f32) -> Result<f64, FeatureError> {
    Ok(model.score(&FacePairFeature::new(similarity, age_diff, uncertainty)?))
}

fn similarity_threshold<C: Calibrator + ?Sized>(model: &C, age_diff: f32) -> Result<f64, FeatureError> {
    let cut = model.decision_threshold();
    let (mut low, mut high) = (0.0f32, 1.0f32);
    let mut mid = 0.5f32;
    for _ in 0..BISECTION_STEPS {
        mid = (low + high) / 2.0;
        if probe(model, mid, age_diff, 0.0)? > cut {
            high = mid;
        } else {
            low = mid;
        }
    }
    Ok(f64::from(mid))
}

/// Run every probe against `model`.
pub fn audit<C: Calibrator + ?Sized>(model: &C) -> Result<AuditReport, FeatureError> {
    let grid = GRID_SIMILARITIES
        .iter()
        .map(|&similarity| {
            let scores = GRID_AGE_DIFFS
                .iter()
                .map(|&gap| probe(model, similarity, gap, 0.0))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(GridRow { similarity, scores })
        })
        .collect::<Result<Vec<_>, FeatureError>>()?;

    let (base_sim, base_gap, base_unc) = BASELINE;
    let baseline = probe(model, base_sim, base_gap, base_unc)?;
    let sweep = |values: &[f32], at: &dyn Fn(f32) -> (f32, f32, f32)| -> Result<Vec<Probe>, FeatureError> {
        values
            .iter()
            .map(|&value| {
                let (s, a, u) = at(value);
                let score = probe(model, s, a, u)?;
                Ok(Probe {
                    value,
                    score,
                    delta: score - baseline,
                })
            })
            .collect()
    };
    let ablation = Ablation {
        baseline,
        similarity: sweep(&ABLATION_SIMILARITIES, &|v| (v, base_gap, base_unc))?,
        age_diff: sweep(&ABLATION_AGE_DIFFS, &|v| (base_sim, v, base_unc))?,
        uncertainty: sweep(&ABLATION_UNCERTAINTIES, &|v| (base_sim, base_gap, v))?,
    };

    let edge_cases = EDGE_SIMILARITIES
        .iter()
        .map(|&similarity| {
            Ok(EdgeCase {
                similarity,
                same_age: probe(model, similarity, 0.0, 0.0)?,
                sixty_year_gap: probe(model, similarity, 60.0, 0.0)?,
            })
        })
        .collect::<Result<Vec<_>, FeatureError>>()?;

    let thresholds = THRESHOLD_AGE_DIFFS
        .iter()
        .map(|&age_diff| {
            Ok(ThresholdProbe {
                age_diff,
                similarity_threshold: similarity_threshold(model, age_diff)?,
            })
        })
        .collect::<Result<Vec<_>, FeatureError>>()?;

    let age_sensitivity = (probe(model, 0.85, 0.0, 0.0)? - probe(model, 0.85, 80.0, 0.0)?).abs()
        + (probe(model, 0.4, 0.0, 0.0)? - probe(model, 0.4, 80.0, 0.0)?).abs();
    let collapsed = age_sensitivity < COLLAPSE_TOLERANCE;
    if collapsed {
        tracing::warn!(
            age_sensitivity,
            "calibrator is insensitive to age gap; it reduces to a similarity threshold"
        );
    } else {
        tracing::info!(age_sensitivity, "calibrator uses age gap");
    }

    Ok(AuditReport {
        output_kind: model.output_kind(),
        decision_threshold: model.decision_threshold(),
        grid,
        ablation,
        edge_cases,
        thresholds,
        age_sensitivity,
        collapsed,
    })
}
