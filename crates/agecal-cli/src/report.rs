//! `<artifact>.report.json`: everything needed to judge a fitted model
//! without refitting it.

use agecal_core::calibration::FitOutcome;
use agecal_core::synthetic::PairProvenance;
use agecal_core::{EvaluationMetrics, Strategy};
use agecal_data::SkipCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub artifact: PathBuf,
    pub provenance: PairProvenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
    pub corpus: PathBuf,
    pub corpus_sha256: String,
    pub skipped: SkipCounts,
    pub train_pairs: usize,
    pub validation_pairs: usize,
    pub converged: bool,
    /// Solver diagnostic when the budget ran out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence: Option<String>,
    pub train_metrics: EvaluationMetrics,
    pub validation_metrics: EvaluationMetrics,
}

/// Where the corpus for a fit came from.
#[derive(Debug, Clone)]
pub struct CorpusInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub provenance: PairProvenance,
    pub skipped: SkipCounts,
}

impl FitReport {
    pub fn new(outcome: &FitOutcome, artifact: &Path, corpus: &CorpusInfo) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            strategy: outcome.model.strategy(),
            artifact: artifact.to_path_buf(),
            provenance: corpus.provenance,
            caveat: corpus.provenance.caveat().map(str::to_string),
            corpus: corpus.path.clone(),
            corpus_sha256: corpus.sha256.clone(),
            skipped: corpus.skipped,
            train_pairs: outcome.train_pairs,
            validation_pairs: outcome.validation_pairs,
            converged: outcome.model.converged(),
            convergence: outcome.convergence.as_ref().map(|e| e.to_string()),
            train_metrics: outcome.train_metrics.clone(),
            validation_metrics: outcome.validation_metrics.clone(),
        }
    }
}

/// `model.json` → `model.report.json`.
pub fn report_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("report.json")
}

pub fn write_report(report: &FitReport) -> std::io::Result<PathBuf> {
    let path = report_path(&report.artifact);
    agecal_core::artifact::write_json_atomic(&path, report)?;
    tracing::info!(path = %path.display(), run_id = %report.run_id, "fit report written");
    Ok(path)
}

/// One-line metric summary printed after fit and evaluate.
pub fn metrics_line(metrics: &EvaluationMetrics) -> String {
    if let Some(reason) = &metrics.undefined {
        return format!("metrics undefined ({reason})");
    }
    let fmt = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string());
    format!(
        "AUC {}  EER {}  TAR@FAR={} {}",
        fmt(metrics.auc),
        fmt(metrics.eer),
        metrics.target_far,
        fmt(metrics.tar_at_far)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agecal_core::calibration::{fit, FitOptions};
    use agecal_core::{FacePairFeature, LabeledPair};

    fn pairs() -> Vec<LabeledPair> {
        (0..40)
            .map(|i| {
                let same = i % 2 == 0;
                let similarity = if same { 0.7 + 0.005 * i as f32 } else { 0.1 + 0.005 * i as f32 };
                LabeledPair::new(FacePairFeature::new(similarity, (i % 7) as f32 * 5.0, 2.0).unwrap(), same)
            })
            .collect()
    }

    #[test]
    fn test_report_path() {
        assert_eq!(report_path(Path::new("/m/penalty.json")), PathBuf::from("/m/penalty.report.json"));
    }

    #[test]
    fn test_report_round_trip_fields() {
        let outcome = fit(Strategy::Penalty, &pairs(), &FitOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("penalty.json");
        let corpus = CorpusInfo {
            path: dir.path().join("pool.jsonl"),
            sha256: "ab".repeat(32),
            provenance: PairProvenance::SimilarityHeuristic,
            skipped: SkipCounts::default(),
        };
        let report = FitReport::new(&outcome, &artifact, &corpus);
        let path = write_report(&report).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["strategy"], "penalty");
        assert_eq!(json["provenance"], "similarity_heuristic");
        assert!(json["caveat"].as_str().unwrap().contains("similarity"));
        assert_eq!(json["corpus_sha256"].as_str().unwrap().len(), 64);
        assert_eq!(json["train_pairs"].as_u64().unwrap() + json["validation_pairs"].as_u64().unwrap(), 40);
        assert!(Uuid::parse_str(json["run_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_metrics_line() {
        let metrics = agecal_core::eval::evaluate(&[0.9, 0.8], &[0.1, 0.2], 1e-3);
        let line = metrics_line(&metrics);
        assert!(line.starts_with("AUC 1.0000  EER 0.0000"));

        let undefined = agecal_core::eval::evaluate(&[0.9], &[], 1e-3);
        assert!(metrics_line(&undefined).starts_with("metrics undefined"));
    }
}
