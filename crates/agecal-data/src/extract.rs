//! Corpus extraction: image directory → embedding records, and verification
//! pair list → labeled pair features.
//!
//! Both loops check a cancellation flag between samples. Whatever was
//! processed before cancellation is returned and stays valid.

use crate::corpus::EmbeddingRecord;
use crate::labels::parse_utkface;
use crate::pairs::PairList;
use crate::{DataError, SkipCounts};
use agecal_core::age::AgeSource;
use agecal_core::onnx::EmbeddingProvider;
use agecal_core::{Embedding, Face, LabeledPair};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// How to label images found in a directory.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LabelSource {
    /// Age from `age_gender_race_timestamp.jpg` file names.
    #[default]
    UtkFace,
    /// Bucket-midpoint ages keyed by file name, from
    /// [`read_bucket_manifest`](crate::labels::read_bucket_manifest).
    Buckets(HashMap<String, f32>),
    /// No labels; for unlabeled pools.
    None,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Stop after this many successfully embedded images.
    pub sample_cap: Option<usize>,
    pub labels: LabelSource,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub records: Vec<EmbeddingRecord>,
    pub skipped: SkipCounts,
    /// Stopped early on request.
    pub cancelled: bool,
}

/// Image files directly under `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
    if !dir.is_dir() {
        return Err(DataError::MissingDataset(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Embed every image in `dir`.
///
/// Per-sample failures (bad label, undecodable image, inference error) are
/// skipped and counted. The run ends at `sample_cap` records, at the end of
/// the directory, or when `cancel` is set.
pub fn extract_corpus<P: EmbeddingProvider + ?Sized>(
    dir: &Path,
    provider: &mut P,
    options: &ExtractOptions,
    cancel: &AtomicBool,
) -> Result<Extraction, DataError> {
    let files = list_images(dir)?;
    tracing::info!(dir = %dir.display(), files = files.len(), cap = ?options.sample_cap, "extracting embeddings");

    let mut records = Vec::new();
    let mut skipped = SkipCounts::default();
    let mut cancelled = false;

    for (index, path) in files.iter().enumerate() {
        if options.sample_cap.is_some_and(|cap| records.len() >= cap) {
            break;
        }
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            tracing::warn!(processed = index, "extraction cancelled");
            break;
        }

        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let age = match &options.labels {
            LabelSource::UtkFace => match parse_utkface(&id) {
                Ok(label) => Some(label.age as f32),
                Err(e) => {
                    skipped.unlabeled += 1;
                    tracing::debug!(file = %id, error = %e, "unlabeled sample skipped");
                    continue;
                }
            },
            LabelSource::Buckets(ages) => match ages.get(&id) {
                Some(&age) => Some(age),
                None => {
                    skipped.unlabeled += 1;
                    tracing::debug!(file = %id, "no bucket label; sample skipped");
                    continue;
                }
            },
            LabelSource::None => None,
        };

        match provider.embed_path(path) {
            Ok(embedding) => records.push(EmbeddingRecord {
                id,
                age,
                embedding: embedding.values,
            }),
            Err(e) => {
                skipped.unreadable += 1;
                tracing::warn!(file = %id, error = %e, "sample skipped");
            }
        }

        if (index + 1) % 1000 == 0 {
            tracing::info!(processed = index + 1, records = records.len(), "extraction progress");
        }
    }

    tracing::info!(
        records = records.len(),
        unlabeled = skipped.unlabeled,
        unreadable = skipped.unreadable,
        cancelled,
        "extraction finished"
    );
    Ok(Extraction {
        records,
        skipped,
        cancelled,
    })
}

#[derive(Debug, Clone)]
pub struct PairExtraction {
    pub pairs: Vec<LabeledPair>,
    pub skipped: SkipCounts,
    pub cancelled: bool,
}

/// Embed and age-estimate both images of every listed pair and assemble
/// labeled features. Each image is processed once even when it appears in
/// several pairs.
pub fn extract_pair_features<P, A>(
    list: &PairList,
    provider: &mut P,
    ages: &mut A,
    sample_cap: Option<usize>,
    cancel: &AtomicBool,
) -> PairExtraction
where
    P: EmbeddingProvider + ?Sized,
    A: AgeSource + ?Sized,
{
    let mut faces: HashMap<PathBuf, Option<Face>> = HashMap::new();
    let mut pairs = Vec::new();
    let mut skipped = SkipCounts::default();
    skipped.merge(list.skipped);
    let mut cancelled = false;

    let mut face = |relative: &Path, skipped: &mut SkipCounts| -> Option<Face> {
        let path = list.image_root.join(relative);
        faces
            .entry(path.clone())
            .or_insert_with(|| match embed_face(&path, &mut *provider, &mut *ages) {
                Ok(face) => Some(face),
                Err(e) => {
                    skipped.unreadable += 1;
                    tracing::warn!(file = %path.display(), error = %e, "pair image skipped");
                    None
                }
            })
            .clone()
    };

    for entry in &list.pairs {
        if sample_cap.is_some_and(|cap| pairs.len() >= cap) {
            break;
        }
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            tracing::warn!(pairs = pairs.len(), "pair extraction cancelled");
            break;
        }
        let (Some(first), Some(second)) = (face(&entry.first, &mut skipped), face(&entry.second, &mut skipped)) else {
            continue;
        };
        match first.pair_feature(&second) {
            Ok(feature) => pairs.push(LabeledPair::new(feature, entry.same)),
            Err(e) => {
                skipped.malformed += 1;
                tracing::warn!(error = %e, "pair feature rejected");
            }
        }
    }

    tracing::info!(
        dataset = %list.dataset,
        pairs = pairs.len(),
        skipped = skipped.total(),
        cancelled,
        "pair features extracted"
    );
    PairExtraction {
        pairs,
        skipped,
        cancelled,
    }
}

fn embed_face<P, A>(path: &Path, provider: &mut P, ages: &mut A) -> Result<Face, DataError>
where
    P: EmbeddingProvider + ?Sized,
    A: AgeSource + ?Sized,
{
    let sample_error = |reason: String| DataError::Sample {
        path: path.display().to_string(),
        reason,
    };
    let embedding = provider.embed_path(path).map_err(|e| sample_error(e.to_string()))?;
    let age = ages.estimate(&embedding).map_err(|e| sample_error(e.to_string()))?;
    Ok(Face::new(embedding, age))
}

/// Estimate ages for corpus records, producing the face pool the synthetic
/// labeler draws from. Invalid records are skipped and counted.
pub fn faces_from_records<A: AgeSource + ?Sized>(records: &[EmbeddingRecord], ages: &mut A) -> (Vec<Face>, SkipCounts) {
    let mut faces = Vec::with_capacity(records.len());
    let mut skipped = SkipCounts::default();
    for record in records {
        let result = Embedding::new(record.embedding.clone())
            .map_err(|e| e.to_string())
            .and_then(|embedding| {
                ages.estimate(&embedding)
                    .map(|age| Face::new(embedding, age))
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(face) => faces.push(face),
            Err(reason) => {
                skipped.unreadable += 1;
                tracing::warn!(id = %record.id, %reason, "record skipped");
            }
        }
    }
    (faces, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairs::{PairDataset, PairEntry};
    use agecal_core::age::AgeError;
    use agecal_core::onnx::EmbedError;
    use agecal_core::AgeEstimate;
    use image::DynamicImage;

    /// Embeds by file name; fails for names containing "corrupt".
    struct NameEmbedder {
        calls: usize,
    }

    impl EmbeddingProvider for NameEmbedder {
        fn embed_image(&mut self, _image: &DynamicImage) -> Result<Embedding, EmbedError> {
            Err(EmbedError::InferenceFailed("not used".into()))
        }

        fn embed_path(&mut self, path: &Path) -> Result<Embedding, EmbedError> {
            self.calls += 1;
            let name = path.to_string_lossy();
            if name.contains("corrupt") {
                return Err(EmbedError::InferenceFailed("undecodable".into()));
            }
            let h = name.bytes().fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
            Ok(Embedding::new(vec![1.0, (h % 97) as f32 / 97.0, (h % 89) as f32 / 89.0])?)
        }
    }

    struct FixedAge;

    impl AgeSource for FixedAge {
        fn estimate(&mut self, embedding: &Embedding) -> Result<AgeEstimate, AgeError> {
            Ok(AgeEstimate::new(20.0 + 40.0 * embedding.values[1], 2.0)?)
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_extract_corpus_skips_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "25_0_1_2017.jpg",
                "40_1_0_2017.jpg",
                "130_0_0_2017.jpg",
                "noname.jpg",
                "33_0_0_corrupt.jpg",
                "notes.txt",
            ],
        );
        let mut embedder = NameEmbedder { calls: 0 };
        let out = extract_corpus(dir.path(), &mut embedder, &ExtractOptions::default(), &AtomicBool::new(false)).unwrap();

        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].id, "25_0_1_2017.jpg");
        assert_eq!(out.records[0].age, Some(25.0));
        assert_eq!(out.skipped.unlabeled, 2);
        assert_eq!(out.skipped.unreadable, 1);
        assert!(!out.cancelled);
    }

    #[test]
    fn test_extract_corpus_cap_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["1_0_0_a.jpg", "2_0_0_b.jpg", "3_0_0_c.jpg"]);

        let mut embedder = NameEmbedder { calls: 0 };
        let options = ExtractOptions {
            sample_cap: Some(2),
            ..ExtractOptions::default()
        };
        let out = extract_corpus(dir.path(), &mut embedder, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(embedder.calls, 2);

        let cancel = AtomicBool::new(true);
        let out = extract_corpus(dir.path(), &mut embedder, &ExtractOptions::default(), &cancel).unwrap();
        assert!(out.cancelled);
        assert!(out.records.is_empty());
    }

    #[test]
    fn test_extract_corpus_bucket_labels() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["1.jpg", "2.jpg", "3.jpg"]);
        let labels = LabelSource::Buckets(HashMap::from([("1.jpg".to_string(), 24.5), ("3.jpg".to_string(), 77.5)]));
        let options = ExtractOptions {
            labels,
            ..ExtractOptions::default()
        };
        let mut embedder = NameEmbedder { calls: 0 };
        let out = extract_corpus(dir.path(), &mut embedder, &options, &AtomicBool::new(false)).unwrap();
        let ages: Vec<Option<f32>> = out.records.iter().map(|r| r.age).collect();
        assert_eq!(ages, vec![Some(24.5), Some(77.5)]);
        assert_eq!(out.skipped.unlabeled, 1);
        assert_eq!(embedder.calls, 2);
    }

    #[test]
    fn test_extract_corpus_missing_dir() {
        let mut embedder = NameEmbedder { calls: 0 };
        let err = extract_corpus(
            Path::new("/nonexistent/utkface"),
            &mut embedder,
            &ExtractOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, DataError::MissingDataset(_)));
    }

    #[test]
    fn test_extract_pair_features_caches_images() {
        let list = PairList {
            dataset: PairDataset::AgeDb30,
            image_root: PathBuf::from("/data/agedb-30"),
            pairs: vec![
                PairEntry {
                    first: "a/a_1.jpg".into(),
                    second: "a/a_2.jpg".into(),
                    same: true,
                },
                PairEntry {
                    first: "a/a_1.jpg".into(),
                    second: "b/b_1.jpg".into(),
                    same: false,
                },
                PairEntry {
                    first: "a/a_1.jpg".into(),
                    second: "c/corrupt_1.jpg".into(),
                    same: false,
                },
            ],
            skipped: SkipCounts::default(),
        };
        let mut embedder = NameEmbedder { calls: 0 };
        let out = extract_pair_features(&list, &mut embedder, &mut FixedAge, None, &AtomicBool::new(false));

        assert_eq!(out.pairs.len(), 2);
        assert!(out.pairs[0].same && !out.pairs[1].same);
        assert_eq!(out.skipped.unreadable, 1);
        // a_1, a_2, b_1, corrupt_1: each embedded once.
        assert_eq!(embedder.calls, 4);
        assert!(out.pairs.iter().all(|p| p.feature.age_diff() >= 0.0));
    }

    #[test]
    fn test_faces_from_records() {
        let records = vec![
            EmbeddingRecord {
                id: "ok".into(),
                age: None,
                embedding: vec![1.0, 0.5, 0.0],
            },
            EmbeddingRecord {
                id: "empty".into(),
                age: None,
                embedding: vec![],
            },
        ];
        let (faces, skipped) = faces_from_records(&records, &mut FixedAge);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].age.age, 40.0);
        assert_eq!(skipped.unreadable, 1);
    }
}
