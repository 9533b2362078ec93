//! JSON Lines corpora: embedding records and labeled pair features.
//!
//! One JSON document per line. Malformed lines are skipped and counted so a
//! partially written or hand-edited file stays usable.

use crate::{DataError, SkipCounts};
use agecal_core::age::AgeSample;
use agecal_core::{Embedding, FeatureError, LabeledPair};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One face in an embedding corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Source identifier, usually the image file name.
    pub id: String,
    /// Ground-truth age label, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f32>,
    pub embedding: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn to_embedding(&self) -> Result<Embedding, FeatureError> {
        Embedding::new(self.embedding.clone())
    }

    /// Training sample for the age estimator, when labeled.
    pub fn to_age_sample(&self) -> Option<Result<AgeSample, FeatureError>> {
        let age = self.age?;
        Some(self.to_embedding().map(|embedding| AgeSample { embedding, age }))
    }
}

/// Items read from a JSON Lines file and what was dropped.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub items: Vec<T>,
    pub skipped: SkipCounts,
}

/// Write `items` as JSON Lines, replacing `path` atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for item in items {
            serde_json::to_writer(&mut writer, item).map_err(std::io::Error::from)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), count = items.len(), "corpus written");
    Ok(())
}

/// Read JSON Lines, skipping blank lines and counting malformed ones.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, DataError> {
    if !path.exists() {
        return Err(DataError::MissingDataset(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut items = Vec::new();
    let mut skipped = SkipCounts::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped.malformed += 1;
                let err = DataError::Malformed {
                    path: path.display().to_string(),
                    line: index + 1,
                    reason: e.to_string(),
                };
                tracing::warn!(error = %err, "skipping malformed line");
            }
        }
    }

    tracing::info!(
        path = %path.display(),
        count = items.len(),
        malformed = skipped.malformed,
        "corpus loaded"
    );
    Ok(Loaded { items, skipped })
}

pub fn read_records(path: &Path) -> Result<Loaded<EmbeddingRecord>, DataError> {
    read_jsonl(path)
}

/// Labeled pair features. Lines whose feature fails validation (e.g. a
/// negative age gap) are malformed.
pub fn read_pairs(path: &Path) -> Result<Loaded<LabeledPair>, DataError> {
    read_jsonl(path)
}

/// Hex SHA-256 of a file, recorded in fit reports to identify the corpus.
pub fn sha256_file(path: &Path) -> Result<String, DataError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
