//! JSON artifact persistence shared by the native models.
//!
//! Writes go to a sibling temp file first and are renamed into place, so an
//! interrupted write never replaces the last good artifact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("corrupt model artifact {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value).map_err(io::Error::from)?;
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)
}

/// Read a JSON artifact, mapping a missing file and parse failures onto
/// [`ModelLoadError`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::NotFound(path.display().to_string()));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| ModelLoadError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Params {
        alpha: f64,
        tau: f64,
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("params.json");
        let params = Params { alpha: 0.01, tau: 4.0 };

        write_json_atomic(&path, &params).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(read_json::<Params>(&path).unwrap(), params);
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(read_json::<Params>(&missing), Err(ModelLoadError::NotFound(_))));

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert!(matches!(read_json::<Params>(&corrupt), Err(ModelLoadError::Corrupt { .. })));
    }
}
