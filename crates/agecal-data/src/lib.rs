//! agecal-data — dataset plumbing for agecal.
//!
//! Parses age labels and verification pair lists, reads and writes
//! embedding corpora as JSON Lines, and extracts corpora from image
//! directories with cooperative cancellation.

pub mod corpus;
pub mod extract;
pub mod labels;
pub mod pairs;

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// A sample or file that could not be used. Per-sample variants are
/// skipped and counted by the loaders; only a missing dataset or an I/O
/// failure on the file itself is fatal.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("unrecognized file name {0}: expected age_gender_race_timestamp.jpg")]
    BadFilename(String),
    #[error("age {0} outside 0..=100")]
    AgeOutOfRange(i64),
    #[error("unknown age bucket {0:?}")]
    UnknownBucket(String),
    #[error("{path}:{line}: {reason}")]
    Malformed { path: String, line: usize, reason: String },
    #[error("dataset not found: {0}")]
    MissingDataset(PathBuf),
    #[error("sample {path}: {reason}")]
    Sample { path: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-kind counts of discarded samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    /// No usable label (bad file name, out-of-range age).
    pub unlabeled: usize,
    /// Unreadable or undecodable image, or embedding failure.
    pub unreadable: usize,
    /// Malformed lines in a text or JSON Lines file.
    pub malformed: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.unlabeled + self.unreadable + self.malformed
    }

    pub fn merge(&mut self, other: SkipCounts) {
        self.unlabeled += other.unlabeled;
        self.unreadable += other.unreadable;
        self.malformed += other.malformed;
    }
}
