//! Verification pair lists for cross-age datasets.
//!
//! Both formats have one header line, then one pair per line:
//! `name idx1 idx2` for a same-person pair or `name1 idx1 name2 idx2` for a
//! different-person pair. AgeDB-30 is tab separated and uses indices as
//! written; CALFW is whitespace separated with indices zero-padded to four
//! digits and images under `ca-aligned/`.

use crate::{DataError, SkipCounts};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairDataset {
    AgeDb30,
    Calfw,
}

impl PairDataset {
    /// Directory name under the datasets root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PairDataset::AgeDb30 => "agedb-30",
            PairDataset::Calfw => "calfw",
        }
    }

    pub fn pairs_file(&self) -> &'static str {
        match self {
            PairDataset::AgeDb30 => "agedb_pairs.txt",
            PairDataset::Calfw => "calfw_pairs.txt",
        }
    }

    pub fn image_root(&self, data_dir: &Path) -> PathBuf {
        match self {
            PairDataset::AgeDb30 => data_dir.to_path_buf(),
            PairDataset::Calfw => data_dir.join("ca-aligned"),
        }
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            PairDataset::AgeDb30 => line.trim().split('\t').map(str::trim).collect(),
            PairDataset::Calfw => line.split_whitespace().collect(),
        }
    }

    fn image(&self, name: &str, index: &str) -> Option<PathBuf> {
        let file = match self {
            PairDataset::AgeDb30 => format!("{name}_{index}.jpg"),
            PairDataset::Calfw => format!("{name}_{:04}.jpg", index.parse::<u32>().ok()?),
        };
        Some(Path::new(name).join(file))
    }
}

impl fmt::Display for PairDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairDataset::AgeDb30 => f.write_str("AgeDB-30"),
            PairDataset::Calfw => f.write_str("CALFW"),
        }
    }
}

/// Two image paths relative to the image root, and whether they show the
/// same person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairEntry {
    pub first: PathBuf,
    pub second: PathBuf,
    pub same: bool,
}

#[derive(Debug, Clone)]
pub struct PairList {
    pub dataset: PairDataset,
    pub image_root: PathBuf,
    pub pairs: Vec<PairEntry>,
    pub skipped: SkipCounts,
}

impl PairList {
    pub fn same_count(&self) -> usize {
        self.pairs.iter().filter(|p| p.same).count()
    }
}

/// Parse pair-list text (header line included). Lines with the wrong field
/// count or a bad index are skipped and counted.
pub fn parse_pairs(dataset: PairDataset, text: &str) -> (Vec<PairEntry>, SkipCounts) {
    let mut pairs = Vec::new();
    let mut skipped = SkipCounts::default();

    for (index, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = dataset.split(line);
        let entry = match fields.as_slice() {
            [name, a, b] => dataset.image(name, a).zip(dataset.image(name, b)).map(|(first, second)| PairEntry {
                first,
                second,
                same: true,
            }),
            [name_a, a, name_b, b] => dataset
                .image(name_a, a)
                .zip(dataset.image(name_b, b))
                .map(|(first, second)| PairEntry {
                    first,
                    second,
                    same: false,
                }),
            _ => None,
        };
        match entry {
            Some(entry) => pairs.push(entry),
            None => {
                skipped.malformed += 1;
                tracing::warn!(%dataset, line = index + 1, "skipping malformed pair line");
            }
        }
    }
    (pairs, skipped)
}

/// Load `<data_dir>/<pairs file>` for `dataset`.
pub fn load_pairs(dataset: PairDataset, data_dir: &Path) -> Result<PairList, DataError> {
    let path = data_dir.join(dataset.pairs_file());
    if !path.exists() {
        return Err(DataError::MissingDataset(path));
    }
    let text = std::fs::read_to_string(&path)?;
    let (pairs, skipped) = parse_pairs(dataset, &text);
    let list = PairList {
        dataset,
        image_root: dataset.image_root(data_dir),
        pairs,
        skipped,
    };
    tracing::info!(
        %dataset,
        pairs = list.pairs.len(),
        same = list.same_count(),
        malformed = skipped.malformed,
        "pair list loaded"
    );
    Ok(list)
}

/// Find a pair list under `root`, preferring AgeDB-30 over CALFW.
pub fn auto_detect(root: &Path) -> Result<PairList, DataError> {
    for dataset in [PairDataset::AgeDb30, PairDataset::Calfw] {
        let dir = root.join(dataset.dir_name());
        if dir.join(dataset.pairs_file()).exists() {
            return load_pairs(dataset, &dir);
        }
    }
    Err(DataError::MissingDataset(root.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agedb() {
        let text = "header\nAlbertEinstein\t3\t17\nAlbertEinstein\t3\tMarieCurie\t5\nbroken\tline\n";
        let (pairs, skipped) = parse_pairs(PairDataset::AgeDb30, text);
        assert_eq!(pairs.len(), 2);
        assert_eq!(skipped.malformed, 1);
        assert_eq!(pairs[0].first, Path::new("AlbertEinstein/AlbertEinstein_3.jpg"));
        assert_eq!(pairs[0].second, Path::new("AlbertEinstein/AlbertEinstein_17.jpg"));
        assert!(pairs[0].same);
        assert_eq!(pairs[1].second, Path::new("MarieCurie/MarieCurie_5.jpg"));
        assert!(!pairs[1].same);
    }

    #[test]
    fn test_parse_calfw_pads_indices() {
        let text = "name idx1 idx2\nAaron_Peirsol 1  4\nAaron_Peirsol 2 Zico 1\nAaron_Peirsol x 4\n";
        let (pairs, skipped) = parse_pairs(PairDataset::Calfw, text);
        assert_eq!(pairs.len(), 2);
        assert_eq!(skipped.malformed, 1);
        assert_eq!(pairs[0].first, Path::new("Aaron_Peirsol/Aaron_Peirsol_0001.jpg"));
        assert_eq!(pairs[1].second, Path::new("Zico/Zico_0001.jpg"));
    }

    #[test]
    fn test_header_is_skipped() {
        // A header that happens to look like a pair is still skipped.
        let (pairs, _) = parse_pairs(PairDataset::AgeDb30, "a\t1\t2\nb\t1\t2\n");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].first, Path::new("b/b_1.jpg"));
    }

    #[test]
    fn test_auto_detect_prefers_agedb() {
        let root = tempfile::tempdir().unwrap();
        let calfw = root.path().join("calfw");
        std::fs::create_dir_all(&calfw).unwrap();
        std::fs::write(calfw.join("calfw_pairs.txt"), "h\nx 1 2\n").unwrap();

        let list = auto_detect(root.path()).unwrap();
        assert_eq!(list.dataset, PairDataset::Calfw);
        assert_eq!(list.image_root, calfw.join("ca-aligned"));

        let agedb = root.path().join("agedb-30");
        std::fs::create_dir_all(&agedb).unwrap();
        std::fs::write(agedb.join("agedb_pairs.txt"), "h\ny\t1\t2\n").unwrap();
        let list = auto_detect(root.path()).unwrap();
        assert_eq!(list.dataset, PairDataset::AgeDb30);
        assert_eq!(list.image_root, agedb);
        assert_eq!(list.same_count(), 1);
    }

    #[test]
    fn test_auto_detect_missing() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(auto_detect(root.path()), Err(DataError::MissingDataset(_))));
    }
}
