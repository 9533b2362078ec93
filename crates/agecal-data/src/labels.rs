//! Age labels: UTKFace file names and coarse age buckets.

use crate::{DataError, SkipCounts};
use std::collections::HashMap;
use std::path::Path;

/// Labels above this are treated as annotation errors.
pub const MAX_AGE: i64 = 100;

/// Midpoint age for each of the nine coarse buckets
/// (0-2, 3-9, 10-19, 20-29, 30-39, 40-49, 50-59, 60-69, 70+).
pub const AGE_BUCKET_MIDPOINTS: [f32; 9] = [1.0, 6.0, 14.5, 24.5, 34.5, 44.5, 54.5, 64.5, 77.5];

const BUCKET_LABELS: [&str; 9] = ["0-2", "3-9", "10-19", "20-29", "30-39", "40-49", "50-59", "60-69", "70+"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtkLabel {
    pub age: u32,
    pub gender: Option<u8>,
    pub race: Option<u8>,
}

/// Parse a UTKFace file name, `age_gender_race_timestamp.jpg`.
///
/// Needs at least four `_`-separated parts with an integer age first; ages
/// above [`MAX_AGE`] are rejected.
pub fn parse_utkface(file_name: &str) -> Result<UtkLabel, DataError> {
    let parts: Vec<&str> = file_name.split('_').collect();
    if parts.len() < 4 {
        return Err(DataError::BadFilename(file_name.to_string()));
    }
    let age: i64 = parts[0]
        .trim()
        .parse()
        .map_err(|_| DataError::BadFilename(file_name.to_string()))?;
    if !(0..=MAX_AGE).contains(&age) {
        return Err(DataError::AgeOutOfRange(age));
    }
    Ok(UtkLabel {
        age: age as u32,
        gender: parts[1].parse().ok(),
        race: parts[2].parse().ok(),
    })
}

/// Midpoint for a bucket given as an index (`"3"`) or a range label
/// (`"20-29"`, `"70+"`, `"more than 70"`).
pub fn bucket_midpoint(label: &str) -> Result<f32, DataError> {
    let label = label.trim();
    if let Ok(index) = label.parse::<usize>() {
        return AGE_BUCKET_MIDPOINTS
            .get(index)
            .copied()
            .ok_or_else(|| DataError::UnknownBucket(label.to_string()));
    }
    let normalized = label.to_ascii_lowercase().replace(' ', "");
    let normalized = match normalized.as_str() {
        "morethan70" => "70+",
        other => other,
    };
    BUCKET_LABELS
        .iter()
        .position(|b| *b == normalized)
        .map(|i| AGE_BUCKET_MIDPOINTS[i])
        .ok_or_else(|| DataError::UnknownBucket(label.to_string()))
}

/// Read a bucketed label manifest (FairFace style): a header naming `file`
/// and `age` columns, then one comma-separated row per image. Keys are the
/// image file names without directories. Bad rows are skipped and counted.
pub fn read_bucket_manifest(path: &Path) -> Result<(HashMap<String, f32>, SkipCounts), DataError> {
    if !path.exists() {
        return Err(DataError::MissingDataset(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .unwrap_or_default()
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .collect();
    let column = |name: &str| {
        header.iter().position(|c| c == name).ok_or_else(|| DataError::Malformed {
            path: path.display().to_string(),
            line: 1,
            reason: format!("missing {name} column"),
        })
    };
    let (file_col, age_col) = (column("file")?, column("age")?);

    let mut ages = HashMap::new();
    let mut skipped = SkipCounts::default();
    for (index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let entry = fields.get(file_col).zip(fields.get(age_col));
        let Some((file, bucket)) = entry else {
            skipped.malformed += 1;
            tracing::warn!(path = %path.display(), line = index + 2, "skipping short manifest row");
            continue;
        };
        match bucket_midpoint(bucket) {
            Ok(age) => {
                let name = Path::new(file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.to_string());
                ages.insert(name, age);
            }
            Err(e) => {
                skipped.unlabeled += 1;
                tracing::warn!(path = %path.display(), line = index + 2, error = %e, "skipping manifest row");
            }
        }
    }
    tracing::info!(path = %path.display(), labels = ages.len(), skipped = skipped.total(), "age bucket manifest loaded");
    Ok((ages, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_utkface() {
        let label = parse_utkface("70_0_0_20170104185838254.jpg").unwrap();
        assert_eq!(label.age, 70);
        assert_eq!(label.gender, Some(0));
        assert_eq!(label.race, Some(0));

        let label = parse_utkface("1_1_2_20161219203650636.jpg.chip.jpg").unwrap();
        assert_eq!(label.age, 1);
    }

    #[test]
    fn test_parse_utkface_rejects() {
        assert!(matches!(parse_utkface("35_0_20170104.jpg"), Err(DataError::BadFilename(_))));
        assert!(matches!(parse_utkface("abc_0_0_1.jpg"), Err(DataError::BadFilename(_))));
        assert!(matches!(parse_utkface("116_1_0_2017.jpg"), Err(DataError::AgeOutOfRange(116))));
        // Boundary is inclusive.
        assert_eq!(parse_utkface("100_1_0_2017.jpg").unwrap().age, 100);
    }

    #[test]
    fn test_bucket_midpoints() {
        assert_eq!(bucket_midpoint("0").unwrap(), 1.0);
        assert_eq!(bucket_midpoint("8").unwrap(), 77.5);
        assert_eq!(bucket_midpoint("20-29").unwrap(), 24.5);
        assert_eq!(bucket_midpoint("70+").unwrap(), 77.5);
        assert_eq!(bucket_midpoint("more than 70").unwrap(), 77.5);
        assert!(matches!(bucket_midpoint("9"), Err(DataError::UnknownBucket(_))));
        assert!(matches!(bucket_midpoint("adult"), Err(DataError::UnknownBucket(_))));
    }

    #[test]
    fn test_read_bucket_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fairface_label_train.csv");
        std::fs::write(
            &path,
            "file,age,gender,race,service_test\ntrain/1.jpg,50-59,Male,East Asian,True\ntrain/2.jpg,more than 70,Female,White,False\ntrain/3.jpg,adult,Male,Black,False\ntrain/4.jpg\n",
        )
        .unwrap();
        let (ages, skipped) = read_bucket_manifest(&path).unwrap();
        assert_eq!(ages.len(), 2);
        assert_eq!(ages["1.jpg"], 54.5);
        assert_eq!(ages["2.jpg"], 77.5);
        assert_eq!(skipped.unlabeled, 1);
        assert_eq!(skipped.malformed, 1);
    }

    #[test]
    fn test_read_bucket_manifest_needs_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        std::fs::write(&path, "image,bucket\na.jpg,3\n").unwrap();
        assert!(matches!(read_bucket_manifest(&path), Err(DataError::Malformed { .. })));
    }
}
