//! Manifest parsing and the deterministic train/validation split.

use std::{collections::HashSet, fmt, path::Path};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Name of one example: the image file name without its extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Disjoint training and validation identifiers covering the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub training: Vec<SampleId>,
    pub validation: Vec<SampleId>,
}

impl Split {
    pub fn load(
        manifest: impl AsRef<Path>,
        column: &str,
        validation_fraction: f64,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        let manifest = manifest.as_ref();
        let ids = read_manifest(manifest, column)?;
        split_identifiers(ids, validation_fraction, seed)
            .map_err(|err| TrainingError::manifest(manifest, err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.training.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads identifiers from the `column` of a headered CSV manifest.
///
/// Each cell holds an extension-qualified file name; the identifier is the
/// part before the first `.`.
pub fn read_manifest(path: impl AsRef<Path>, column: &str) -> Result<Vec<SampleId>, TrainingError> {
    let path = path.as_ref();
    let fail = |reason: String| TrainingError::manifest(path, reason);

    let mut reader = csv::Reader::from_path(path).map_err(|err| fail(err.to_string()))?;
    let headers = reader.headers().map_err(|err| fail(err.to_string()))?;
    let column_index = headers
        .iter()
        .position(|header| header.trim() == column)
        .ok_or_else(|| fail(format!("column '{column}' not found")))?;

    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for (row, record) in reader.records().enumerate() {
        // Header is line 1.
        let line = row + 2;
        let record = record.map_err(|err| fail(format!("line {line}: {err}")))?;
        let cell = record
            .get(column_index)
            .map(str::trim)
            .unwrap_or_default();
        let stem = cell.split('.').next().unwrap_or_default();
        if stem.is_empty() {
            return Err(fail(format!("line {line}: no identifier in '{cell}'")));
        }
        if !seen.insert(stem.to_string()) {
            return Err(fail(format!("line {line}: duplicate identifier '{stem}'")));
        }
        ids.push(SampleId::new(stem));
    }

    if ids.is_empty() {
        return Err(fail("manifest has no rows".to_string()));
    }
    Ok(ids)
}

/// Permutes `ids` with a seeded RNG and carves off the first
/// `ceil(n * validation_fraction)` entries as the validation set.
pub fn split_identifiers(
    mut ids: Vec<SampleId>,
    validation_fraction: f64,
    seed: u64,
) -> Result<Split, TrainingError> {
    if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
        return Err(TrainingError::validation(vec![format!(
            "validation fraction must be in (0, 1) (got {validation_fraction})"
        )]));
    }

    let total = ids.len();
    let n_validation = (total as f64 * validation_fraction).ceil() as usize;
    if n_validation == 0 || n_validation >= total {
        return Err(TrainingError::validation(vec![format!(
            "cannot split {total} samples with validation fraction {validation_fraction}: \
             both sets must be non-empty"
        )]));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);
    let training = ids.split_off(n_validation);
    Ok(Split {
        training,
        validation: ids,
    })
}
