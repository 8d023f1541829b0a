//! The doublet collaborator.
//!
//! Doublet detection itself is out of scope: a [`DoubletClassifier`] hands back
//! one call per cell and the filterer only consumes the label.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use fxhash::FxHashMap;
use log::debug;

use scsketch_core::models::Sample;
use scsketch_core::utils::read_lines;
use scsketch_core::{Result, ScSketchError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DoubletLabel {
    #[default]
    Singlet,
    Doublet,
}

impl fmt::Display for DoubletLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoubletLabel::Singlet => write!(f, "singlet"),
            DoubletLabel::Doublet => write!(f, "doublet"),
        }
    }
}

impl FromStr for DoubletLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "singlet" => Ok(DoubletLabel::Singlet),
            "doublet" => Ok(DoubletLabel::Doublet),
            other => Err(format!("unknown doublet label `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DoubletCall {
    pub label: DoubletLabel,
    pub score: f64,
}

impl DoubletCall {
    pub fn singlet(score: f64) -> Self {
        Self {
            label: DoubletLabel::Singlet,
            score,
        }
    }

    pub fn doublet(score: f64) -> Self {
        Self {
            label: DoubletLabel::Doublet,
            score,
        }
    }

    pub fn is_doublet(&self) -> bool {
        self.label == DoubletLabel::Doublet
    }
}

///
/// Classifies every cell of a sample as singlet or doublet.
///
/// Implementations must return exactly one call per cell, in the sample's
/// row order.
///
pub trait DoubletClassifier: Send + Sync {
    fn classify(&self, sample: &Sample) -> Result<Vec<DoubletCall>>;
}

/// Calls every cell a singlet with score 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDoubletDetection;

impl DoubletClassifier for NoDoubletDetection {
    fn classify(&self, sample: &Sample) -> Result<Vec<DoubletCall>> {
        Ok(vec![DoubletCall::default(); sample.n_cells()])
    }
}

#[derive(Debug, Clone)]
enum StoredCalls {
    Positional(Vec<DoubletCall>),
    ByBarcode(FxHashMap<String, DoubletCall>),
}

///
/// Doublet calls computed ahead of time, per sample id.
///
/// Samples without stored calls are treated as all-singlet.
///
#[derive(Debug, Clone, Default)]
pub struct PrecomputedDoublets {
    calls: FxHashMap<String, StoredCalls>,
}

impl PrecomputedDoublets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls in the sample's row order.
    pub fn insert(&mut self, sample_id: &str, calls: Vec<DoubletCall>) {
        self.calls
            .insert(sample_id.to_string(), StoredCalls::Positional(calls));
    }

    ///
    /// Load calls for one sample from a `barcode<TAB>label<TAB>score` file
    /// (optionally gzip'd). A header line starting with `barcode` is skipped.
    ///
    pub fn load_tsv(&mut self, sample_id: &str, path: &Path) -> Result<()> {
        let parse_err = |reason: String| ScSketchError::Parse {
            path: path.display().to_string(),
            reason,
        };

        let mut calls = FxHashMap::default();
        for (n, line) in read_lines(path)?.iter().enumerate() {
            if n == 0 && line.starts_with("barcode") {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 2 {
                return Err(parse_err(format!("line {} has fewer than 2 fields", n + 1)));
            }
            let label = fields[1]
                .parse::<DoubletLabel>()
                .map_err(|e| parse_err(format!("line {}: {e}", n + 1)))?;
            let score = match fields.get(2) {
                Some(raw) => raw
                    .parse::<f64>()
                    .map_err(|e| parse_err(format!("line {}: {e}", n + 1)))?,
                None => 0.0,
            };
            calls.insert(fields[0].to_string(), DoubletCall { label, score });
        }

        debug!("loaded {} doublet calls for `{sample_id}`", calls.len());
        self.calls
            .insert(sample_id.to_string(), StoredCalls::ByBarcode(calls));
        Ok(())
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.calls.contains_key(sample_id)
    }
}

impl DoubletClassifier for PrecomputedDoublets {
    fn classify(&self, sample: &Sample) -> Result<Vec<DoubletCall>> {
        match self.calls.get(sample.id()) {
            None => NoDoubletDetection.classify(sample),
            Some(StoredCalls::Positional(calls)) => {
                if calls.len() != sample.n_cells() {
                    return Err(ScSketchError::sample_failure(
                        sample.id(),
                        Stage::Doublets,
                        format!(
                            "{} doublet calls for {} cells",
                            calls.len(),
                            sample.n_cells()
                        ),
                    ));
                }
                Ok(calls.clone())
            }
            Some(StoredCalls::ByBarcode(calls)) => sample
                .metadata()
                .barcodes
                .iter()
                .map(|barcode| {
                    calls.get(barcode).copied().ok_or_else(|| {
                        ScSketchError::sample_failure(
                            sample.id(),
                            Stage::Doublets,
                            format!("no doublet call for barcode `{barcode}`"),
                        )
                    })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use scsketch_core::matrix::InMemoryCounts;
    use scsketch_core::models::CellMetadata;
    use tempfile::NamedTempFile;

    #[fixture]
    fn sample() -> Sample {
        let counts = InMemoryCounts::from_dense(&[vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 3.0]])
            .unwrap();
        Sample::new(
            "s1",
            Arc::new(counts),
            vec!["A".into(), "B".into()],
            CellMetadata::with_barcodes(vec!["AAA".into(), "CCC".into(), "GGG".into()]),
        )
        .unwrap()
    }

    #[rstest]
    fn test_no_detection_is_all_singlets(sample: Sample) {
        let calls = NoDoubletDetection.classify(&sample).unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| !c.is_doublet()));
    }

    #[rstest]
    fn test_positional_calls(sample: Sample) {
        let mut doublets = PrecomputedDoublets::new();
        doublets.insert(
            "s1",
            vec![
                DoubletCall::singlet(0.1),
                DoubletCall::doublet(0.9),
                DoubletCall::singlet(0.2),
            ],
        );
        let calls = doublets.classify(&sample).unwrap();
        assert_eq!(
            calls.iter().map(|c| c.is_doublet()).collect::<Vec<_>>(),
            vec![false, true, false]
        );
    }

    #[rstest]
    fn test_wrong_length_is_sample_failure(sample: Sample) {
        let mut doublets = PrecomputedDoublets::new();
        doublets.insert("s1", vec![DoubletCall::singlet(0.0)]);
        assert!(doublets.classify(&sample).unwrap_err().is_sample_failure());
    }

    #[rstest]
    fn test_load_tsv_matches_barcodes(sample: Sample) {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "barcode\tlabel\tscore").unwrap();
        writeln!(file, "GGG\tDoublet\t0.8").unwrap();
        writeln!(file, "AAA\tsinglet\t0.05").unwrap();
        writeln!(file, "CCC\tsinglet\t0.1").unwrap();

        let mut doublets = PrecomputedDoublets::new();
        doublets.load_tsv("s1", file.path()).unwrap();
        let calls = doublets.classify(&sample).unwrap();

        assert_eq!(calls[0], DoubletCall::singlet(0.05));
        assert_eq!(calls[2], DoubletCall::doublet(0.8));
    }

    #[rstest]
    fn test_bad_label_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "AAA\tmaybe\t0.5").unwrap();

        let mut doublets = PrecomputedDoublets::new();
        let err = doublets.load_tsv("s1", file.path()).unwrap_err();
        assert!(matches!(err, ScSketchError::Parse { .. }));
    }

    #[rstest]
    fn test_unknown_sample_defaults_to_singlets(sample: Sample) {
        let doublets = PrecomputedDoublets::new();
        assert!(!doublets.contains("s1"));
        assert_eq!(doublets.classify(&sample).unwrap().len(), 3);
    }
}
