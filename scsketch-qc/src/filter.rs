//! Keep/reject decisions and the merged dataset of kept cells.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use fxhash::FxHashMap;
use log::{info, warn};
use sprs::CsMat;

use scsketch_core::matrix::{CountSource, check_range};
use scsketch_core::models::Sample;
use scsketch_core::{Result, ScSketchError, Stage};

use crate::doublets::{DoubletCall, DoubletClassifier};
use crate::metrics::{Metric, MetricStore, MetricTable};
use crate::thresholds::{OutlierThresholder, SampleThresholds};

///
/// QC of a single sample: metric table, thresholds and doublet calls.
/// Computed independently for every sample.
///
#[derive(Debug, Clone)]
pub struct SampleQc {
    pub sample: Sample,
    pub metrics: MetricTable,
    pub thresholds: SampleThresholds,
    pub doublets: Vec<DoubletCall>,
}

impl SampleQc {
    pub fn compute(
        sample: Sample,
        store: &MetricStore,
        thresholder: &OutlierThresholder,
        classifier: &dyn DoubletClassifier,
    ) -> Result<Self> {
        let metrics = store.compute(&sample)?;
        let thresholds = thresholder.apply(&metrics)?;

        let doublets = classifier.classify(&sample).map_err(|e| match e {
            ScSketchError::SampleFailure { .. } => e,
            other => ScSketchError::sample_failure(sample.id(), Stage::Doublets, other),
        })?;
        if doublets.len() != sample.n_cells() {
            return Err(ScSketchError::sample_failure(
                sample.id(),
                Stage::Doublets,
                format!(
                    "classifier returned {} calls for {} cells",
                    doublets.len(),
                    sample.n_cells()
                ),
            ));
        }

        Ok(Self {
            sample,
            metrics,
            thresholds,
            doublets,
        })
    }

    pub fn keep(&self, cell: usize) -> bool {
        !self.thresholds.is_outlier(cell) && !self.doublets[cell].is_doublet()
    }

    /// Local indices of kept cells, ascending.
    pub fn kept_cells(&self) -> Vec<usize> {
        (0..self.sample.n_cells()).filter(|i| self.keep(*i)).collect()
    }
}

///
/// Audit record of one cell, kept or not.
///
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub sample_id: Arc<str>,
    pub local_index: usize,
    /// position in the merged dataset, `None` for rejected cells
    pub global_index: Option<usize>,
    pub keep: bool,
    pub doublet: DoubletCall,
    /// one flag per metric of [`FilterOutcome::metrics`]
    pub outlier: Vec<bool>,
    pub metric_values: Vec<f64>,
}

#[derive(Debug)]
pub struct FilterOutcome {
    pub merged: MergedDataset,
    /// every cell of every sample that reached the filter, samples sorted by id
    pub records: Vec<CellRecord>,
    pub thresholds: Vec<SampleThresholds>,
    pub metrics: Vec<Metric>,
    /// samples dropped for having no surviving cells
    pub failures: Vec<ScSketchError>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Filterer;

impl Filterer {
    ///
    /// Combine per-sample QC into keep flags and merge the kept cells.
    ///
    /// Samples are ordered by id. A sample without kept cells is dropped with a
    /// `SampleFailure`; no surviving sample at all is fatal.
    ///
    pub fn filter(&self, mut qcs: Vec<SampleQc>) -> Result<FilterOutcome> {
        qcs.sort_by(|a, b| a.sample.id().cmp(b.sample.id()));
        if let Some(dup) = qcs.windows(2).find(|w| w[0].sample.id() == w[1].sample.id()) {
            return Err(ScSketchError::Configuration(format!(
                "duplicate sample id `{}`",
                dup[0].sample.id()
            )));
        }

        let metrics = qcs
            .first()
            .map(|qc| qc.metrics.metrics.clone())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(qcs.iter().map(|qc| qc.sample.n_cells()).sum());
        let mut thresholds = Vec::with_capacity(qcs.len());
        let mut failures = Vec::new();
        let mut parts = Vec::with_capacity(qcs.len());
        let mut next_global = 0;

        for qc in qcs {
            let kept = qc.kept_cells();
            let sample_id: Arc<str> = Arc::from(qc.sample.id());
            info!(
                "sample `{}`: {} of {} cells kept",
                sample_id,
                kept.len(),
                qc.sample.n_cells()
            );

            let survives = !kept.is_empty();
            for local in 0..qc.sample.n_cells() {
                let keep = qc.keep(local);
                let global_index = (survives && keep).then(|| {
                    next_global += 1;
                    next_global - 1
                });
                records.push(CellRecord {
                    sample_id: Arc::clone(&sample_id),
                    local_index: local,
                    global_index,
                    keep,
                    doublet: qc.doublets[local],
                    outlier: qc.thresholds.flags.row(local).to_vec(),
                    metric_values: qc.metrics.values.row(local).to_vec(),
                });
            }

            if survives {
                parts.push((qc.sample, kept));
            } else {
                let failure =
                    ScSketchError::sample_failure(&sample_id, Stage::Filter, "no cells passed QC");
                warn!("{failure}");
                failures.push(failure);
            }
            thresholds.push(qc.thresholds);
        }

        if parts.is_empty() {
            return Err(ScSketchError::NoSamplesRemaining(Stage::Filter));
        }

        let merged = MergedDataset::new(parts)?;
        Ok(FilterOutcome {
            merged,
            records,
            thresholds,
            metrics,
            failures,
        })
    }
}

///
/// One sample's slice of the merged dataset.
///
#[derive(Clone)]
pub struct MergedSample {
    id: String,
    counts: Arc<dyn CountSource>,
    kept: Vec<usize>,
    local_to_merged: Vec<Option<usize>>,
    offset: usize,
}

impl MergedSample {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn n_cells(&self) -> usize {
        self.kept.len()
    }

    /// First global index of this sample.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn global_range(&self) -> Range<usize> {
        self.offset..self.offset + self.kept.len()
    }

    /// Row of each kept cell in the sample's own count matrix.
    pub fn local_indices(&self) -> &[usize] {
        &self.kept
    }

    fn append_rows(
        &self,
        range: Range<usize>,
        indptr: &mut Vec<usize>,
        indices: &mut Vec<usize>,
        data: &mut Vec<f64>,
    ) -> Result<()> {
        let kept = &self.kept[range];
        let (Some(&first), Some(&last)) = (kept.first(), kept.last()) else {
            return Ok(());
        };
        let block = self.counts.read_rows(first..last + 1)?;

        let mut row_entries = Vec::new();
        for &local in kept {
            row_entries.clear();
            if let Some(view) = block.outer_view(local - first) {
                row_entries.extend(
                    view.iter()
                        .filter_map(|(col, &v)| self.local_to_merged[col].map(|m| (m, v))),
                );
            }
            row_entries.sort_unstable_by_key(|(col, _)| *col);
            for (col, value) in row_entries.iter() {
                indices.push(*col);
                data.push(*value);
            }
            indptr.push(indices.len());
        }
        Ok(())
    }
}

impl fmt::Debug for MergedSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedSample")
            .field("id", &self.id)
            .field("n_cells", &self.kept.len())
            .field("offset", &self.offset)
            .finish()
    }
}

///
/// All kept cells of all surviving samples: samples sorted by id, then local
/// row order. Global index `g` is the `g`-th row of the merged count view.
///
/// The merged matrix is never materialised; [`CountSource::read_rows`] reads
/// the backing sample rows and remaps their columns onto the shared feature
/// space.
///
#[derive(Debug, Clone)]
pub struct MergedDataset {
    samples: Vec<MergedSample>,
    features: Vec<String>,
    n_cells: usize,
}

impl MergedDataset {
    ///
    /// Merge `(sample, kept local rows)` pairs. The feature space is the
    /// intersection of the samples' feature names, in the order of the first
    /// sample by id.
    ///
    pub fn new(mut parts: Vec<(Sample, Vec<usize>)>) -> Result<Self> {
        parts.sort_by(|a, b| a.0.id().cmp(b.0.id()));
        if let Some(dup) = parts.windows(2).find(|w| w[0].0.id() == w[1].0.id()) {
            return Err(ScSketchError::Configuration(format!(
                "duplicate sample id `{}`",
                dup[0].0.id()
            )));
        }
        let Some((first, _)) = parts.first() else {
            return Err(ScSketchError::NoSamplesRemaining(Stage::Filter));
        };

        let lookups: Vec<FxHashMap<&str, usize>> = parts
            .iter()
            .map(|(sample, _)| {
                let mut lookup = FxHashMap::default();
                for (j, name) in sample.features().iter().enumerate() {
                    lookup.entry(name.as_str()).or_insert(j);
                }
                lookup
            })
            .collect();

        let features: Vec<String> = first
            .features()
            .iter()
            .enumerate()
            .filter(|(j, name)| lookups[0].get(name.as_str()) == Some(j))
            .filter(|(_, name)| lookups.iter().all(|l| l.contains_key(name.as_str())))
            .map(|(_, name)| name.clone())
            .collect();

        if features.is_empty() {
            return Err(ScSketchError::DimensionMismatch(
                "samples share no feature names".to_string(),
            ));
        }

        let mut samples = Vec::with_capacity(parts.len());
        let mut offset = 0;
        for ((sample, kept), lookup) in parts.iter().zip(lookups.iter()) {
            if let Some(bad) = kept.iter().find(|i| **i >= sample.n_cells()) {
                return Err(ScSketchError::DimensionMismatch(format!(
                    "kept cell {bad} is outside sample `{}`",
                    sample.id()
                )));
            }
            if sample.n_features() != features.len() {
                info!(
                    "sample `{}`: {} of {} features are shared",
                    sample.id(),
                    features.len(),
                    sample.n_features()
                );
            }

            let mut local_to_merged = vec![None; sample.n_features()];
            for (m, name) in features.iter().enumerate() {
                if let Some(&local) = lookup.get(name.as_str()) {
                    local_to_merged[local] = Some(m);
                }
            }

            samples.push(MergedSample {
                id: sample.id().to_string(),
                counts: sample.shared_counts(),
                kept: kept.clone(),
                local_to_merged,
                offset,
            });
            offset += kept.len();
        }

        Ok(Self {
            samples,
            features,
            n_cells: offset,
        })
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn samples(&self) -> &[MergedSample] {
        &self.samples
    }

    pub fn sample(&self, id: &str) -> Option<&MergedSample> {
        self.samples.iter().find(|s| s.id == id)
    }

    pub fn sample_ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.id.clone()).collect()
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Owning sample and local row of a global index.
    pub fn sample_of(&self, global: usize) -> Option<(&MergedSample, usize)> {
        if global >= self.n_cells {
            return None;
        }
        let pos = self.samples.partition_point(|s| s.offset <= global) - 1;
        let sample = &self.samples[pos];
        Some((sample, sample.kept[global - sample.offset]))
    }

    ///
    /// The same feature space without the `excluded` samples; global indices
    /// are re-assigned. `None` when nothing would remain.
    ///
    pub fn without_samples(&self, excluded: &[String]) -> Option<Self> {
        let mut samples = Vec::with_capacity(self.samples.len());
        let mut offset = 0;
        for sample in self.samples.iter().filter(|s| !excluded.contains(&s.id)) {
            let mut sample = sample.clone();
            sample.offset = offset;
            offset += sample.kept.len();
            samples.push(sample);
        }

        (!samples.is_empty()).then(|| Self {
            samples,
            features: self.features.clone(),
            n_cells: offset,
        })
    }
}

impl CountSource for MergedDataset {
    fn nrows(&self) -> usize {
        self.n_cells
    }

    fn ncols(&self) -> usize {
        self.features.len()
    }

    fn read_rows(&self, range: Range<usize>) -> Result<CsMat<f64>> {
        check_range(&range, self.n_cells)?;
        let mut indptr = Vec::with_capacity(range.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);

        for sample in &self.samples {
            let rows = sample.global_range();
            let start = range.start.max(rows.start);
            let end = range.end.min(rows.end);
            if start >= end {
                continue;
            }
            sample.append_rows(
                (start - rows.start)..(end - rows.start),
                &mut indptr,
                &mut indices,
                &mut data,
            )?;
        }

        Ok(CsMat::new(
            (range.len(), self.features.len()),
            indptr,
            indices,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use scsketch_core::matrix::InMemoryCounts;
    use scsketch_core::models::CellMetadata;

    use crate::doublets::{NoDoubletDetection, PrecomputedDoublets};

    fn make_sample(id: &str, features: &[&str], rows: &[Vec<f64>]) -> Sample {
        Sample::new(
            id,
            Arc::new(InMemoryCounts::from_dense(rows).unwrap()),
            features.iter().map(|f| f.to_string()).collect(),
            CellMetadata::numbered(id, rows.len()),
        )
        .unwrap()
    }

    #[fixture]
    fn sample_a() -> Sample {
        make_sample(
            "a",
            &["g2", "g1"],
            &[vec![4.0, 6.0], vec![5.0, 5.0], vec![0.0, 10.0]],
        )
    }

    #[fixture]
    fn sample_b() -> Sample {
        let rows: Vec<Vec<f64>> = [118.0, 119.0, 120.0, 121.0, 122.0, 300.0]
            .iter()
            .map(|t| vec![t - 1.0, 1.0, 0.0])
            .collect();
        make_sample("b", &["g1", "g2", "g3"], &rows)
    }

    fn qc(sample: Sample, classifier: &dyn DoubletClassifier) -> SampleQc {
        let store = MetricStore::new(vec![Metric::TotalCounts], vec![], 4);
        SampleQc::compute(sample, &store, &OutlierThresholder::new(3.0, false), classifier)
            .unwrap()
    }

    #[fixture]
    fn outcome(sample_a: Sample, sample_b: Sample) -> FilterOutcome {
        let mut doublets = PrecomputedDoublets::new();
        let mut calls = vec![DoubletCall::singlet(0.1); 6];
        calls[1] = DoubletCall::doublet(0.9);
        doublets.insert("b", calls);

        // deliberately out of id order
        Filterer
            .filter(vec![qc(sample_b, &doublets), qc(sample_a, &doublets)])
            .unwrap()
    }

    #[rstest]
    fn test_keep_flags(outcome: FilterOutcome) {
        let keep: Vec<bool> = outcome.records.iter().map(|r| r.keep).collect();
        assert_eq!(
            keep,
            vec![true, true, true, true, false, true, true, true, false]
        );
        assert!(outcome.failures.is_empty());
    }

    #[rstest]
    fn test_global_indices_follow_sample_then_local_order(outcome: FilterOutcome) {
        let globals: Vec<Option<usize>> =
            outcome.records.iter().map(|r| r.global_index).collect();
        assert_eq!(
            globals,
            vec![
                Some(0),
                Some(1),
                Some(2),
                Some(3),
                None,
                Some(4),
                Some(5),
                Some(6),
                None
            ]
        );
        assert_eq!(outcome.merged.n_cells(), 7);
        assert_eq!(outcome.merged.sample_ids(), vec!["a", "b"]);

        let (sample, local) = outcome.merged.sample_of(4).unwrap();
        assert_eq!((sample.id(), local), ("b", 2));
        assert!(outcome.merged.sample_of(7).is_none());
    }

    #[rstest]
    fn test_merged_rows_are_remapped(outcome: FilterOutcome) {
        let merged = &outcome.merged;
        assert_eq!(merged.features(), &["g2".to_string(), "g1".to_string()]);
        assert_eq!(merged.ncols(), 2);

        let block = merged.read_rows(2..5).unwrap();
        assert_eq!(block.rows(), 3);
        // a2: g2 = 0, g1 = 10
        assert_eq!(block.get(0, 0), None);
        assert_eq!(block.get(0, 1), Some(&10.0));
        // b0 and b2 (b1 is a doublet)
        assert_eq!(block.get(1, 0), Some(&1.0));
        assert_eq!(block.get(1, 1), Some(&117.0));
        assert_eq!(block.get(2, 1), Some(&119.0));
    }

    #[rstest]
    fn test_without_samples_reindexes(outcome: FilterOutcome) {
        let rest = outcome.merged.without_samples(&["a".to_string()]).unwrap();
        assert_eq!(rest.n_cells(), 4);
        assert_eq!(rest.sample("b").unwrap().offset(), 0);
        assert_eq!(rest.features(), outcome.merged.features());

        let block = rest.read_rows(0..1).unwrap();
        assert_eq!(block.get(0, 1), Some(&117.0));

        assert!(
            outcome
                .merged
                .without_samples(&["a".to_string(), "b".to_string()])
                .is_none()
        );
    }

    #[rstest]
    fn test_sample_without_survivors_is_dropped(sample_a: Sample, sample_b: Sample) {
        let mut doublets = PrecomputedDoublets::new();
        doublets.insert("a", vec![DoubletCall::doublet(1.0); 3]);

        let outcome = Filterer
            .filter(vec![qc(sample_a, &doublets), qc(sample_b, &NoDoubletDetection)])
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            &outcome.failures[0],
            ScSketchError::SampleFailure { sample, stage: Stage::Filter, .. } if sample == "a"
        ));
        assert_eq!(outcome.merged.sample_ids(), vec!["b"]);
        assert_eq!(outcome.merged.n_cells(), 5);
        assert_eq!(outcome.records.len(), 9);
        assert!(outcome.records[..3].iter().all(|r| r.global_index.is_none()));
    }

    #[rstest]
    fn test_no_survivors_is_fatal(sample_a: Sample) {
        let mut doublets = PrecomputedDoublets::new();
        doublets.insert("a", vec![DoubletCall::doublet(1.0); 3]);
        let err = Filterer.filter(vec![qc(sample_a, &doublets)]).unwrap_err();
        assert!(matches!(err, ScSketchError::NoSamplesRemaining(Stage::Filter)));
    }

    #[rstest]
    fn test_duplicate_ids_are_rejected(sample_a: Sample) {
        let err = Filterer
            .filter(vec![
                qc(sample_a.clone(), &NoDoubletDetection),
                qc(sample_a, &NoDoubletDetection),
            ])
            .unwrap_err();
        assert!(matches!(err, ScSketchError::Configuration(_)));
    }

    #[rstest]
    fn test_disjoint_features_are_fatal() {
        let x = make_sample("x", &["g1"], &[vec![1.0]]);
        let y = make_sample("y", &["g9"], &[vec![1.0]]);
        let err = MergedDataset::new(vec![(x, vec![0]), (y, vec![0])]).unwrap_err();
        assert!(matches!(err, ScSketchError::DimensionMismatch(_)));
    }
}
