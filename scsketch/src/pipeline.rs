//! The end-to-end run: QC, merge, normalize, sketch, integrate, project.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use scsketch_core::models::Sample;
use scsketch_core::{Result, ScSketchError, Stage};
use scsketch_integrate::{
    FullEmbedding, IntegrationEngine, ProjectionEngine, SampleSpan, SharedEmbedding,
};
use scsketch_qc::{
    CellRecord, DoubletClassifier, FilterOutcome, Filterer, MergedDataset, Metric, MetricStore,
    NoDoubletDetection, OutlierThresholder, SampleQc, SampleThresholds,
};
use scsketch_sketch::{LeverageSketchSampler, NormalizedAssay, NormalizedAssayBuilder, Sketch};

use crate::config::PipelineConfig;
use crate::report::{RunReport, SampleFailureEntry, SampleSummary};

///
/// Everything a run produces. Samples excluded along the way appear in
/// `records` and `report` but not in the merged data or the embeddings.
///
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// audit record of every cell that reached the filter, samples sorted by id
    pub records: Vec<CellRecord>,
    pub metrics: Vec<Metric>,
    pub thresholds: Vec<SampleThresholds>,
    pub merged: MergedDataset,
    pub assay: NormalizedAssay,
    pub sketches: Vec<Sketch>,
    pub shared: SharedEmbedding,
    pub embedding: FullEmbedding,
    pub report: RunReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    classifier: Arc<dyn DoubletClassifier>,
    ingest_failures: Vec<SampleFailureEntry>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: Arc::new(NoDoubletDetection),
            ingest_failures: Vec::new(),
        })
    }

    pub fn with_doublets(mut self, classifier: Arc<dyn DoubletClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Samples lost before the run; they are carried into the report.
    pub fn with_ingest_failures(mut self, failures: &[ScSketchError]) -> Self {
        self.ingest_failures = failures
            .iter()
            .filter_map(SampleFailureEntry::from_error)
            .collect();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    ///
    /// Run every stage over `samples` on a dedicated thread pool.
    ///
    pub fn run(&self, samples: Vec<Sample>) -> Result<PipelineResult> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(threads) = self.config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build().map_err(|e| {
            ScSketchError::Configuration(format!("can't start the worker pool: {e}"))
        })?;

        pool.install(|| self.run_stages(samples))
    }

    fn run_stages(&self, samples: Vec<Sample>) -> Result<PipelineResult> {
        let config = &self.config;
        let mut report = RunReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            seed: config.seed,
            failures: self.ingest_failures.clone(),
            ..RunReport::default()
        };

        let n_input = samples.len();
        info!("running on {n_input} samples");
        let qcs = self.quality_control(samples, &mut report)?;

        let FilterOutcome {
            merged,
            mut records,
            thresholds,
            metrics,
            failures,
        } = Filterer.filter(qcs)?;
        for failure in &failures {
            report.record_failure(failure);
        }
        for sample in &thresholds {
            report.record_degenerate(sample);
        }
        summarize_records(&records, &mut report);

        let assay = NormalizedAssayBuilder::new(
            config.normalization.clone(),
            config.n_features,
            config.block_size,
        )
        .build(Arc::new(merged.clone()), merged.features())?;
        report.normalization = assay.strategy_name().to_string();
        report.selected_features = assay.feature_names().len();

        let (merged, assay, sketches) = self.sketch_samples(merged, assay, &mut records, &mut report)?;

        let shared = IntegrationEngine::new(
            config.integration_dims,
            config.block_size,
            config.eigen_params(),
        )
        .integrate(&assay, &sketches)?;

        let spans: Vec<SampleSpan> = merged
            .samples()
            .iter()
            .map(|s| SampleSpan {
                sample_id: s.id().to_string(),
                rows: s.global_range(),
            })
            .collect();
        let embedding = ProjectionEngine::new(
            config.projection,
            config.block_size,
            config.consistency_tolerance,
        )
        .project(&shared, &assay, &spans)?;

        report.merged_cells = merged.n_cells();
        report.merge_order = shared.merge_order.clone();
        report.integrated = shared.integrated;
        report.dims = shared.dims;
        report.samples.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));
        info!(
            "done: {} of {n_input} samples, {} cells embedded in {} dims",
            merged.samples().len(),
            embedding.n_cells(),
            embedding.dims()
        );

        Ok(PipelineResult {
            records,
            metrics,
            thresholds,
            merged,
            assay,
            sketches,
            shared,
            embedding,
            report,
        })
    }

    fn progress(&self, len: usize, stage: Stage) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg} {pos}/{len}")
        {
            pb.set_style(style);
        }
        pb.set_message(stage.to_string());
        pb
    }

    ///
    /// Metrics, thresholds and doublet calls of every sample, in parallel.
    /// Samples that fail are excluded and reported; any other error aborts.
    ///
    fn quality_control(&self, samples: Vec<Sample>, report: &mut RunReport) -> Result<Vec<SampleQc>> {
        let config = &self.config;
        let store = MetricStore::new(
            config.metrics.clone(),
            config.mito_prefixes.clone(),
            config.block_size,
        );
        let thresholder = OutlierThresholder::new(config.outlier_k, config.two_sided);
        let pb = self.progress(samples.len(), Stage::Metrics);

        let results: Vec<(String, usize, Result<SampleQc>)> = samples
            .into_par_iter()
            .map(|sample| {
                let id = sample.id().to_string();
                let n_cells = sample.n_cells();
                let qc = SampleQc::compute(sample, &store, &thresholder, self.classifier.as_ref());
                pb.inc(1);
                (id, n_cells, qc)
            })
            .collect();
        pb.finish_and_clear();

        let mut qcs = Vec::with_capacity(results.len());
        for (sample_id, n_cells, result) in results {
            match result {
                Ok(qc) => qcs.push(qc),
                Err(e) if e.is_sample_failure() => {
                    warn!("{e}");
                    report.record_failure(&e);
                    report.samples.push(SampleSummary {
                        sample_id,
                        n_cells,
                        kept: 0,
                        sketch_size: None,
                        sketch_rank: None,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(qcs)
    }

    ///
    /// Sketch every merged sample in parallel. When samples fail, the merged
    /// dataset and the assay are rebuilt without them and the surviving
    /// sketches and cell records are re-indexed.
    ///
    fn sketch_samples(
        &self,
        merged: MergedDataset,
        assay: NormalizedAssay,
        records: &mut [CellRecord],
        report: &mut RunReport,
    ) -> Result<(MergedDataset, NormalizedAssay, Vec<Sketch>)> {
        let sampler = LeverageSketchSampler::new(self.config.sketch_options());
        let pb = self.progress(merged.samples().len(), Stage::Sketch);

        let results: Vec<Result<Sketch>> = merged
            .samples()
            .par_iter()
            .enumerate()
            .map(|(ordinal, sample)| {
                let view = assay
                    .sample_view(sample.global_range())
                    .map_err(|e| ScSketchError::sample_failure(sample.id(), Stage::Sketch, e))?;
                let sketch = sampler.sketch(&view, sample.id(), sample.offset(), ordinal);
                pb.inc(1);
                sketch
            })
            .collect();
        pb.finish_and_clear();

        let mut sketches = Vec::with_capacity(results.len());
        let mut excluded = Vec::new();
        for (sample, result) in merged.samples().iter().zip(results) {
            match result {
                Ok(sketch) => sketches.push(sketch),
                Err(e) if e.is_sample_failure() => {
                    warn!("{e}");
                    report.record_failure(&e);
                    excluded.push(sample.id().to_string());
                }
                Err(e) => return Err(e),
            }
        }

        for sketch in &sketches {
            if let Some(summary) = report
                .samples
                .iter_mut()
                .find(|s| s.sample_id == sketch.sample_id)
            {
                summary.sketch_size = Some(sketch.len());
                summary.sketch_rank = Some(sketch.factorization.rank());
            }
        }

        if excluded.is_empty() {
            return Ok((merged, assay, sketches));
        }

        let reduced = merged
            .without_samples(&excluded)
            .ok_or(ScSketchError::NoSamplesRemaining(Stage::Sketch))?;
        info!(
            "excluded {} samples after sketching, {} cells remain",
            excluded.len(),
            reduced.n_cells()
        );
        let assay = assay.with_counts(Arc::new(reduced.clone()))?;
        let sketches = sketches
            .into_iter()
            .map(|sketch| match reduced.sample(&sketch.sample_id) {
                Some(sample) => sketch.rebased(sample.offset()),
                None => sketch,
            })
            .collect();
        reindex_records(records, &merged, &reduced);

        Ok((reduced, assay, sketches))
    }
}

/// Per-sample cell and keep counts, in record order.
fn summarize_records(records: &[CellRecord], report: &mut RunReport) {
    for record in records {
        let known = report
            .samples
            .last()
            .is_some_and(|s| s.sample_id == *record.sample_id);
        if !known {
            report.samples.push(SampleSummary {
                sample_id: record.sample_id.to_string(),
                n_cells: 0,
                kept: 0,
                sketch_size: None,
                sketch_rank: None,
            });
        }
        if let Some(summary) = report.samples.last_mut() {
            summary.n_cells += 1;
            summary.kept += usize::from(record.keep);
        }
    }
}

/// Move global indices from `before` to `after`; cells of dropped samples lose theirs.
fn reindex_records(records: &mut [CellRecord], before: &MergedDataset, after: &MergedDataset) {
    for record in records.iter_mut() {
        let Some(global) = record.global_index else {
            continue;
        };
        let old = before.sample(&record.sample_id).map(|s| s.offset());
        let new = after.sample(&record.sample_id).map(|s| s.offset());
        record.global_index = match (old, new) {
            (Some(old), Some(new)) => Some(global - old + new),
            _ => None,
        };
    }
}
