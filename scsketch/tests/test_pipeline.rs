//! End-to-end runs of the pipeline on synthetic samples.
//!
//! Every sample has 1000 cells of three cell types over 57 genes plus three
//! mitochondrial genes. Normal cells have a bounded spread of library sizes,
//! so only the injected outliers (counts x3) exceed the upper
//! `total_counts` bound. Doublets are supplied as precomputed calls.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rstest::*;

use scsketch::config::PipelineConfig;
use scsketch::core::matrix::{DenseBlockSource, InMemoryCounts};
use scsketch::core::models::{CellMetadata, Sample};
use scsketch::core::utils::read_lines;
use scsketch::core::{ScSketchError, Stage};
use scsketch::output::OutputWriter;
use scsketch::qc::{DoubletCall, PrecomputedDoublets};
use scsketch::{Pipeline, PipelineResult};

const N_CELLS: usize = 1000;
const N_GENES: usize = 57;

fn feature_names() -> Vec<String> {
    (0..N_GENES)
        .map(|j| format!("G{j}"))
        .chain((1..=3).map(|k| format!("MT-{k}")))
        .collect()
}

fn is_outlier(i: usize, n_outliers: usize) -> bool {
    i % 10 == 3 && i / 10 < n_outliers
}

fn is_doublet(i: usize, n_doublets: usize) -> bool {
    i % 10 == 5 && i / 10 < n_doublets
}

fn cell_counts(s: usize, i: usize, outlier: bool) -> Vec<f64> {
    let cell_type = i % 3;
    let mut row: Vec<f64> = (0..N_GENES)
        .map(|j| {
            let base = if j % 3 == cell_type { 8 } else { 2 };
            let noise = (i * 31 + j * 17 + s * 5) % 3;
            let batch = usize::from(j % 4 == s);
            let extra = if j == i % N_GENES { i % 21 } else { 0 };
            (base + noise + batch + extra) as f64
        })
        .collect();
    row.extend([(1 + i % 5) as f64, 1.0, 0.0]);

    if outlier {
        row.iter_mut().for_each(|v| *v *= 3.0);
    }
    row
}

/// Sample `s{s}` with `n_outliers` inflated cells.
fn sample(s: usize, n_outliers: usize) -> Sample {
    let rows: Vec<Vec<f64>> = (0..N_CELLS)
        .map(|i| cell_counts(s, i, is_outlier(i, n_outliers)))
        .collect();
    let id = format!("s{s}");
    Sample::new(
        id.as_str(),
        Arc::new(InMemoryCounts::from_dense(&rows).unwrap()),
        feature_names(),
        CellMetadata::numbered(&id, N_CELLS),
    )
    .unwrap()
}

/// 100 identical cells: nothing to factorize.
fn flat_sample() -> Sample {
    let mut row = vec![3.0; N_GENES];
    row.extend([1.0, 1.0, 0.0]);
    let rows = vec![row; 100];
    Sample::new(
        "a_flat",
        Arc::new(InMemoryCounts::from_dense(&rows).unwrap()),
        feature_names(),
        CellMetadata::numbered("a_flat", 100),
    )
    .unwrap()
}

fn doublet_calls(n_doublets: usize) -> Vec<DoubletCall> {
    (0..N_CELLS)
        .map(|i| match is_doublet(i, n_doublets) {
            true => DoubletCall::doublet(0.9),
            false => DoubletCall::singlet(0.1),
        })
        .collect()
}

#[fixture]
fn config() -> PipelineConfig {
    PipelineConfig {
        sketch_budget: 200,
        sketch_rank: 10,
        integration_dims: 5,
        n_features: 50,
        block_size: 256,
        threads: Some(2),
        ..PipelineConfig::default()
    }
}

/// s0 loses 30 outliers + 20 doublets, s1 60 + 40, s2 30 + 0.
fn three_samples(config: PipelineConfig) -> PipelineResult {
    let mut doublets = PrecomputedDoublets::new();
    doublets.insert("s0", doublet_calls(20));
    doublets.insert("s1", doublet_calls(40));

    Pipeline::new(config)
        .unwrap()
        .with_doublets(Arc::new(doublets))
        .run(vec![sample(2, 30), sample(0, 30), sample(1, 60)])
        .unwrap()
}

fn kept(result: &PipelineResult, sample_id: &str) -> usize {
    result
        .records
        .iter()
        .filter(|r| &*r.sample_id == sample_id && r.keep)
        .count()
}

#[rstest]
fn test_three_samples_end_to_end(config: PipelineConfig) {
    let result = three_samples(config);

    assert_eq!(kept(&result, "s0"), 950);
    assert_eq!(kept(&result, "s1"), 900);
    assert_eq!(kept(&result, "s2"), 970);
    assert_eq!(result.merged.n_cells(), 2820);
    assert_eq!(result.merged.sample_ids(), vec!["s0", "s1", "s2"]);

    for sketch in &result.sketches {
        assert_eq!(sketch.len(), 200);
        assert!(sketch.indices.windows(2).all(|w| w[0] < w[1]));
    }

    assert_eq!(result.embedding.n_cells(), 2820);
    assert_eq!(result.embedding.dims(), 5);
    assert!(result.shared.integrated);
    assert_eq!(result.shared.merge_order, vec!["s0", "s1", "s2"]);

    // sketch cells carry their shared coordinates
    for sample in &result.shared.samples {
        for (row, global) in sample.sketch_indices.iter().enumerate() {
            for c in 0..5 {
                assert_eq!(
                    result.embedding.row(*global)[c],
                    sample.coordinates[(row, c)]
                );
            }
        }
    }

    // constant detected_features is degenerate everywhere and never filters
    assert_eq!(result.report.degenerate_metrics.len(), 3);
    assert!(result
        .report
        .degenerate_metrics
        .iter()
        .all(|d| d.metric == "detected_features"));
    assert!(result.report.failures.is_empty());
    assert_eq!(result.report.merged_cells, 2820);
}

#[rstest]
fn test_outlier_flags_match_injected_cells(config: PipelineConfig) {
    let result = three_samples(config);
    let total_counts = result
        .metrics
        .iter()
        .position(|m| m.to_string() == "total_counts")
        .unwrap();

    for record in result.records.iter().filter(|r| &*r.sample_id == "s1") {
        assert_eq!(
            record.outlier[total_counts],
            is_outlier(record.local_index, 60)
        );
        assert_eq!(record.doublet.is_doublet(), is_doublet(record.local_index, 40));
        assert_eq!(record.keep, record.global_index.is_some());
    }
}

#[rstest]
fn test_runs_are_deterministic(config: PipelineConfig) {
    let a = three_samples(config.clone());
    let b = three_samples(config);

    assert_eq!(a.records, b.records);
    for (x, y) in a.sketches.iter().zip(b.sketches.iter()) {
        assert_eq!(x.indices, y.indices);
        assert_eq!(x.weights, y.weights);
    }
    assert_eq!(a.embedding, b.embedding);
}

#[rstest]
fn test_single_sample_skips_integration(config: PipelineConfig) {
    let result = Pipeline::new(config)
        .unwrap()
        .run(vec![sample(0, 30)])
        .unwrap();

    assert!(!result.shared.integrated);
    assert_eq!(result.merged.n_cells(), 970);
    assert_eq!(result.embedding.n_cells(), 970);

    // the embedding is the sample's own principal-axis projection
    let factorization = &result.sketches[0].factorization;
    let block = result.assay.read_block(0..970).unwrap();
    let own = factorization.project(block);
    let dims = factorization.rank().min(5);
    for i in (0..970).step_by(37) {
        for c in 0..dims {
            assert!((result.embedding.row(i)[c] - own[(i, c)]).abs() < 1e-9);
        }
    }
}

#[rstest]
fn test_failed_sample_is_excluded(config: PipelineConfig) {
    let result = Pipeline::new(config)
        .unwrap()
        .run(vec![flat_sample(), sample(0, 30), sample(1, 60)])
        .unwrap();

    assert_eq!(result.report.failures.len(), 1);
    assert_eq!(result.report.failures[0].sample_id, "a_flat");
    assert_eq!(result.report.failures[0].stage, Stage::Sketch);

    assert_eq!(result.merged.sample_ids(), vec!["s0", "s1"]);
    assert_eq!(result.merged.n_cells(), 970 + 940);
    assert_eq!(result.embedding.n_cells(), 1910);

    // the excluded sample's cells lose their global index, the rest are re-based
    assert!(result
        .records
        .iter()
        .filter(|r| &*r.sample_id == "a_flat")
        .all(|r| r.global_index.is_none()));
    let first_s0 = result
        .records
        .iter()
        .filter(|r| &*r.sample_id == "s0")
        .find_map(|r| r.global_index);
    assert_eq!(first_s0, Some(0));
    assert_eq!(result.sketches[0].offset, 0);
    assert_eq!(result.sketches[1].offset, 970);
}

#[rstest]
fn test_ingest_failures_are_reported(config: PipelineConfig) {
    let lost = ScSketchError::sample_failure("s9", Stage::Ingest, "spill file not writable");
    let result = Pipeline::new(config)
        .unwrap()
        .with_ingest_failures(&[lost])
        .run(vec![sample(0, 30)])
        .unwrap();

    assert_eq!(result.merged.sample_ids(), vec!["s0"]);
    assert_eq!(result.report.failures.len(), 1);
    assert_eq!(result.report.failures[0].sample_id, "s9");
    assert_eq!(result.report.failures[0].stage, Stage::Ingest);
}

#[rstest]
fn test_no_samples_is_fatal(config: PipelineConfig) {
    let err = Pipeline::new(config).unwrap().run(vec![]).unwrap_err();
    assert!(matches!(err, ScSketchError::NoSamplesRemaining(Stage::Filter)));
}

#[rstest]
fn test_invalid_config_is_rejected(config: PipelineConfig) {
    let config = PipelineConfig {
        integration_dims: 20,
        ..config
    };
    assert!(matches!(
        Pipeline::new(config),
        Err(ScSketchError::Configuration(_))
    ));
}

#[rstest]
fn test_outputs_written(config: PipelineConfig) {
    let result = three_samples(config);
    let dir = tempfile::tempdir().unwrap();
    let written = OutputWriter::new(true, false)
        .write(&result, dir.path())
        .unwrap();
    assert_eq!(written.len(), 5);

    let embedding = read_lines(&dir.path().join("embedding.tsv.gz")).unwrap();
    assert_eq!(embedding.len(), 2821);
    assert_eq!(embedding[0], "global_index\tdim_1\tdim_2\tdim_3\tdim_4\tdim_5");

    let cells = read_lines(&dir.path().join("cells.tsv.gz")).unwrap();
    assert_eq!(cells.len(), 3001);

    let sketch = read_lines(&dir.path().join("sketch.tsv.gz")).unwrap();
    assert_eq!(sketch.len(), 601);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(report["merged_cells"], 2820);
    assert_eq!(report["merge_order"].as_array().unwrap().len(), 3);
}
