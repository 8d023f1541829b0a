//! Machine-readable summary of a run, written as `report.json`.

use serde::Serialize;

use scsketch_core::{ScSketchError, Stage};
use scsketch_qc::SampleThresholds;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailureEntry {
    pub sample_id: String,
    pub stage: Stage,
    pub reason: String,
}

impl SampleFailureEntry {
    /// `None` for errors that are not sample failures.
    pub fn from_error(err: &ScSketchError) -> Option<Self> {
        match err {
            ScSketchError::SampleFailure {
                sample,
                stage,
                reason,
            } => Some(Self {
                sample_id: sample.clone(),
                stage: *stage,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegenerateMetricEntry {
    pub sample_id: String,
    pub metric: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSummary {
    pub sample_id: String,
    pub n_cells: usize,
    pub kept: usize,
    /// `None` for samples that never reached the sketch stage
    pub sketch_size: Option<usize>,
    pub sketch_rank: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub version: String,
    pub seed: u64,
    pub normalization: String,
    pub selected_features: usize,
    pub samples: Vec<SampleSummary>,
    pub failures: Vec<SampleFailureEntry>,
    pub degenerate_metrics: Vec<DegenerateMetricEntry>,
    pub merged_cells: usize,
    pub merge_order: Vec<String>,
    pub integrated: bool,
    pub dims: usize,
}

impl RunReport {
    pub fn record_failure(&mut self, err: &ScSketchError) {
        if let Some(entry) = SampleFailureEntry::from_error(err) {
            self.failures.push(entry);
        }
    }

    pub fn record_degenerate(&mut self, thresholds: &SampleThresholds) {
        for metric in thresholds.degenerate_metrics() {
            self.degenerate_metrics.push(DegenerateMetricEntry {
                sample_id: thresholds.sample_id.clone(),
                metric: metric.to_string(),
            });
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
