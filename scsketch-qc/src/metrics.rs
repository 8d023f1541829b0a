//! Per-cell quality metrics (the metric store).

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView1};

use scsketch_core::matrix::row_blocks;
use scsketch_core::models::Sample;
use scsketch_core::{Result, ScSketchError, Stage};

/// Quality metric computed for every cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum Metric {
    TotalCounts,
    DetectedFeatures,
    PercentMito,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::TotalCounts,
        Metric::DetectedFeatures,
        Metric::PercentMito,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::TotalCounts => "total_counts",
            Metric::DetectedFeatures => "detected_features",
            Metric::PercentMito => "percent_mito",
        }
    }

    /// Closed domain `[floor, ceiling]` of the metric.
    pub fn domain(&self) -> (f64, Option<f64>) {
        match self {
            Metric::TotalCounts | Metric::DetectedFeatures => (0.0, None),
            Metric::PercentMito => (0.0, Some(100.0)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Metric {
    type Err = ScSketchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| ScSketchError::Configuration(format!("unknown metric `{s}`")))
    }
}

///
/// Raw metric values of one sample, cells x metrics.
///
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    pub sample_id: String,
    pub metrics: Vec<Metric>,
    pub values: Array2<f64>,
}

impl MetricTable {
    pub fn n_cells(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, metric: Metric) -> Option<ArrayView1<'_, f64>> {
        self.metrics
            .iter()
            .position(|m| *m == metric)
            .map(|j| self.values.column(j))
    }
}

///
/// Computes metric tables in one streaming pass over a sample's count blocks.
///
#[derive(Debug, Clone)]
pub struct MetricStore {
    metrics: Vec<Metric>,
    mito_prefixes: Vec<String>,
    block_size: usize,
}

impl MetricStore {
    pub fn new(metrics: Vec<Metric>, mito_prefixes: Vec<String>, block_size: usize) -> Self {
        Self {
            metrics,
            mito_prefixes,
            block_size,
        }
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn compute(&self, sample: &Sample) -> Result<MetricTable> {
        let counts = sample.counts();
        let mito_mask: Vec<bool> = sample
            .features()
            .iter()
            .map(|name| self.mito_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .collect();

        let mut values = Array2::<f64>::zeros((counts.nrows(), self.metrics.len()));

        for range in row_blocks(counts.nrows(), self.block_size) {
            let offset = range.start;
            let block = counts.read_rows(range).map_err(|e| {
                ScSketchError::sample_failure(sample.id(), Stage::Metrics, e)
            })?;

            for (i, row) in block.outer_iterator().enumerate() {
                let mut total = 0.0;
                let mut detected = 0.0;
                let mut mito = 0.0;
                for (col, &value) in row.iter() {
                    total += value;
                    if value > 0.0 {
                        detected += 1.0;
                    }
                    if mito_mask[col] {
                        mito += value;
                    }
                }

                for (j, metric) in self.metrics.iter().enumerate() {
                    values[[offset + i, j]] = match metric {
                        Metric::TotalCounts => total,
                        Metric::DetectedFeatures => detected,
                        Metric::PercentMito if total > 0.0 => 100.0 * mito / total,
                        Metric::PercentMito => 0.0,
                    };
                }
            }
        }

        Ok(MetricTable {
            sample_id: sample.id().to_string(),
            metrics: self.metrics.clone(),
            values,
        })
    }
}
