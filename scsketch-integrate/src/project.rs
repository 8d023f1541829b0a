//! Propagation of the shared embedding from the sketch cells to every cell.

use std::ops::Range;

use faer::Mat;
use fxhash::FxHashMap;
use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

use scsketch_core::consts::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CONSISTENCY_TOLERANCE, DEFAULT_NEIGHBORS,
};
use scsketch_core::matrix::{DenseBlockSource, row_blocks};
use scsketch_core::{Result, ScSketchError, Stage};

use crate::integrate::{SharedEmbedding, SharedSample};

/// How non-sketch cells are placed in the shared space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "method", rename_all = "snake_case"))]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum ProjectionMethod {
    /// apply the sample's affine transform
    #[default]
    Linear,
    /// Gaussian-weighted mean of the `k` nearest sketch cells of the same sample
    Neighbors {
        #[cfg_attr(feature = "serde", serde(default = "default_neighbors"))]
        k: usize,
    },
}

#[cfg_attr(not(feature = "serde"), allow(dead_code))]
fn default_neighbors() -> usize {
    DEFAULT_NEIGHBORS
}

/// Rows of one sample in the merged dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpan {
    pub sample_id: String,
    pub rows: Range<usize>,
}

///
/// Shared-space coordinates of every merged cell, indexed by global index.
///
#[derive(Debug, Clone, PartialEq)]
pub struct FullEmbedding {
    pub coordinates: Array2<f64>,
}

impl FullEmbedding {
    pub fn n_cells(&self) -> usize {
        self.coordinates.nrows()
    }

    pub fn dims(&self) -> usize {
        self.coordinates.ncols()
    }

    pub fn row(&self, global: usize) -> ArrayView1<'_, f64> {
        self.coordinates.row(global)
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    method: ProjectionMethod,
    block_size: usize,
    consistency_tolerance: f64,
}

impl Default for ProjectionEngine {
    fn default() -> Self {
        Self::new(
            ProjectionMethod::Linear,
            DEFAULT_BLOCK_SIZE,
            DEFAULT_CONSISTENCY_TOLERANCE,
        )
    }
}

/// Relative deviation `||a - b|| / max(||b||, 1)`.
fn deviation(a: impl Iterator<Item = f64>, b: impl Iterator<Item = f64> + Clone) -> f64 {
    let norm_b = b.clone().map(|v| v * v).sum::<f64>().sqrt();
    let diff = a.zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt();
    diff / norm_b.max(1.0)
}

impl ProjectionEngine {
    pub fn new(method: ProjectionMethod, block_size: usize, consistency_tolerance: f64) -> Self {
        Self {
            method,
            block_size,
            consistency_tolerance,
        }
    }

    ///
    /// Project every row of `assay` into the shared space.
    ///
    /// Blocks are processed in parallel on the current rayon pool. Sketch cells
    /// always receive their shared coordinates; in linear mode the transform's
    /// value for them is checked against those coordinates first and a
    /// deviation above the tolerance is a `ConsistencyViolation`.
    ///
    pub fn project(
        &self,
        shared: &SharedEmbedding,
        assay: &dyn DenseBlockSource,
        spans: &[SampleSpan],
    ) -> Result<FullEmbedding> {
        let mut sketch_rows: FxHashMap<usize, usize> = FxHashMap::default();
        let mut tasks = Vec::new();
        for span in spans {
            let Some(sample) = shared.sample(&span.sample_id) else {
                return Err(ScSketchError::sample_failure(
                    &span.sample_id,
                    Stage::Project,
                    "sample has no shared transform",
                ));
            };
            for (row, global) in sample.sketch_indices.iter().enumerate() {
                sketch_rows.insert(*global, row);
            }
            for block in row_blocks(span.rows.len(), self.block_size) {
                tasks.push((sample, span.rows.start + block.start..span.rows.start + block.end));
            }
        }

        info!(
            "project: {} cells in {} blocks ({:?})",
            assay.nrows(),
            tasks.len(),
            self.method
        );

        let blocks: Vec<(Range<usize>, Mat<f64>)> = tasks
            .into_par_iter()
            .map(|(sample, range)| {
                let coords = self.project_block(sample, assay, range.clone(), &sketch_rows)?;
                Ok((range, coords))
            })
            .collect::<Result<_>>()?;

        let mut coordinates = Array2::zeros((assay.nrows(), shared.dims));
        for (range, coords) in blocks {
            for (i, global) in range.enumerate() {
                for c in 0..shared.dims {
                    coordinates[[global, c]] = coords[(i, c)];
                }
            }
        }

        Ok(FullEmbedding { coordinates })
    }

    fn project_block(
        &self,
        sample: &SharedSample,
        assay: &dyn DenseBlockSource,
        range: Range<usize>,
        sketch_rows: &FxHashMap<usize, usize>,
    ) -> Result<Mat<f64>> {
        let block = assay.read_block(range.clone())?;
        let mut coords = match self.method {
            ProjectionMethod::Linear => sample.transform.apply(block),
            ProjectionMethod::Neighbors { k } => {
                let standardized = sample.transform.standardize(block);
                neighbor_average(sample, &standardized, k)
            }
        };

        let dims = coords.ncols();
        for (i, global) in range.enumerate() {
            let Some(&row) = sketch_rows.get(&global) else {
                continue;
            };
            if self.method == ProjectionMethod::Linear {
                let dev = deviation(
                    (0..dims).map(|c| coords[(i, c)]),
                    (0..dims).map(|c| sample.coordinates[(row, c)]),
                );
                if dev > self.consistency_tolerance {
                    return Err(ScSketchError::ConsistencyViolation {
                        sample: sample.sample_id.clone(),
                        global_index: global,
                        deviation: dev,
                    });
                }
            }
            for c in 0..dims {
                coords[(i, c)] = sample.coordinates[(row, c)];
            }
        }
        debug!("project: block of `{}` done", sample.sample_id);

        Ok(coords)
    }
}

///
/// For every row of `standardized`: weighted mean of the shared coordinates
/// of its `k` nearest sketch cells, with weights `exp(-d^2 / h^2)` and `h` the
/// distance to the `k`-th neighbour.
///
fn neighbor_average(sample: &SharedSample, standardized: &Mat<f64>, k: usize) -> Mat<f64> {
    let n_sketch = sample.features.nrows();
    let dims = sample.coordinates.ncols();
    let k = k.min(n_sketch).max(1);
    let mut out = Mat::zeros(standardized.nrows(), dims);
    if n_sketch == 0 {
        return out;
    }

    let mut distances: Vec<(f64, usize)> = Vec::with_capacity(n_sketch);
    for i in 0..standardized.nrows() {
        distances.clear();
        for s in 0..n_sketch {
            let d2: f64 = (0..standardized.ncols())
                .map(|j| (standardized[(i, j)] - sample.features[(s, j)]).powi(2))
                .sum();
            distances.push((d2, s));
        }
        distances.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let nearest = &distances[..k];
        let bandwidth_sq = nearest.iter().map(|(d2, _)| *d2).fold(0.0, f64::max);

        let weights: Vec<f64> = nearest
            .iter()
            .map(|(d2, _)| {
                if bandwidth_sq > 0.0 {
                    (-d2 / bandwidth_sq).exp()
                } else {
                    1.0
                }
            })
            .collect();
        let total: f64 = weights.iter().sum();

        for ((_, s), w) in nearest.iter().zip(weights.iter()) {
            for c in 0..dims {
                out[(i, c)] += w / total * sample.coordinates[(*s, c)];
            }
        }
    }
    out
}
