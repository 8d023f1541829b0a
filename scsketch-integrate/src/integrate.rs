//! Cross-sample alignment of the sketches into one shared embedding.

use faer::Mat;
use log::{debug, error, info};

use scsketch_core::consts::{DEFAULT_BLOCK_SIZE, DEFAULT_INTEGRATION_DIMS};
use scsketch_core::matrix::DenseBlockSource;
use scsketch_core::{Result, ScSketchError, Stage};
use scsketch_sketch::Sketch;
use scsketch_sketch::linalg::{EigenParams, product};

use crate::cca::{cca, least_squares};

///
/// Affine map from a sample's normalized features to the shared space:
/// `((x - center) / scale) * weights`.
///
#[derive(Debug, Clone)]
pub struct SampleTransform {
    pub center: Vec<f64>,
    pub scale: Vec<f64>,
    /// `n_features x dims`
    pub weights: Mat<f64>,
}

impl SampleTransform {
    pub fn standardize(&self, mut block: Mat<f64>) -> Mat<f64> {
        for j in 0..block.ncols() {
            for i in 0..block.nrows() {
                block[(i, j)] = (block[(i, j)] - self.center[j]) / self.scale[j];
            }
        }
        block
    }

    pub fn apply(&self, block: Mat<f64>) -> Mat<f64> {
        let standardized = self.standardize(block);
        product(standardized.as_ref(), self.weights.as_ref())
    }

    pub fn dims(&self) -> usize {
        self.weights.ncols()
    }
}

///
/// One sample's part of the shared embedding.
///
#[derive(Debug, Clone)]
pub struct SharedSample {
    pub sample_id: String,
    /// sorted global indices of the sketch cells
    pub sketch_indices: Vec<usize>,
    /// standardized sketch rows, `sketch x n_features`
    pub features: Mat<f64>,
    /// `sketch x dims`
    pub coordinates: Mat<f64>,
    pub transform: SampleTransform,
}

///
/// Coordinates of all sketch cells in the shared space plus the per-sample
/// transforms that produced them. Samples are stored in merge order.
///
#[derive(Debug, Clone)]
pub struct SharedEmbedding {
    pub dims: usize,
    pub merge_order: Vec<String>,
    /// false when a single sample was embedded without alignment
    pub integrated: bool,
    pub samples: Vec<SharedSample>,
}

impl SharedEmbedding {
    pub fn sample(&self, id: &str) -> Option<&SharedSample> {
        self.samples.iter().find(|s| s.sample_id == id)
    }

    pub fn n_sketch_cells(&self) -> usize {
        self.samples.iter().map(|s| s.sketch_indices.len()).sum()
    }
}

///
/// Rows `indices` (sorted) of `source`, read in windows of `block_size`.
///
pub fn gather_rows(
    source: &dyn DenseBlockSource,
    indices: &[usize],
    block_size: usize,
) -> Result<Mat<f64>> {
    let mut out = Mat::zeros(indices.len(), source.ncols());
    let mut next = 0;
    while next < indices.len() {
        let start = indices[next];
        let end = (start + block_size.max(1)).min(source.nrows());
        let block = source.read_block(start..end)?;
        while next < indices.len() && indices[next] < end {
            for j in 0..block.ncols() {
                out[(next, j)] = block[(indices[next] - start, j)];
            }
            next += 1;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct IntegrationEngine {
    dims: usize,
    block_size: usize,
    params: EigenParams,
}

impl Default for IntegrationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INTEGRATION_DIMS, DEFAULT_BLOCK_SIZE, EigenParams::default())
    }
}

impl IntegrationEngine {
    pub fn new(dims: usize, block_size: usize, params: EigenParams) -> Self {
        Self {
            dims,
            block_size,
            params,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    ///
    /// Positions of `sketches` in merge order: sketch size descending, then
    /// sample id ascending. The first is the reference.
    ///
    pub fn merge_order(sketches: &[Sketch]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..sketches.len()).collect();
        order.sort_by(|a, b| {
            sketches[*b]
                .len()
                .cmp(&sketches[*a].len())
                .then_with(|| sketches[*a].sample_id.cmp(&sketches[*b].sample_id))
        });
        order
    }

    ///
    /// Align the sketches of all surviving samples.
    ///
    /// `assay` is the normalized assay indexed by global cell index. With a
    /// single sample no alignment is done: its own leading principal axes
    /// become the shared embedding.
    ///
    pub fn integrate(
        &self,
        assay: &dyn DenseBlockSource,
        sketches: &[Sketch],
    ) -> Result<SharedEmbedding> {
        if sketches.is_empty() {
            return Err(ScSketchError::NoSamplesRemaining(Stage::Integrate));
        }

        let order = Self::merge_order(sketches);
        let merge_order: Vec<String> = order
            .iter()
            .map(|i| sketches[*i].sample_id.clone())
            .collect();
        info!("integrate: merge order {}", merge_order.join(", "));

        let mut features = Vec::with_capacity(order.len());
        for &i in &order {
            let sketch = &sketches[i];
            let rows = gather_rows(assay, &sketch.indices, self.block_size)?;
            features.push(sketch.factorization.scaler.standardize(rows));
        }

        let weights = if order.len() == 1 {
            vec![self.principal_axes(&sketches[order[0]])]
        } else {
            self.align(&features, &merge_order)?
        };

        let samples = order
            .iter()
            .zip(features)
            .zip(weights)
            .map(|((&i, features), weights)| {
                let sketch = &sketches[i];
                let coordinates = product(features.as_ref(), weights.as_ref());
                SharedSample {
                    sample_id: sketch.sample_id.clone(),
                    sketch_indices: sketch.indices.clone(),
                    features,
                    coordinates,
                    transform: SampleTransform {
                        center: sketch.factorization.scaler.mean.clone(),
                        scale: sketch.factorization.scaler.scale.clone(),
                        weights,
                    },
                }
            })
            .collect();

        Ok(SharedEmbedding {
            dims: self.dims,
            merge_order,
            integrated: order.len() > 1,
            samples,
        })
    }

    /// Leading right singular vectors of the sample's factorization, padded
    /// with zero columns up to `dims`.
    fn principal_axes(&self, sketch: &Sketch) -> Mat<f64> {
        let components = &sketch.factorization.components;
        let kept = components.ncols().min(self.dims);
        let mut axes = Mat::zeros(components.nrows(), self.dims);
        for c in 0..kept {
            for j in 0..components.nrows() {
                axes[(j, c)] = components[(j, c)];
            }
        }
        info!(
            "integrate: single sample `{}`, using {kept} principal axes",
            sketch.sample_id
        );
        axes
    }

    ///
    /// Weights for every sample, in merge order. `features[0]` is the
    /// reference. The first reference/query pair defines the shared frame;
    /// every later pair is rotated into it by the map that carries the
    /// reference's coordinates of that pair onto its shared coordinates.
    /// `ids` names the samples of `features`.
    ///
    fn align(&self, features: &[Mat<f64>], ids: &[String]) -> Result<Vec<Mat<f64>>> {
        let reference = features[0].as_ref();
        let mut weights = Vec::with_capacity(features.len());
        let mut shared_reference: Option<Mat<f64>> = None;

        for (j, query) in features.iter().enumerate().skip(1) {
            let params = EigenParams {
                seed: self.params.seed.wrapping_add(j as u64),
                ..self.params
            };
            let pair = cca(reference, query.as_ref(), self.dims, &params).map_err(|e| {
                error!(
                    "integrate: CCA of `{}` against reference `{}` failed: {e}",
                    ids[j], ids[0]
                );
                e
            })?;
            debug!(
                "integrate: `{}` leading canonical value {:.4}",
                ids[j],
                pair.singular_values.first().copied().unwrap_or(0.0)
            );

            match &shared_reference {
                None => {
                    shared_reference = Some(product(reference, pair.reference.as_ref()));
                    weights.push(pair.reference);
                    weights.push(pair.query);
                }
                Some(target) => {
                    let own = product(reference, pair.reference.as_ref());
                    let rotation = least_squares(own.as_ref(), target.as_ref())?;
                    weights.push(product(pair.query.as_ref(), rotation.as_ref()));
                }
            }
        }

        Ok(weights)
    }
}
