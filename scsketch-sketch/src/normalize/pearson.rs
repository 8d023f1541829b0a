use faer::Mat;
use sprs::CsMat;

use scsketch_core::Result;
use scsketch_core::matrix::{CountSource, row_blocks};

use super::{FeatureModel, FeatureSelection, NormalizationStrategy};

///
/// Analytic Pearson residuals under a negative binomial null model with a
/// shared overdispersion `theta`:
///
/// `mu = total * p_j`, `z = (x - mu) / sqrt(mu + mu^2 / theta)`, clipped to
/// `[-clip, clip]` (default `sqrt(n_cells)`).
///
/// `p_j` is the fraction of all counts that fall on feature `j`; features are
/// ranked by residual variance.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PearsonResiduals {
    theta: f64,
    clip: Option<f64>,
}

impl PearsonResiduals {
    pub fn new(theta: f64, clip: Option<f64>) -> Self {
        Self { theta, clip }
    }

    fn clip_for(&self, n_cells: usize) -> f64 {
        self.clip.unwrap_or((n_cells as f64).sqrt())
    }

    fn residual(&self, x: f64, mu: f64, clip: f64) -> f64 {
        if mu <= 0.0 {
            return 0.0;
        }
        let z = (x - mu) / (mu + mu * mu / self.theta).sqrt();
        z.clamp(-clip, clip)
    }

    /// Residuals of one row over the features `cols`, dense.
    fn residual_row(
        &self,
        row: sprs::CsVecView<'_, f64>,
        proportions: &[f64],
        clip: f64,
        mut emit: impl FnMut(usize, f64),
        cols: impl Iterator<Item = usize>,
        dense: &mut [f64],
    ) {
        let total: f64 = row.iter().map(|(_, v)| *v).sum();
        for (col, &x) in row.iter() {
            dense[col] = x;
        }
        for col in cols {
            emit(col, self.residual(dense[col], total * proportions[col], clip));
        }
        for (col, _) in row.iter() {
            dense[col] = 0.0;
        }
    }
}

impl NormalizationStrategy for PearsonResiduals {
    fn name(&self) -> &'static str {
        "pearson_residuals"
    }

    fn fit(&self, counts: &dyn CountSource, block_size: usize) -> Result<FeatureModel> {
        let p = counts.ncols();
        let n_cells = counts.nrows();

        let mut column_sums = vec![0.0; p];
        for range in row_blocks(n_cells, block_size) {
            let block = counts.read_rows(range)?;
            for row in block.outer_iterator() {
                for (col, &x) in row.iter() {
                    column_sums[col] += x;
                }
            }
        }
        let grand_total: f64 = column_sums.iter().sum();
        let proportions: Vec<f64> = column_sums
            .iter()
            .map(|s| if grand_total > 0.0 { s / grand_total } else { 0.0 })
            .collect();

        let clip = self.clip_for(n_cells);
        let mut sum = vec![0.0; p];
        let mut sum_sq = vec![0.0; p];
        let mut dense = vec![0.0; p];
        for range in row_blocks(n_cells, block_size) {
            let block = counts.read_rows(range)?;
            for row in block.outer_iterator() {
                self.residual_row(
                    row,
                    &proportions,
                    clip,
                    |col, z| {
                        sum[col] += z;
                        sum_sq[col] += z * z;
                    },
                    0..p,
                    &mut dense,
                );
            }
        }

        let n = n_cells.max(1) as f64;
        let scores = sum
            .iter()
            .zip(sum_sq.iter())
            .map(|(s, sq)| {
                let mean = s / n;
                (sq / n - mean * mean).max(0.0)
            })
            .collect();

        Ok(FeatureModel {
            n_cells,
            scores,
            params: proportions,
        })
    }

    fn transform(
        &self,
        model: &FeatureModel,
        block: &CsMat<f64>,
        selection: &FeatureSelection,
    ) -> Result<Mat<f64>> {
        let clip = self.clip_for(model.n_cells);
        let mut out = Mat::zeros(block.rows(), selection.len());
        let mut dense = vec![0.0; block.cols()];

        for (i, row) in block.outer_iterator().enumerate() {
            self.residual_row(
                row,
                &model.params,
                clip,
                |col, z| {
                    if let Some(pos) = selection.position(col) {
                        out[(i, pos)] = z;
                    }
                },
                selection.columns().iter().copied(),
                &mut dense,
            );
        }
        Ok(out)
    }
}
