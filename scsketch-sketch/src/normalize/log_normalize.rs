use faer::Mat;
use sprs::CsMat;

use scsketch_core::Result;
use scsketch_core::matrix::{CountSource, row_blocks};

use super::{FeatureModel, FeatureSelection, NormalizationStrategy};

///
/// Library-size normalization followed by `log1p`:
/// `log1p(x / total * scale_factor)`. Features are ranked by the variance of
/// the normalized values.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogNormalize {
    scale_factor: f64,
}

impl LogNormalize {
    pub fn new(scale_factor: f64) -> Self {
        Self { scale_factor }
    }

    fn value(&self, x: f64, total: f64) -> f64 {
        if total > 0.0 {
            (x / total * self.scale_factor).ln_1p()
        } else {
            0.0
        }
    }
}

impl NormalizationStrategy for LogNormalize {
    fn name(&self) -> &'static str {
        "log_normalize"
    }

    fn fit(&self, counts: &dyn CountSource, block_size: usize) -> Result<FeatureModel> {
        let p = counts.ncols();
        let mut sum = vec![0.0; p];
        let mut sum_sq = vec![0.0; p];

        for range in row_blocks(counts.nrows(), block_size) {
            let block = counts.read_rows(range)?;
            for row in block.outer_iterator() {
                let total: f64 = row.iter().map(|(_, v)| *v).sum();
                for (col, &x) in row.iter() {
                    let v = self.value(x, total);
                    sum[col] += v;
                    sum_sq[col] += v * v;
                }
            }
        }

        let n = counts.nrows().max(1) as f64;
        let scores = sum
            .iter()
            .zip(sum_sq.iter())
            .map(|(s, sq)| {
                let mean = s / n;
                (sq / n - mean * mean).max(0.0)
            })
            .collect();

        Ok(FeatureModel {
            n_cells: counts.nrows(),
            scores,
            params: Vec::new(),
        })
    }

    fn transform(
        &self,
        _model: &FeatureModel,
        block: &CsMat<f64>,
        selection: &FeatureSelection,
    ) -> Result<Mat<f64>> {
        let mut out = Mat::zeros(block.rows(), selection.len());
        for (i, row) in block.outer_iterator().enumerate() {
            let total: f64 = row.iter().map(|(_, v)| *v).sum();
            for (col, &x) in row.iter() {
                if let Some(pos) = selection.position(col) {
                    out[(i, pos)] = self.value(x, total);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use scsketch_core::matrix::InMemoryCounts;

    #[rstest]
    fn test_transform_values() {
        let counts = InMemoryCounts::from_dense(&[vec![1.0, 3.0], vec![0.0, 0.0]]).unwrap();
        let strategy = LogNormalize::new(4.0);
        let model = strategy.fit(&counts, 1).unwrap();
        let block = counts.read_rows(0..2).unwrap();
        let out = strategy
            .transform(&model, &block, &FeatureSelection::new(vec![1, 0], 2))
            .unwrap();

        // 3 / 4 * 4 = 3 and 1 / 4 * 4 = 1
        assert!((out[(0, 0)] - 3.0_f64.ln_1p()).abs() < 1e-12);
        assert!((out[(0, 1)] - 1.0_f64.ln_1p()).abs() < 1e-12);
        // empty cell
        assert_eq!(out[(1, 0)], 0.0);
    }

    #[rstest]
    fn test_scores_are_variances() {
        let counts = InMemoryCounts::from_dense(&[vec![1.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let model = LogNormalize::new(1.0).fit(&counts, 8).unwrap();

        // feature 0: log1p(0.5), log1p(1.0)
        let (a, b) = (0.5_f64.ln_1p(), 1.0_f64.ln_1p());
        let expected = ((a - b) / 2.0).powi(2);
        assert!((model.scores[0] - expected).abs() < 1e-12);
        // feature 1: log1p(0.5), 0
        let expected = (a / 2.0).powi(2);
        assert!((model.scores[1] - expected).abs() < 1e-12);
        assert_eq!(model.n_cells, 2);
    }
}
