//! Rank-`r` factorization of a standardized sample and its leverage scores.

use faer::{Mat, MatRef};

use scsketch_core::Result;
use scsketch_core::consts::EIGENVALUE_EPSILON;
use scsketch_core::matrix::{DenseBlockSource, row_blocks};

use crate::linalg::{EigenParams, GramOperator, accumulate_product, product, top_eigenpairs};
use crate::scaler::FeatureScaler;

///
/// `A^T A` for the standardized rows `A` of a dense source, evaluated block by
/// block.
///
pub struct StandardizedGram<'a> {
    source: &'a dyn DenseBlockSource,
    scaler: &'a FeatureScaler,
    block_size: usize,
}

impl<'a> StandardizedGram<'a> {
    pub fn new(
        source: &'a dyn DenseBlockSource,
        scaler: &'a FeatureScaler,
        block_size: usize,
    ) -> Self {
        Self {
            source,
            scaler,
            block_size,
        }
    }

    fn standardized_block(&self, range: std::ops::Range<usize>) -> Result<Mat<f64>> {
        Ok(self.scaler.standardize(self.source.read_block(range)?))
    }
}

impl GramOperator for StandardizedGram<'_> {
    fn dim(&self) -> usize {
        self.source.ncols()
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Result<Mat<f64>> {
        let mut out = Mat::zeros(self.dim(), rhs.ncols());
        for range in row_blocks(self.source.nrows(), self.block_size) {
            let block = self.standardized_block(range)?;
            let projected = product(block.as_ref(), rhs);
            accumulate_product(&mut out, block.as_ref().transpose(), projected.as_ref());
        }
        Ok(out)
    }

    fn to_dense(&self) -> Result<Mat<f64>> {
        let p = self.dim();
        let mut gram = Mat::zeros(p, p);
        for range in row_blocks(self.source.nrows(), self.block_size) {
            let block = self.standardized_block(range)?;
            accumulate_product(&mut gram, block.as_ref().transpose(), block.as_ref());
        }
        Ok(gram)
    }
}

///
/// Truncated SVD `A ~ U S V^T` of one sample's standardized rows, keeping
/// only components with non-negligible singular values. `U` is never stored;
/// rows are re-projected on demand.
///
#[derive(Debug, Clone)]
pub struct Factorization {
    pub scaler: FeatureScaler,
    /// descending
    pub singular_values: Vec<f64>,
    /// `n_features x rank` right singular vectors
    pub components: Mat<f64>,
}

impl Factorization {
    ///
    /// Fit the scaler and the top `rank` components. Components whose squared
    /// singular value is below `EIGENVALUE_EPSILON` times the largest are
    /// dropped; the result has rank 0 for an all-constant sample.
    ///
    pub fn fit(
        source: &dyn DenseBlockSource,
        rank: usize,
        block_size: usize,
        params: &EigenParams,
    ) -> Result<Self> {
        let scaler = FeatureScaler::fit(source, block_size)?;
        let gram = StandardizedGram::new(source, &scaler, block_size);
        let pairs = top_eigenpairs(&gram, rank, params)?;

        let largest = pairs.values.first().copied().unwrap_or(0.0);
        let effective = pairs
            .values
            .iter()
            .take_while(|v| largest > 0.0 && **v > EIGENVALUE_EPSILON * largest)
            .count();

        let singular_values = pairs.values[..effective].iter().map(|v| v.sqrt()).collect();
        let components = Mat::from_fn(pairs.vectors.nrows(), effective, |i, j| {
            pairs.vectors[(i, j)]
        });

        Ok(Self {
            scaler,
            singular_values,
            components,
        })
    }

    /// Number of retained components.
    pub fn rank(&self) -> usize {
        self.singular_values.len()
    }

    /// Standardize a raw block and project it onto the components.
    pub fn project(&self, block: Mat<f64>) -> Mat<f64> {
        let block = self.scaler.standardize(block);
        product(block.as_ref(), self.components.as_ref())
    }
}

///
/// `lev_i = sum_k (a_i . v_k)^2 / sigma_k^2`, i.e. the squared row norms of
/// the left singular vectors. Each lies in `[0, 1]` and they sum to the rank.
///
pub fn leverage_scores(
    source: &dyn DenseBlockSource,
    factorization: &Factorization,
    block_size: usize,
) -> Result<Vec<f64>> {
    let inverse_sq: Vec<f64> = factorization
        .singular_values
        .iter()
        .map(|s| 1.0 / (s * s))
        .collect();

    let mut scores = Vec::with_capacity(source.nrows());
    for range in row_blocks(source.nrows(), block_size) {
        let projected = factorization.project(source.read_block(range)?);
        for i in 0..projected.nrows() {
            let lev: f64 = inverse_sq
                .iter()
                .enumerate()
                .map(|(k, w)| projected[(i, k)] * projected[(i, k)] * w)
                .sum();
            scores.push(lev);
        }
    }
    Ok(scores)
}

///
/// Mix leverage with the uniform distribution:
/// `p_i = (1 - alpha) * lev_i / sum(lev) + alpha / n`.
///
pub fn sampling_probabilities(leverage: &[f64], mix_alpha: f64) -> Vec<f64> {
    let n = leverage.len() as f64;
    let total: f64 = leverage.iter().sum();
    leverage
        .iter()
        .map(|lev| {
            let normalized = if total > 0.0 { lev / total } else { 1.0 / n };
            (1.0 - mix_alpha) * normalized + mix_alpha / n
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::*;

    use crate::test_utils::DenseRows;

    fn rows() -> DenseRows {
        DenseRows(Mat::from_fn(30, 6, |i, j| {
            ((i * 7 + j * 3) % 11) as f64 + if j == 2 { i as f64 } else { 0.0 }
        }))
    }

    #[rstest]
    #[case(3)]
    #[case(6)]
    fn test_leverage_sums_to_rank(#[case] rank: usize) {
        let source = rows();
        let factorization = Factorization::fit(&source, rank, 7, &EigenParams::default()).unwrap();
        let lev = leverage_scores(&source, &factorization, 4).unwrap();

        assert_eq!(lev.len(), 30);
        assert!(lev.iter().all(|l| *l >= 0.0 && *l <= 1.0 + 1e-9));
        let total: f64 = lev.iter().sum();
        assert!((total - factorization.rank() as f64).abs() < 1e-8);
    }

    #[rstest]
    fn test_constant_sample_has_rank_zero() {
        let source = DenseRows(Mat::from_fn(5, 3, |_, j| j as f64));
        let factorization = Factorization::fit(&source, 2, 2, &EigenParams::default()).unwrap();
        assert_eq!(factorization.rank(), 0);
    }

    #[rstest]
    fn test_probabilities() {
        let p = sampling_probabilities(&[3.0, 1.0, 0.0, 0.0], 0.2);
        let total: f64 = p.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((p[0] - (0.8 * 0.75 + 0.05)).abs() < 1e-12);
        assert!((p[2] - 0.05).abs() < 1e-12);

        let uniform = sampling_probabilities(&[3.0, 1.0], 1.0);
        assert_eq!(uniform, vec![0.5, 0.5]);
    }
}
