//! Normalization and leverage-score sketching for scsketch.
//!
//! The [`NormalizedAssayBuilder`] turns merged raw counts into a lazily
//! evaluated [`NormalizedAssay`]; the [`LeverageSketchSampler`] factorizes one
//! sample's rows at a time through block products ([`linalg`]) and draws a
//! weighted subsample with the A-Res reservoir ([`sampling`]).

pub mod leverage;
pub mod linalg;
pub mod normalize;
pub mod sampling;
pub mod scaler;
pub mod sketch;

pub use leverage::Factorization;
pub use normalize::{
    FeatureModel, FeatureSelection, NormalizationMethod, NormalizationStrategy, NormalizedAssay,
    NormalizedAssayBuilder,
};
pub use scaler::FeatureScaler;
pub use sketch::{LeverageSketchSampler, Sketch, SketchOptions};

#[cfg(test)]
pub(crate) mod test_utils {
    use std::ops::Range;

    use faer::Mat;
    use rand::prelude::*;
    use scsketch_core::Result;
    use scsketch_core::matrix::{DenseBlockSource, check_range};

    pub struct DenseRows(pub Mat<f64>);

    impl DenseBlockSource for DenseRows {
        fn nrows(&self) -> usize {
            self.0.nrows()
        }

        fn ncols(&self) -> usize {
            self.0.ncols()
        }

        fn read_block(&self, range: Range<usize>) -> Result<Mat<f64>> {
            check_range(&range, self.0.nrows())?;
            Ok(Mat::from_fn(range.len(), self.0.ncols(), |i, j| {
                self.0[(range.start + i, j)]
            }))
        }
    }

    /// Three noisy clusters, cell `i` in cluster `i % 3`.
    pub fn clustered_rows(n: usize, p: usize, seed: u64) -> DenseRows {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers: Vec<Vec<f64>> = (0..3)
            .map(|_| (0..p).map(|_| rng.random::<f64>() * 5.0).collect())
            .collect();
        let mut m = Mat::zeros(n, p);
        for i in 0..n {
            for j in 0..p {
                m[(i, j)] = centers[i % 3][j] + rng.random::<f64>() - 0.5;
            }
        }
        DenseRows(m)
    }
}
