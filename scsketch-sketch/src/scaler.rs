use faer::Mat;

use scsketch_core::Result;
use scsketch_core::matrix::{DenseBlockSource, row_blocks};

///
/// Per-feature centring and scaling fitted in one streaming pass.
///
/// Constant features get scale 1 so they standardize to zero.
///
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    pub fn fit(source: &dyn DenseBlockSource, block_size: usize) -> Result<Self> {
        let p = source.ncols();
        let mut mean = vec![0.0; p];
        let mut m2 = vec![0.0; p];
        let mut seen = 0usize;

        // Welford, one row at a time
        for range in row_blocks(source.nrows(), block_size) {
            let block = source.read_block(range)?;
            for i in 0..block.nrows() {
                seen += 1;
                let n = seen as f64;
                for j in 0..p {
                    let x = block[(i, j)];
                    let delta = x - mean[j];
                    mean[j] += delta / n;
                    m2[j] += delta * (x - mean[j]);
                }
            }
        }

        let scale = m2
            .iter()
            .map(|s| {
                let sd = if seen > 1 {
                    (s / (seen - 1) as f64).sqrt()
                } else {
                    0.0
                };
                if sd > 0.0 && sd.is_finite() { sd } else { 1.0 }
            })
            .collect();

        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn standardize_in_place(&self, block: &mut Mat<f64>) {
        for j in 0..block.ncols() {
            let (mean, scale) = (self.mean[j], self.scale[j]);
            for i in 0..block.nrows() {
                block[(i, j)] = (block[(i, j)] - mean) / scale;
            }
        }
    }

    pub fn standardize(&self, mut block: Mat<f64>) -> Mat<f64> {
        self.standardize_in_place(&mut block);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ops::Range;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use scsketch_core::matrix::check_range;

    struct Rows(Vec<Vec<f64>>);

    impl DenseBlockSource for Rows {
        fn nrows(&self) -> usize {
            self.0.len()
        }

        fn ncols(&self) -> usize {
            self.0[0].len()
        }

        fn read_block(&self, range: Range<usize>) -> Result<Mat<f64>> {
            check_range(&range, self.0.len())?;
            Ok(Mat::from_fn(range.len(), self.ncols(), |i, j| {
                self.0[range.start + i][j]
            }))
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(16)]
    fn test_fit_is_block_size_independent(#[case] block_size: usize) {
        let rows = Rows(vec![
            vec![1.0, 5.0],
            vec![2.0, 5.0],
            vec![3.0, 5.0],
            vec![4.0, 5.0],
        ]);
        let scaler = FeatureScaler::fit(&rows, block_size).unwrap();

        assert!((scaler.mean[0] - 2.5).abs() < 1e-12);
        assert!((scaler.scale[0] - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(scaler.mean[1], 5.0);
        // constant feature
        assert_eq!(scaler.scale[1], 1.0);
    }

    #[rstest]
    fn test_standardize() {
        let rows = Rows(vec![vec![0.0, 1.0], vec![2.0, 1.0]]);
        let scaler = FeatureScaler::fit(&rows, 8).unwrap();
        let block = scaler.standardize(rows.read_block(0..2).unwrap());

        let sd = 2.0_f64.sqrt();
        assert!((block[(0, 0)] + 1.0 / sd).abs() < 1e-12);
        assert!((block[(1, 0)] - 1.0 / sd).abs() < 1e-12);
        assert_eq!(block[(0, 1)], 0.0);
    }
}
