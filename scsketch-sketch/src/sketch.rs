use std::time::Duration;

use log::{debug, info};

use scsketch_core::consts::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_ITERATIONS, DEFAULT_MIX_ALPHA, DEFAULT_OVERSAMPLING,
    DEFAULT_SEED, DEFAULT_SKETCH_BUDGET, DEFAULT_SKETCH_RANK, DEFAULT_TOLERANCE,
    DENSE_EIGEN_THRESHOLD,
};
use scsketch_core::matrix::DenseBlockSource;
use scsketch_core::{Result, ScSketchError, Stage};

use crate::leverage::{Factorization, leverage_scores, sampling_probabilities};
use crate::linalg::EigenParams;
use crate::sampling::AResSampler;

///
/// The cells of one sample chosen for integration.
///
/// `indices` are sorted global indices into the merged dataset; `weights[i]`
/// is the inverse sampling probability of `indices[i]`.
///
#[derive(Debug, Clone)]
pub struct Sketch {
    pub sample_id: String,
    /// first global index of the sample
    pub offset: usize,
    /// cells in the sample
    pub n_cells: usize,
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
    pub factorization: Factorization,
}

impl Sketch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Sketch rows relative to the start of the sample.
    pub fn local_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().map(move |g| g - self.offset)
    }

    /// The same sketch for a sample that now starts at global index `offset`.
    pub fn rebased(&self, offset: usize) -> Sketch {
        Sketch {
            indices: self.local_indices().map(|l| l + offset).collect(),
            offset,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SketchOptions {
    pub budget: usize,
    pub rank: usize,
    pub mix_alpha: f64,
    pub seed: u64,
    pub block_size: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub oversampling: usize,
    pub timeout: Option<Duration>,
    pub dense_threshold: usize,
}

impl Default for SketchOptions {
    fn default() -> Self {
        Self {
            budget: DEFAULT_SKETCH_BUDGET,
            rank: DEFAULT_SKETCH_RANK,
            mix_alpha: DEFAULT_MIX_ALPHA,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            oversampling: DEFAULT_OVERSAMPLING,
            timeout: None,
            dense_threshold: DENSE_EIGEN_THRESHOLD,
        }
    }
}

///
/// Picks `min(budget, n)` cells of a sample by leverage score, mixed with the
/// uniform distribution.
///
#[derive(Debug, Clone, Default)]
pub struct LeverageSketchSampler {
    options: SketchOptions,
}

impl LeverageSketchSampler {
    pub fn new(options: SketchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SketchOptions {
        &self.options
    }

    /// RNG seed of the sample at position `ordinal` of the run.
    pub fn sample_seed(&self, ordinal: usize) -> u64 {
        self.options.seed.wrapping_add(ordinal as u64)
    }

    ///
    /// Sketch one sample.
    ///
    /// `source` holds the sample's normalized rows only; `offset` is the
    /// global index of its first row. Every error of this sample (unreadable
    /// rows, non-convergence, all-constant rows) is reported as a
    /// `SampleFailure` of the sketch stage.
    ///
    pub fn sketch(
        &self,
        source: &dyn DenseBlockSource,
        sample_id: &str,
        offset: usize,
        ordinal: usize,
    ) -> Result<Sketch> {
        let fail = |reason: String| ScSketchError::sample_failure(sample_id, Stage::Sketch, reason);
        let in_sample = |e: ScSketchError| match e {
            ScSketchError::SampleFailure { .. } => e,
            other => fail(other.to_string()),
        };
        let n = source.nrows();
        if n == 0 {
            return Err(fail("sample has no cells".to_string()));
        }

        let seed = self.sample_seed(ordinal);
        let params = EigenParams {
            max_iterations: self.options.max_iterations,
            tolerance: self.options.tolerance,
            oversampling: self.options.oversampling,
            timeout: self.options.timeout,
            dense_threshold: self.options.dense_threshold,
            seed,
        };

        let factorization =
            Factorization::fit(source, self.options.rank, self.options.block_size, &params)
                .map_err(in_sample)?;
        if factorization.rank() == 0 {
            return Err(fail("standardized matrix is all zero".to_string()));
        }

        let leverage = leverage_scores(source, &factorization, self.options.block_size)
            .map_err(in_sample)?;
        if leverage.iter().all(|l| *l <= 0.0) {
            return Err(fail("all leverage scores are zero".to_string()));
        }
        debug!(
            "sample `{sample_id}`: effective rank {}, leverage sum {:.3}",
            factorization.rank(),
            leverage.iter().sum::<f64>()
        );

        let probabilities = sampling_probabilities(&leverage, self.options.mix_alpha);
        let k = self.options.budget.min(n);
        let mut chosen = AResSampler::new(k, seed).sample_stream(0..n, |i| probabilities[*i]);
        chosen.sort_unstable();

        let weights = chosen
            .iter()
            .map(|&i| {
                if probabilities[i] > 0.0 {
                    1.0 / probabilities[i]
                } else {
                    n as f64
                }
            })
            .collect();

        info!(
            "sample `{sample_id}`: sketched {} of {n} cells (rank {})",
            chosen.len(),
            factorization.rank()
        );

        Ok(Sketch {
            sample_id: sample_id.to_string(),
            offset,
            n_cells: n,
            indices: chosen.into_iter().map(|i| i + offset).collect(),
            weights,
            factorization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::ops::Range;
    use std::sync::Arc;

    use faer::Mat;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use scsketch_core::matrix::{CountSource, InMemoryCounts};
    use sprs::CsMat;

    use crate::normalize::{NormalizationMethod, NormalizedAssayBuilder};
    use crate::test_utils::{DenseRows, clustered_rows};

    /// Counts whose backing file went away after the assay was fitted.
    struct UnreadableCounts {
        nrows: usize,
        ncols: usize,
    }

    impl CountSource for UnreadableCounts {
        fn nrows(&self) -> usize {
            self.nrows
        }

        fn ncols(&self) -> usize {
            self.ncols
        }

        fn read_rows(&self, _range: Range<usize>) -> Result<CsMat<f64>> {
            Err(ScSketchError::Io(std::io::Error::other("spill file truncated")))
        }
    }

    fn sampler(budget: usize, mix_alpha: f64) -> LeverageSketchSampler {
        LeverageSketchSampler::new(SketchOptions {
            budget,
            rank: 4,
            mix_alpha,
            block_size: 16,
            ..SketchOptions::default()
        })
    }

    #[rstest]
    #[case(25, 25)]
    #[case(500, 120)]
    fn test_sketch_size_and_uniqueness(#[case] budget: usize, #[case] expected: usize) {
        let source = clustered_rows(120, 8, 1);
        let sketch = sampler(budget, 0.1).sketch(&source, "s1", 1000, 0).unwrap();

        assert_eq!(sketch.len(), expected);
        let unique: HashSet<_> = sketch.indices.iter().collect();
        assert_eq!(unique.len(), expected);
        assert!(sketch.indices.windows(2).all(|w| w[0] < w[1]));
        assert!(sketch.indices.iter().all(|g| (1000..1120).contains(g)));
        assert_eq!(sketch.weights.len(), expected);
    }

    #[rstest]
    fn test_sketch_is_deterministic() {
        let source = clustered_rows(200, 8, 2);
        let a = sampler(30, 0.1).sketch(&source, "s1", 0, 3).unwrap();
        let b = sampler(30, 0.1).sketch(&source, "s1", 0, 3).unwrap();
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.weights, b.weights);
    }

    #[rstest]
    fn test_uniform_mix_gives_uniform_weights() {
        let source = clustered_rows(50, 6, 3);
        let sketch = sampler(10, 1.0).sketch(&source, "s1", 0, 0).unwrap();
        assert!(sketch.weights.iter().all(|w| (w - 50.0).abs() < 1e-9));
    }

    #[rstest]
    fn test_probability_is_monotone_in_leverage() {
        let source = clustered_rows(80, 6, 4);
        let options = sampler(10, 0.3).options().clone();
        let factorization = Factorization::fit(
            &source,
            options.rank,
            options.block_size,
            &EigenParams::default(),
        )
        .unwrap();
        let leverage = leverage_scores(&source, &factorization, 16).unwrap();
        let p = sampling_probabilities(&leverage, options.mix_alpha);

        assert!(leverage.iter().all(|l| *l >= 0.0));
        for i in 0..leverage.len() {
            for j in 0..leverage.len() {
                if leverage[i] < leverage[j] {
                    assert!(p[i] <= p[j]);
                }
            }
        }
    }

    #[rstest]
    fn test_constant_sample_fails() {
        let source = DenseRows(Mat::from_fn(20, 4, |_, _| 1.0));
        let err = sampler(5, 0.1).sketch(&source, "flat", 0, 0).unwrap_err();
        assert!(matches!(
            err,
            ScSketchError::SampleFailure { stage: Stage::Sketch, .. }
        ));
    }

    #[rstest]
    fn test_non_convergence_is_sample_failure() {
        let source = clustered_rows(60, 12, 5);
        let sampler = LeverageSketchSampler::new(SketchOptions {
            budget: 10,
            rank: 4,
            oversampling: 2,
            max_iterations: 1,
            dense_threshold: 0,
            block_size: 16,
            ..SketchOptions::default()
        });
        let err = sampler.sketch(&source, "slow", 0, 0).unwrap_err();
        assert!(err.is_sample_failure());
        assert!(err.to_string().contains("did not converge"));
    }

    #[rstest]
    fn test_unreadable_counts_are_sample_failure() {
        let rows: Vec<Vec<f64>> = (0..30)
            .map(|i| (0..5).map(|j| ((i * 7 + j * 3) % 5 + 1) as f64).collect())
            .collect();
        let names: Vec<String> = (0..5).map(|j| format!("G{j}")).collect();
        let assay = NormalizedAssayBuilder::new(NormalizationMethod::log_normalize(), 5, 16)
            .build(Arc::new(InMemoryCounts::from_dense(&rows).unwrap()), &names)
            .unwrap()
            .with_counts(Arc::new(UnreadableCounts { nrows: 30, ncols: 5 }))
            .unwrap();

        let view = assay.sample_view(0..30).unwrap();
        let err = sampler(5, 0.1).sketch(&view, "broken", 0, 0).unwrap_err();
        match err {
            ScSketchError::SampleFailure {
                sample,
                stage,
                reason,
            } => {
                assert_eq!(sample, "broken");
                assert_eq!(stage, Stage::Sketch);
                assert!(reason.contains("spill file truncated"));
            }
            other => panic!("expected a sample failure, got {other:?}"),
        }
    }

    #[rstest]
    fn test_rebased_keeps_local_rows() {
        let source = clustered_rows(40, 6, 6);
        let sketch = sampler(8, 0.1).sketch(&source, "s1", 100, 0).unwrap();
        let rebased = sketch.rebased(10);

        assert_eq!(
            rebased.local_indices().collect::<Vec<_>>(),
            sketch.local_indices().collect::<Vec<_>>()
        );
        assert_eq!(rebased.offset, 10);
        assert!(rebased.indices.iter().all(|g| (10..50).contains(g)));
    }
}
