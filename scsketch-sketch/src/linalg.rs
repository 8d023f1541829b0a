//! Truncated eigendecompositions of symmetric positive semi-definite
//! operators that are only available implicitly, through block products.
//!
//! Small operators are materialised and decomposed densely; large ones go
//! through randomized subspace iteration with Rayleigh-Ritz extraction, which
//! only ever needs `op * Q` for a thin `Q`.

use std::time::{Duration, Instant};

use faer::linalg::matmul::matmul;
use faer::{Accum, Mat, MatRef, Par, Side};
use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use scsketch_core::consts::{
    DEFAULT_MAX_ITERATIONS, DEFAULT_OVERSAMPLING, DEFAULT_SEED, DEFAULT_TOLERANCE,
    DENSE_EIGEN_THRESHOLD,
};
use scsketch_core::{Result, ScSketchError};

/// A symmetric PSD `dim x dim` matrix known through its action.
pub trait GramOperator: Sync {
    fn dim(&self) -> usize;

    /// `self * rhs` for a `dim x m` right-hand side.
    fn apply(&self, rhs: MatRef<'_, f64>) -> Result<Mat<f64>>;

    /// The full matrix. Only called when `dim` is at most the dense threshold.
    fn to_dense(&self) -> Result<Mat<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EigenParams {
    pub max_iterations: usize,
    /// relative change of the leading Ritz values that counts as converged
    pub tolerance: f64,
    pub oversampling: usize,
    pub timeout: Option<Duration>,
    pub dense_threshold: usize,
    pub seed: u64,
}

impl Default for EigenParams {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            oversampling: DEFAULT_OVERSAMPLING,
            timeout: None,
            dense_threshold: DENSE_EIGEN_THRESHOLD,
            seed: DEFAULT_SEED,
        }
    }
}

/// Eigenvalues in descending order with matching unit eigenvector columns.
#[derive(Debug, Clone)]
pub struct Eigenpairs {
    pub values: Vec<f64>,
    pub vectors: Mat<f64>,
}

impl Eigenpairs {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn product(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Mat<f64> {
    let mut out = Mat::zeros(lhs.nrows(), rhs.ncols());
    matmul(out.as_mut(), Accum::Replace, lhs, rhs, 1.0, Par::Seq);
    out
}

/// `acc += lhs * rhs`
pub fn accumulate_product(acc: &mut Mat<f64>, lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) {
    matmul(acc.as_mut(), Accum::Add, lhs, rhs, 1.0, Par::Seq);
}

///
/// Top-`k` eigenpairs of `op`.
///
/// Fails with `NonConvergence` when subspace iteration exhausts its iteration
/// or time budget.
///
pub fn top_eigenpairs(
    op: &dyn GramOperator,
    k: usize,
    params: &EigenParams,
) -> Result<Eigenpairs> {
    let n = op.dim();
    if n == 0 || k == 0 {
        return Ok(Eigenpairs {
            values: Vec::new(),
            vectors: Mat::zeros(n, 0),
        });
    }

    if n <= params.dense_threshold || k + params.oversampling >= n {
        let mut dense = op.to_dense()?;
        symmetrize(&mut dense);
        return dense_eigenpairs(dense.as_ref(), k);
    }

    subspace_iteration(op, k, params)
}

///
/// Top-`k` eigenpairs of a dense symmetric matrix, sign-normalised.
///
pub fn dense_eigenpairs(matrix: MatRef<'_, f64>, k: usize) -> Result<Eigenpairs> {
    let n = matrix.nrows();
    let eig = matrix.self_adjoint_eigen(Side::Lower).map_err(|err| {
        debug!("dense eigendecomposition failed: {err:?}");
        ScSketchError::NonConvergence {
            iterations: 0,
            change: f64::NAN,
        }
    })?;

    let diag = eig.S();
    let basis = eig.U();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| diag[*b].total_cmp(&diag[*a]).then(a.cmp(b)));

    let keep = k.min(n);
    let mut values = Vec::with_capacity(keep);
    let mut vectors = Mat::zeros(n, keep);
    for (out, &src) in order[..keep].iter().enumerate() {
        values.push(diag[src].max(0.0));
        for row in 0..n {
            vectors[(row, out)] = basis[(row, src)];
        }
    }
    sign_normalize(&mut vectors);

    Ok(Eigenpairs { values, vectors })
}

fn subspace_iteration(
    op: &dyn GramOperator,
    k: usize,
    params: &EigenParams,
) -> Result<Eigenpairs> {
    let n = op.dim();
    let width = (k + params.oversampling).min(n);
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut q = Mat::zeros(n, width);
    fill_gaussian(&mut q, 0..width, &mut rng);
    orthonormalize(&mut q, &mut rng);

    let started = Instant::now();
    let mut previous: Option<Vec<f64>> = None;
    let mut change = f64::INFINITY;

    for iteration in 1..=params.max_iterations {
        let z = op.apply(q.as_ref())?;
        let mut h = product(q.as_ref().transpose(), z.as_ref());
        symmetrize(&mut h);
        let ritz = dense_eigenpairs(h.as_ref(), width)?;

        if let Some(prev) = &previous {
            let scale = ritz.values[0].abs().max(f64::MIN_POSITIVE);
            change = (0..k.min(width))
                .map(|i| (ritz.values[i] - prev[i]).abs() / scale)
                .fold(0.0, f64::max);
            debug!("subspace iteration {iteration}: relative change {change:.3e}");

            if change < params.tolerance {
                let keep = k.min(width);
                let mut vectors = product(q.as_ref(), ritz.vectors.as_ref().subcols(0, keep));
                sign_normalize(&mut vectors);
                return Ok(Eigenpairs {
                    values: ritz.values[..keep].to_vec(),
                    vectors,
                });
            }
        }

        if params.timeout.is_some_and(|limit| started.elapsed() > limit) {
            return Err(ScSketchError::NonConvergence {
                iterations: iteration,
                change,
            });
        }

        previous = Some(ritz.values);
        q = z;
        orthonormalize(&mut q, &mut rng);
    }

    Err(ScSketchError::NonConvergence {
        iterations: params.max_iterations,
        change,
    })
}

fn fill_gaussian(m: &mut Mat<f64>, cols: std::ops::Range<usize>, rng: &mut StdRng) {
    for j in cols {
        for i in 0..m.nrows() {
            let z: f64 = StandardNormal.sample(rng);
            m[(i, j)] = z;
        }
    }
}

fn column_dot(m: &Mat<f64>, a: usize, b: usize) -> f64 {
    (0..m.nrows()).map(|r| m[(r, a)] * m[(r, b)]).sum()
}

///
/// Modified Gram-Schmidt with one re-orthogonalization pass. Columns that are
/// numerically dependent on their predecessors are redrawn at random; if that
/// fails too they are zeroed.
///
pub fn orthonormalize(m: &mut Mat<f64>, rng: &mut StdRng) {
    let n = m.nrows();
    for j in 0..m.ncols() {
        let mut accepted = false;
        for attempt in 0..3 {
            if attempt > 0 {
                fill_gaussian(m, j..j + 1, rng);
            }
            let before = column_dot(m, j, j).sqrt();
            for _ in 0..2 {
                for i in 0..j {
                    let dot = column_dot(m, i, j);
                    for r in 0..n {
                        let v = m[(r, i)];
                        m[(r, j)] -= dot * v;
                    }
                }
            }
            let norm = column_dot(m, j, j).sqrt();
            if norm > 1e-10 * before && norm > 0.0 {
                for r in 0..n {
                    m[(r, j)] /= norm;
                }
                accepted = true;
                break;
            }
        }
        if !accepted {
            for r in 0..n {
                m[(r, j)] = 0.0;
            }
        }
    }
}

/// Flip each column so that its largest-magnitude entry is positive.
pub fn sign_normalize(vectors: &mut Mat<f64>) {
    for j in 0..vectors.ncols() {
        let mut pivot = 0.0_f64;
        for i in 0..vectors.nrows() {
            if vectors[(i, j)].abs() > pivot.abs() {
                pivot = vectors[(i, j)];
            }
        }
        if pivot < 0.0 {
            for i in 0..vectors.nrows() {
                vectors[(i, j)] = -vectors[(i, j)];
            }
        }
    }
}

/// Replace `m` by `(m + m^T) / 2`.
pub fn symmetrize(m: &mut Mat<f64>) {
    for i in 0..m.nrows() {
        for j in 0..i {
            let mean = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = mean;
            m[(j, i)] = mean;
        }
    }
}
