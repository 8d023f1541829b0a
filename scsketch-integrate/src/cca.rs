//! Canonical correlation between two standardized sketches.
//!
//! For a reference `X` (`n_x x p`) and a query `Y` (`n_y x p`) the canonical
//! vectors are the singular vectors of `M = X Y^T`. `M M^T = X (Y^T Y) X^T`
//! is decomposed instead of `M`, so only `p x p` and `n_x x n_x` products are
//! ever formed.

use faer::{Mat, MatRef};

use scsketch_core::Result;
use scsketch_core::consts::EIGENVALUE_EPSILON;
use scsketch_sketch::linalg::{
    EigenParams, GramOperator, dense_eigenpairs, product, top_eigenpairs,
};

/// `X C X^T` with `C = Y^T Y`.
struct CrossGram<'a> {
    x: MatRef<'a, f64>,
    cov_y: MatRef<'a, f64>,
}

impl GramOperator for CrossGram<'_> {
    fn dim(&self) -> usize {
        self.x.nrows()
    }

    fn apply(&self, rhs: MatRef<'_, f64>) -> Result<Mat<f64>> {
        let xt_q = product(self.x.transpose(), rhs);
        let c_xt_q = product(self.cov_y, xt_q.as_ref());
        Ok(product(self.x, c_xt_q.as_ref()))
    }

    fn to_dense(&self) -> Result<Mat<f64>> {
        let xc = product(self.x, self.cov_y);
        Ok(product(xc.as_ref(), self.x.transpose()))
    }
}

///
/// Feature-space weights of one reference/query pair: `x * reference` and
/// `y * query` are the (scaled) canonical variates. Both are `p x k`.
///
#[derive(Debug, Clone)]
pub struct CcaPair {
    pub reference: Mat<f64>,
    pub query: Mat<f64>,
    /// singular values of `X Y^T`, descending, zero for padded components
    pub singular_values: Vec<f64>,
}

///
/// Top-`k` canonical weights of `x` against `y`:
/// `W_x = sqrt(n_x) Y^T V S^-1`, `W_y = sqrt(n_y) X^T U S^-1`.
///
/// Components with a negligible singular value (or beyond the rank of `M`)
/// are zero columns, so both weight matrices always have `k` columns.
///
pub fn cca(
    x: MatRef<'_, f64>,
    y: MatRef<'_, f64>,
    k: usize,
    params: &EigenParams,
) -> Result<CcaPair> {
    let p = x.ncols();
    let cov_y = product(y.transpose(), y);
    let op = CrossGram {
        x,
        cov_y: cov_y.as_ref(),
    };
    let pairs = top_eigenpairs(&op, k, params)?;

    let largest = pairs.values.first().copied().unwrap_or(0.0);
    let mut singular_values = vec![0.0; k];
    let mut u = Mat::zeros(x.nrows(), k);
    for c in 0..pairs.len() {
        let lambda = pairs.values[c];
        if largest <= 0.0 || lambda <= EIGENVALUE_EPSILON * largest {
            continue;
        }
        singular_values[c] = lambda.sqrt();
        for r in 0..x.nrows() {
            u[(r, c)] = pairs.vectors[(r, c)];
        }
    }

    // X^T U, shared by both weight matrices
    let xt_u = product(x.transpose(), u.as_ref());
    // Y^T V S^-1 = C X^T U S^-2
    let c_xt_u = product(cov_y.as_ref(), xt_u.as_ref());

    let sqrt_nx = (x.nrows() as f64).sqrt();
    let sqrt_ny = (y.nrows() as f64).sqrt();
    let mut reference = Mat::zeros(p, k);
    let mut query = Mat::zeros(p, k);
    for c in 0..k {
        let s = singular_values[c];
        if s == 0.0 {
            continue;
        }
        for j in 0..p {
            reference[(j, c)] = sqrt_nx * c_xt_u[(j, c)] / (s * s);
            query[(j, c)] = sqrt_ny * xt_u[(j, c)] / s;
        }
    }

    Ok(CcaPair {
        reference,
        query,
        singular_values,
    })
}

///
/// Least-squares `T` minimising `||a T - b||`, via the pseudo-inverse of
/// `a^T a`.
///
pub fn least_squares(a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> Result<Mat<f64>> {
    let k = a.ncols();
    let ata = product(a.transpose(), a);
    let atb = product(a.transpose(), b);

    let eig = dense_eigenpairs(ata.as_ref(), k)?;
    let largest = eig.values.first().copied().unwrap_or(0.0);
    let mut pinv = Mat::zeros(k, k);
    for c in 0..eig.len() {
        let lambda = eig.values[c];
        if largest <= 0.0 || lambda <= EIGENVALUE_EPSILON * largest {
            continue;
        }
        for i in 0..k {
            for j in 0..k {
                pinv[(i, j)] += eig.vectors[(i, c)] * eig.vectors[(j, c)] / lambda;
            }
        }
    }

    Ok(product(pinv.as_ref(), atb.as_ref()))
}
