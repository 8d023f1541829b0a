use std::ops::Range;

use sprs::{CsMat, TriMat};

use super::{CountSource, check_range};
use crate::errors::{Result, ScSketchError};

///
/// Count matrix held in memory as CSR, rows = cells.
///
#[derive(Debug, Clone)]
pub struct InMemoryCounts {
    matrix: CsMat<f64>,
}

impl InMemoryCounts {
    pub fn new(matrix: CsMat<f64>) -> Self {
        let matrix = if matrix.is_csr() {
            matrix
        } else {
            matrix.to_csr()
        };
        Self { matrix }
    }

    ///
    /// Build from `(row, col, value)` triplets; duplicates are summed.
    ///
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self> {
        let mut tri = TriMat::new((nrows, ncols));
        for (row, col, value) in triplets {
            if row >= nrows || col >= ncols {
                return Err(ScSketchError::DimensionMismatch(format!(
                    "entry ({row}, {col}) is outside a {nrows} x {ncols} matrix"
                )));
            }
            tri.add_triplet(row, col, value);
        }
        Ok(Self::new(tri.to_csr()))
    }

    /// Dense rows, mostly useful for tests and small fixtures.
    pub fn from_dense(rows: &[Vec<f64>]) -> Result<Self> {
        let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != ncols) {
            return Err(ScSketchError::DimensionMismatch(format!(
                "row {bad} has {} columns, expected {ncols}",
                rows[bad].len()
            )));
        }
        let triplets = rows.iter().enumerate().flat_map(|(i, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(move |(j, v)| (i, j, *v))
        });
        Self::from_triplets(rows.len(), ncols, triplets)
    }

    pub fn matrix(&self) -> &CsMat<f64> {
        &self.matrix
    }
}

impl CountSource for InMemoryCounts {
    fn nrows(&self) -> usize {
        self.matrix.rows()
    }

    fn ncols(&self) -> usize {
        self.matrix.cols()
    }

    fn read_rows(&self, range: Range<usize>) -> Result<CsMat<f64>> {
        check_range(&range, self.nrows())?;
        let mut indptr = Vec::with_capacity(range.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);

        for row in range.clone() {
            if let Some(view) = self.matrix.outer_view(row) {
                for (col, &value) in view.iter() {
                    indices.push(col);
                    data.push(value);
                }
            }
            indptr.push(indices.len());
        }

        Ok(CsMat::new((range.len(), self.ncols()), indptr, indices, data))
    }
}
