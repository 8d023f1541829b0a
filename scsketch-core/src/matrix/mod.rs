//! Block-oriented matrix access.
//!
//! Every algorithm downstream of ingestion reads its input through one of two
//! traits, so the same code runs whether the rows live in memory or on disk:
//!
//! - [`CountSource`]: raw sparse counts, cells x features, read as CSR row blocks.
//! - [`DenseBlockSource`]: dense derived values (e.g. normalized expression),
//!   read as `faer::Mat` row blocks.
//!
//! Row indices are `usize` everywhere; no code path assumes the element count
//! of a source fits in 32 bits.

pub mod disk;
pub mod memory;

use std::ops::Range;

use faer::Mat;
use sprs::CsMat;

use crate::errors::{Result, ScSketchError};

pub use disk::DiskCounts;
pub use memory::InMemoryCounts;

/// Sparse count matrix readable in row blocks.
pub trait CountSource: Send + Sync {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    /// Rows `range` as a CSR matrix with `ncols()` columns.
    fn read_rows(&self, range: Range<usize>) -> Result<CsMat<f64>>;
}

/// Dense matrix readable in row blocks.
pub trait DenseBlockSource: Send + Sync {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    /// Rows `range` as a dense `range.len() x ncols()` block.
    fn read_block(&self, range: Range<usize>) -> Result<Mat<f64>>;
}

///
/// Split `0..nrows` into consecutive ranges of at most `block_size` rows.
///
pub fn row_blocks(nrows: usize, block_size: usize) -> impl Iterator<Item = Range<usize>> {
    let block_size = block_size.max(1);
    (0..nrows)
        .step_by(block_size)
        .map(move |start| start..(start + block_size).min(nrows))
}

/// `DimensionMismatch` unless `range` lies within `0..nrows`.
pub fn check_range(range: &Range<usize>, nrows: usize) -> Result<()> {
    if range.start > range.end || range.end > nrows {
        return Err(ScSketchError::DimensionMismatch(format!(
            "row range {}..{} is out of bounds for {} rows",
            range.start, range.end, nrows
        )));
    }
    Ok(())
}

///
/// A contiguous window of rows of another dense source, re-indexed from zero.
///
pub struct RowWindow<'a> {
    source: &'a dyn DenseBlockSource,
    rows: Range<usize>,
}

impl<'a> RowWindow<'a> {
    pub fn new(source: &'a dyn DenseBlockSource, rows: Range<usize>) -> Result<Self> {
        check_range(&rows, source.nrows())?;
        Ok(Self { source, rows })
    }

    /// Row offset of this window in the parent source.
    pub fn offset(&self) -> usize {
        self.rows.start
    }
}

impl DenseBlockSource for RowWindow<'_> {
    fn nrows(&self) -> usize {
        self.rows.len()
    }

    fn ncols(&self) -> usize {
        self.source.ncols()
    }

    fn read_block(&self, range: Range<usize>) -> Result<Mat<f64>> {
        check_range(&range, self.nrows())?;
        let start = self.rows.start + range.start;
        self.source.read_block(start..start + range.len())
    }
}
