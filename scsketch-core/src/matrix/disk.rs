//! Out-of-core CSR storage.
//!
//! Layout (all little endian):
//!
//! ```text
//! magic   [u8; 8]       b"SCSKCSR1"
//! nrows   u64
//! ncols   u64
//! nnz     u64
//! indptr  [u64; nrows + 1]
//! indices [u32; nnz]
//! data    [f64; nnz]
//! ```
//!
//! Reads seek straight to the requested row window; only the rows of one
//! block are ever resident.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use sprs::CsMat;

use super::{CountSource, check_range, row_blocks};
use crate::errors::{Result, ScSketchError};

const MAGIC: &[u8; 8] = b"SCSKCSR1";
const HEADER_LEN: u64 = 32;

#[derive(Debug, Clone)]
pub struct DiskCounts {
    path: PathBuf,
    nrows: usize,
    ncols: usize,
    nnz: u64,
}

impl DiskCounts {
    ///
    /// Write `source` to `path` block by block and open the result.
    ///
    /// # Arguments
    /// - source: any count source, read in blocks of `block_size` rows
    /// - path: destination file, overwritten if present
    ///
    pub fn spill(source: &dyn CountSource, path: &Path, block_size: usize) -> Result<Self> {
        let nrows = source.nrows();
        let ncols = source.ncols();
        if ncols > u32::MAX as usize {
            return Err(ScSketchError::DimensionMismatch(format!(
                "{ncols} columns exceed the on-disk column index width"
            )));
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_u64::<LittleEndian>(nrows as u64)?;
        writer.write_u64::<LittleEndian>(ncols as u64)?;
        // patched once the total is known
        writer.write_u64::<LittleEndian>(0)?;

        // pass 1: row pointers
        let mut nnz: u64 = 0;
        writer.write_u64::<LittleEndian>(0)?;
        for range in row_blocks(nrows, block_size) {
            let block = source.read_rows(range)?;
            for row in block.outer_iterator() {
                nnz += row.nnz() as u64;
                writer.write_u64::<LittleEndian>(nnz)?;
            }
        }

        // pass 2: column indices
        for range in row_blocks(nrows, block_size) {
            let block = source.read_rows(range)?;
            for row in block.outer_iterator() {
                for (col, _) in row.iter() {
                    writer.write_u32::<LittleEndian>(col as u32)?;
                }
            }
        }

        // pass 3: values
        for range in row_blocks(nrows, block_size) {
            let block = source.read_rows(range)?;
            for row in block.outer_iterator() {
                for (_, &value) in row.iter() {
                    writer.write_f64::<LittleEndian>(value)?;
                }
            }
        }

        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(24))?;
        file.write_u64::<LittleEndian>(nnz)?;
        file.flush()?;

        debug!(
            "spilled {} x {} counts ({} non-zeros) to {}",
            nrows,
            ncols,
            nnz,
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            nrows,
            ncols,
            nnz,
        })
    }

    ///
    /// Open a file previously written by [`DiskCounts::spill`].
    ///
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ScSketchError::Parse {
                path: path.display().to_string(),
                reason: "not a scsketch CSR file".to_string(),
            });
        }

        let nrows = reader.read_u64::<LittleEndian>()?;
        let ncols = reader.read_u64::<LittleEndian>()?;
        let nnz = reader.read_u64::<LittleEndian>()?;

        let expected_len = HEADER_LEN + 8 * (nrows + 1) + 12 * nnz;
        let actual_len = reader.get_ref().metadata()?.len();
        if actual_len != expected_len {
            return Err(ScSketchError::Parse {
                path: path.display().to_string(),
                reason: format!("expected {expected_len} bytes, found {actual_len}"),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            nrows: nrows as usize,
            ncols: ncols as usize,
            nnz,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nnz(&self) -> u64 {
        self.nnz
    }

    fn indices_offset(&self) -> u64 {
        HEADER_LEN + 8 * (self.nrows as u64 + 1)
    }

    fn data_offset(&self) -> u64 {
        self.indices_offset() + 4 * self.nnz
    }
}

impl CountSource for DiskCounts {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn read_rows(&self, range: Range<usize>) -> Result<CsMat<f64>> {
        check_range(&range, self.nrows)?;
        let mut reader = BufReader::new(File::open(&self.path)?);

        reader.seek(SeekFrom::Start(HEADER_LEN + 8 * range.start as u64))?;
        let mut pointers = Vec::with_capacity(range.len() + 1);
        for _ in 0..=range.len() {
            pointers.push(reader.read_u64::<LittleEndian>()?);
        }

        let first = pointers[0];
        let block_nnz = (pointers[range.len()] - first) as usize;

        reader.seek(SeekFrom::Start(self.indices_offset() + 4 * first))?;
        let mut indices = Vec::with_capacity(block_nnz);
        for _ in 0..block_nnz {
            let col = reader.read_u32::<LittleEndian>()? as usize;
            if col >= self.ncols {
                return Err(ScSketchError::Parse {
                    path: self.path.display().to_string(),
                    reason: format!("column index {col} out of range"),
                });
            }
            indices.push(col);
        }

        reader.seek(SeekFrom::Start(self.data_offset() + 8 * first))?;
        let mut data = Vec::with_capacity(block_nnz);
        for _ in 0..block_nnz {
            data.push(reader.read_f64::<LittleEndian>()?);
        }

        let indptr = pointers.iter().map(|p| (p - first) as usize).collect();
        Ok(CsMat::new((range.len(), self.ncols), indptr, indices, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::InMemoryCounts;

    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn counts() -> InMemoryCounts {
        InMemoryCounts::from_dense(&[
            vec![0.0, 1.0, 0.0, 0.0],
            vec![2.0, 0.0, 0.0, 7.0],
            vec![0.0, 0.0, 0.0, 0.0],
            vec![0.0, 3.0, 4.0, 0.0],
            vec![5.0, 0.0, 0.0, 6.0],
        ])
        .unwrap()
    }

    #[rstest]
    fn test_spill_and_read_blocks(counts: InMemoryCounts) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csr");

        let disk = DiskCounts::spill(&counts, &path, 2).unwrap();
        assert_eq!(disk.nrows(), 5);
        assert_eq!(disk.ncols(), 4);
        assert_eq!(disk.nnz(), 7);

        let block = disk.read_rows(1..4).unwrap();
        let expected = counts.read_rows(1..4).unwrap();
        assert_eq!(block, expected);
    }

    #[rstest]
    fn test_open_round_trips_header(counts: InMemoryCounts) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csr");
        DiskCounts::spill(&counts, &path, 3).unwrap();

        let reopened = DiskCounts::open(&path).unwrap();
        assert_eq!(reopened.nrows(), 5);
        assert_eq!(reopened.nnz(), 7);
        assert_eq!(reopened.read_rows(4..5).unwrap().get(0, 3), Some(&6.0));
    }

    #[rstest]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.csr");
        std::fs::write(&path, b"definitely not a matrix").unwrap();
        assert!(DiskCounts::open(&path).is_err());
    }
}
