//! Matrix Market triple I/O (`matrix.mtx`, `features.tsv`, `barcodes.tsv`).
//!
//! Only the coordinate format is supported. Files may be gzip'd.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use sprs::{CsMat, TriMat};

use crate::errors::{Result, ScSketchError};
use crate::matrix::{CountSource, InMemoryCounts, row_blocks};
use crate::models::{CellMetadata, Sample};
use crate::utils::{get_dynamic_reader, get_dynamic_writer, read_lines};

pub const MATRIX_FILE: &str = "matrix.mtx";
pub const FEATURES_FILE: &str = "features.tsv";
pub const BARCODES_FILE: &str = "barcodes.tsv";

/// Orientation of the matrix stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    /// rows are features, columns are cells (the 10x convention)
    FeaturesByCells,
    /// rows are cells, columns are features
    CellsByFeatures,
}

fn parse_error(path: &Path, reason: impl Into<String>) -> ScSketchError {
    ScSketchError::Parse {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

///
/// Read a Matrix Market coordinate file into a cells x features CSR matrix.
///
/// # Arguments
/// - path: `.mtx` or `.mtx.gz` file
/// - layout: orientation of the stored matrix
///
pub fn read_matrix_market(path: &Path, layout: MatrixLayout) -> Result<CsMat<f64>> {
    let reader = get_dynamic_reader(path)?;
    let mut lines = reader.lines();

    let header = lines
        .next()
        .ok_or_else(|| parse_error(path, "empty file"))??;
    let header_fields: Vec<String> = header
        .split_whitespace()
        .map(|f| f.to_lowercase())
        .collect();
    if header_fields.len() < 4
        || header_fields[0] != "%%matrixmarket"
        || header_fields[1] != "matrix"
        || header_fields[2] != "coordinate"
    {
        return Err(parse_error(path, "expected a coordinate Matrix Market header"));
    }
    let is_pattern = header_fields[3] == "pattern";

    let mut shape: Option<(usize, usize, usize)> = None;
    let mut tri: Option<TriMat<f64>> = None;
    let mut seen = 0usize;

    for line in lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        match shape {
            None => {
                if fields.len() != 3 {
                    return Err(parse_error(path, format!("bad size line `{line}`")));
                }
                let parsed = parse_usize_fields(path, &fields)?;
                let (rows, cols) = match layout {
                    MatrixLayout::FeaturesByCells => (parsed[1], parsed[0]),
                    MatrixLayout::CellsByFeatures => (parsed[0], parsed[1]),
                };
                shape = Some((parsed[0], parsed[1], parsed[2]));
                tri = Some(TriMat::with_capacity((rows, cols), parsed[2]));
            }
            Some((stored_rows, stored_cols, _)) => {
                let expected = if is_pattern { 2 } else { 3 };
                if fields.len() < expected {
                    return Err(parse_error(path, format!("bad entry `{line}`")));
                }
                let coords = parse_usize_fields(path, &fields[..2])?;
                let (r, c) = (coords[0], coords[1]);
                if r == 0 || c == 0 || r > stored_rows || c > stored_cols {
                    return Err(parse_error(path, format!("entry `{line}` out of bounds")));
                }
                let value = if is_pattern {
                    1.0
                } else {
                    fields[2]
                        .parse::<f64>()
                        .map_err(|e| parse_error(path, format!("bad value `{}`: {e}", fields[2])))?
                };
                let (row, col) = match layout {
                    MatrixLayout::FeaturesByCells => (c - 1, r - 1),
                    MatrixLayout::CellsByFeatures => (r - 1, c - 1),
                };
                if let Some(tri) = tri.as_mut() {
                    tri.add_triplet(row, col, value);
                }
                seen += 1;
            }
        }
    }

    let (_, _, declared) = shape.ok_or_else(|| parse_error(path, "missing size line"))?;
    if seen != declared {
        return Err(parse_error(
            path,
            format!("declared {declared} entries but found {seen}"),
        ));
    }

    let tri = tri.ok_or_else(|| parse_error(path, "missing size line"))?;
    Ok(tri.to_csr())
}

fn parse_usize_fields(path: &Path, fields: &[&str]) -> Result<Vec<usize>> {
    fields
        .iter()
        .map(|f| {
            f.parse::<usize>()
                .map_err(|e| parse_error(path, format!("bad integer `{f}`: {e}")))
        })
        .collect()
}

///
/// Write a cells x features count source as a gzip'd (or plain) Matrix Market
/// file in the 10x orientation (features x cells).
///
/// Triplets are emitted in (feature, cell) order for Matrix Market compliance.
///
pub fn write_matrix_market(source: &dyn CountSource, path: &Path, block_size: usize) -> Result<()> {
    let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
    for range in row_blocks(source.nrows(), block_size) {
        let offset = range.start;
        let block = source.read_rows(range)?;
        for (i, row) in block.outer_iterator().enumerate() {
            for (j, &value) in row.iter() {
                triplets.push((j, offset + i, value));
            }
        }
    }
    triplets.sort_by_key(|&(r, c, _)| (r, c));

    let mut writer = get_dynamic_writer(path)?;
    writeln!(writer, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(
        writer,
        "{} {} {}",
        source.ncols(),
        source.nrows(),
        triplets.len()
    )?;
    for (row, col, value) in triplets {
        writeln!(writer, "{} {} {}", row + 1, col + 1, value)?;
    }
    writer.flush()?;

    Ok(())
}

/// Feature names: the second column of a 10x `features.tsv` when present.
pub fn read_features(path: &Path) -> Result<Vec<String>> {
    Ok(read_lines(path)?
        .into_iter()
        .map(|line| {
            let mut fields = line.split('\t');
            let first = fields.next().unwrap_or_default().to_string();
            fields.next().map(|s| s.to_string()).unwrap_or(first)
        })
        .collect())
}

pub fn read_barcodes(path: &Path) -> Result<Vec<String>> {
    Ok(read_lines(path)?
        .into_iter()
        .map(|line| line.split('\t').next().unwrap_or_default().to_string())
        .collect())
}

/// Locate `name` or `name.gz` inside `dir`.
pub fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let plain = dir.join(name);
    if plain.exists() {
        return Some(plain);
    }
    let gz = dir.join(format!("{name}.gz"));
    gz.exists().then_some(gz)
}

///
/// Load a sample from a directory holding a Matrix Market triple (10x layout).
///
pub fn read_sample_dir(dir: &Path, id: &str) -> Result<Sample> {
    let missing = |name: &str| parse_error(dir, format!("missing {name}[.gz]"));

    let matrix_path = find_file(dir, MATRIX_FILE).ok_or_else(|| missing(MATRIX_FILE))?;
    let features_path = find_file(dir, FEATURES_FILE)
        .or_else(|| find_file(dir, "genes.tsv"))
        .ok_or_else(|| missing(FEATURES_FILE))?;
    let barcodes_path = find_file(dir, BARCODES_FILE).ok_or_else(|| missing(BARCODES_FILE))?;

    let matrix = read_matrix_market(&matrix_path, MatrixLayout::FeaturesByCells)?;
    let features = read_features(&features_path)?;
    let barcodes = read_barcodes(&barcodes_path)?;

    info!(
        "loaded sample `{}`: {} cells x {} features",
        id,
        matrix.rows(),
        matrix.cols()
    );

    Sample::new(
        id,
        Arc::new(InMemoryCounts::new(matrix)),
        features,
        CellMetadata::with_barcodes(barcodes),
    )
}

///
/// Write a sample as a Matrix Market triple into `dir` (created if missing).
///
pub fn write_sample_dir(sample: &Sample, dir: &Path, block_size: usize) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_matrix_market(
        sample.counts(),
        &dir.join(format!("{MATRIX_FILE}.gz")),
        block_size,
    )?;

    let mut features = get_dynamic_writer(&dir.join(format!("{FEATURES_FILE}.gz")))?;
    for name in sample.features() {
        writeln!(features, "{name}\t{name}\tGene Expression")?;
    }
    features.flush()?;

    let mut barcodes = get_dynamic_writer(&dir.join(format!("{BARCODES_FILE}.gz")))?;
    for barcode in &sample.metadata().barcodes {
        writeln!(barcodes, "{barcode}")?;
    }
    barcodes.flush()?;

    Ok(())
}
