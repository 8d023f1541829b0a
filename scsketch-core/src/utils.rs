use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::errors::Result;

///
/// Get a reader for either a gzip'd or non-gzip'd file.
///
/// # Arguments
///
/// - path: path to the file to read
///
pub fn get_dynamic_reader(path: &Path) -> Result<BufReader<Box<dyn Read>>> {
    let is_gzipped = path.extension() == Some(OsStr::new("gz"));
    let file = File::open(path)?;
    let file: Box<dyn Read> = match is_gzipped {
        true => Box::new(MultiGzDecoder::new(file)),
        false => Box::new(file),
    };

    Ok(BufReader::new(file))
}

///
/// Get a writer that gzips its output when the path ends in `.gz`.
///
pub fn get_dynamic_writer(path: &Path) -> Result<Box<dyn Write>> {
    let is_gzipped = path.extension() == Some(OsStr::new("gz"));
    let file = File::create(path)?;
    let writer: Box<dyn Write> = match is_gzipped {
        true => Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))),
        false => Box::new(BufWriter::new(file)),
    };

    Ok(writer)
}

/// Read all non-empty lines of a (possibly gzip'd) text file.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let reader = get_dynamic_reader(path)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}

/// Median of `values`; reorders the slice in place. `None` for an empty slice.
pub fn median_in_place(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }

    let mid = n / 2;
    let (lower, upper_mid, _) = values.select_nth_unstable_by(mid, total_order);
    let upper_mid = *upper_mid;

    if n % 2 == 1 {
        Some(upper_mid)
    } else {
        // the lower middle is the maximum of the left partition
        let lower_mid = lower
            .iter()
            .copied()
            .max_by(total_order)
            .unwrap_or(upper_mid);
        Some((lower_mid + upper_mid) / 2.0)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut scratch = values.to_vec();
    median_in_place(&mut scratch)
}

/// Unscaled median absolute deviation around `center`.
pub fn median_abs_deviation(values: &[f64], center: f64) -> Option<f64> {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median_in_place(&mut deviations)
}

fn total_order(a: &f64, b: &f64) -> Ordering {
    a.total_cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case(vec![3.0, 1.0, 2.0], Some(2.0))]
    #[case(vec![4.0, 1.0, 3.0, 2.0], Some(2.5))]
    #[case(vec![7.0], Some(7.0))]
    #[case(vec![], None)]
    fn test_median(#[case] values: Vec<f64>, #[case] expected: Option<f64>) {
        assert_eq!(median(&values), expected);
    }

    #[rstest]
    fn test_median_abs_deviation() {
        let values = vec![1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        let center = median(&values).unwrap();
        assert_eq!(center, 2.0);
        assert_eq!(median_abs_deviation(&values, center), Some(1.0));
    }

    #[rstest]
    fn test_dynamic_writer_and_reader_gz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barcodes.tsv.gz");
        {
            let mut writer = get_dynamic_writer(&path).unwrap();
            writeln!(writer, "AAAC-1").unwrap();
            writeln!(writer, "AAAG-1").unwrap();
            writeln!(writer).unwrap();
            writer.flush().unwrap();
        }
        let lines = read_lines(&path).unwrap();
        assert_eq!(lines, vec!["AAAC-1".to_string(), "AAAG-1".to_string()]);
    }
}
