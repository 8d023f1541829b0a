//! Persisted run outputs.
//!
//! | file | columns |
//! |---|---|
//! | `thresholds.tsv` | `sample_id metric lower upper` (empty = absent) |
//! | `cells.tsv` | `sample_id local_index global_index keep doublet_label doublet_score <metric>... outlier_<metric>...` |
//! | `sketch.tsv` | `global_index sample_id weight` |
//! | `embedding.tsv` | `global_index dim_1 .. dim_k` |
//! | `report.json` | see [`RunReport`](crate::report::RunReport) |
//!
//! TSV tables get a `.gz` suffix and are gzip'd when compression is on.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;

use scsketch_core::utils::get_dynamic_writer;
use scsketch_core::{Result, ScSketchError};
use scsketch_integrate::FullEmbedding;
use scsketch_qc::{CellRecord, Metric, SampleThresholds};
use scsketch_sketch::Sketch;

use crate::pipeline::PipelineResult;

pub const THRESHOLDS_FILE: &str = "thresholds.tsv";
pub const CELLS_FILE: &str = "cells.tsv";
pub const SKETCH_FILE: &str = "sketch.tsv";
pub const EMBEDDING_FILE: &str = "embedding.tsv";
pub const REPORT_FILE: &str = "report.json";
pub const EMBEDDING_PARQUET_FILE: &str = "embedding.parquet";

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct OutputWriter {
    compress: bool,
    parquet: bool,
}

impl OutputWriter {
    pub fn new(compress: bool, parquet: bool) -> Self {
        Self { compress, parquet }
    }

    fn table_path(&self, dir: &Path, name: &str) -> PathBuf {
        match self.compress {
            true => dir.join(format!("{name}.gz")),
            false => dir.join(name),
        }
    }

    ///
    /// Write every output of `result` into `dir` (created if missing) and
    /// return the written paths.
    ///
    pub fn write(&self, result: &PipelineResult, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let path = self.table_path(dir, THRESHOLDS_FILE);
        write_thresholds(&result.thresholds, &path)?;
        written.push(path);

        let path = self.table_path(dir, CELLS_FILE);
        write_cells(&result.records, &result.metrics, &path)?;
        written.push(path);

        let path = self.table_path(dir, SKETCH_FILE);
        write_sketches(&result.sketches, &path)?;
        written.push(path);

        let path = self.table_path(dir, EMBEDDING_FILE);
        write_embedding(&result.embedding, &path)?;
        written.push(path);

        let path = dir.join(REPORT_FILE);
        let json = result
            .report
            .to_json()
            .map_err(|e| ScSketchError::Io(e.into()))?;
        std::fs::write(&path, json)?;
        written.push(path);

        if self.parquet {
            let path = dir.join(EMBEDDING_PARQUET_FILE);
            write_embedding_parquet(&result.embedding, &path)?;
            written.push(path);
        }

        info!("wrote {} output files to {}", written.len(), dir.display());
        Ok(written)
    }
}

pub fn write_thresholds(thresholds: &[SampleThresholds], path: &Path) -> Result<()> {
    let mut writer = get_dynamic_writer(path)?;
    writeln!(writer, "sample_id\tmetric\tlower\tupper")?;
    for sample in thresholds {
        for (metric, threshold) in &sample.entries {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                sample.sample_id,
                metric,
                optional(threshold.lower),
                optional(threshold.upper)
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_cells(records: &[CellRecord], metrics: &[Metric], path: &Path) -> Result<()> {
    let mut writer = get_dynamic_writer(path)?;
    write!(
        writer,
        "sample_id\tlocal_index\tglobal_index\tkeep\tdoublet_label\tdoublet_score"
    )?;
    for metric in metrics {
        write!(writer, "\t{metric}")?;
    }
    for metric in metrics {
        write!(writer, "\toutlier_{metric}")?;
    }
    writeln!(writer)?;

    for record in records {
        write!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}",
            record.sample_id,
            record.local_index,
            record.global_index.map(|g| g.to_string()).unwrap_or_default(),
            record.keep,
            record.doublet.label,
            record.doublet.score
        )?;
        for value in &record.metric_values {
            write!(writer, "\t{value}")?;
        }
        for flag in &record.outlier {
            write!(writer, "\t{flag}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_sketches(sketches: &[Sketch], path: &Path) -> Result<()> {
    let mut rows: Vec<(usize, &str, f64)> = sketches
        .iter()
        .flat_map(|s| {
            s.indices
                .iter()
                .zip(s.weights.iter())
                .map(move |(g, w)| (*g, s.sample_id.as_str(), *w))
        })
        .collect();
    rows.sort_by_key(|(g, _, _)| *g);

    let mut writer = get_dynamic_writer(path)?;
    writeln!(writer, "global_index\tsample_id\tweight")?;
    for (global, sample_id, weight) in rows {
        writeln!(writer, "{global}\t{sample_id}\t{weight}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_embedding(embedding: &FullEmbedding, path: &Path) -> Result<()> {
    let mut writer = get_dynamic_writer(path)?;
    write!(writer, "global_index")?;
    for c in 1..=embedding.dims() {
        write!(writer, "\tdim_{c}")?;
    }
    writeln!(writer)?;

    for (global, row) in embedding.coordinates.rows().into_iter().enumerate() {
        write!(writer, "{global}")?;
        for value in row.iter() {
            write!(writer, "\t{value}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(feature = "parquet")]
fn write_embedding_parquet(embedding: &FullEmbedding, path: &Path) -> Result<()> {
    use std::fs::File;
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Float64Array, UInt64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    let failed = |e: &dyn std::fmt::Display| {
        ScSketchError::Io(std::io::Error::other(format!("{}: {e}", path.display())))
    };

    let mut fields = vec![Field::new("global_index", DataType::UInt64, false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from_iter_values(
        0..embedding.n_cells() as u64,
    ))];
    for c in 0..embedding.dims() {
        fields.push(Field::new(format!("dim_{}", c + 1), DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from_iter_values(
            embedding.coordinates.column(c).iter().copied(),
        )));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).map_err(|e| failed(&e))?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None).map_err(|e| failed(&e))?;
    writer.write(&batch).map_err(|e| failed(&e))?;
    writer.close().map_err(|e| failed(&e))?;
    Ok(())
}

#[cfg(not(feature = "parquet"))]
fn write_embedding_parquet(_embedding: &FullEmbedding, path: &Path) -> Result<()> {
    Err(ScSketchError::Configuration(format!(
        "can't write {}: built without the `parquet` feature",
        path.display()
    )))
}
