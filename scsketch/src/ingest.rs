use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxhash::FxHashSet;
use log::{info, warn};
use rayon::prelude::*;

use scsketch_core::io::read_sample_dir;
use scsketch_core::matrix::DiskCounts;
use scsketch_core::models::Sample;
use scsketch_core::{Result, ScSketchError, Stage};

/// Sample id of a sample directory: its final path component.
pub fn sample_id(dir: &Path) -> Result<String> {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ScSketchError::Configuration(format!("can't derive a sample id from {}", dir.display()))
        })
}

///
/// Samples read from disk plus the samples that failed on the way.
///
#[derive(Debug, Default)]
pub struct LoadedSamples {
    pub samples: Vec<Sample>,
    pub failures: Vec<ScSketchError>,
}

///
/// Load every sample directory (a Matrix Market triple each). With
/// `spill_dir` the counts of each sample are moved to an on-disk CSR file
/// and the in-memory copy is dropped.
///
/// A sample that fails with a `SampleFailure` is left out and listed in
/// `failures`; any other error aborts. Duplicate sample ids are rejected
/// before anything is read.
///
pub fn load_samples(
    dirs: &[PathBuf],
    spill_dir: Option<&Path>,
    block_size: usize,
) -> Result<LoadedSamples> {
    let ids = dirs.iter().map(|dir| sample_id(dir)).collect::<Result<Vec<_>>>()?;
    let mut seen = FxHashSet::default();
    for (id, dir) in ids.iter().zip(dirs) {
        if !seen.insert(id.as_str()) {
            return Err(ScSketchError::Configuration(format!(
                "duplicate sample id `{id}` (from {})",
                dir.display()
            )));
        }
    }

    if let Some(dir) = spill_dir {
        std::fs::create_dir_all(dir)?;
    }

    let results: Vec<Result<Sample>> = dirs
        .par_iter()
        .zip(ids.par_iter())
        .map(|(dir, id)| {
            let sample = read_sample_dir(dir, id)?;
            match spill_dir {
                Some(spill) => spill_sample(sample, spill, block_size),
                None => Ok(sample),
            }
        })
        .collect();

    let mut loaded = LoadedSamples::default();
    for result in results {
        match result {
            Ok(sample) => loaded.samples.push(sample),
            Err(e) if e.is_sample_failure() => {
                warn!("{e}");
                loaded.failures.push(e);
            }
            Err(e) => return Err(e),
        }
    }
    if loaded.samples.is_empty() && !dirs.is_empty() {
        return Err(ScSketchError::NoSamplesRemaining(Stage::Ingest));
    }
    Ok(loaded)
}

pub fn spill_sample(sample: Sample, dir: &Path, block_size: usize) -> Result<Sample> {
    let path = dir.join(format!("{}.csr", sample.id()));
    let disk = DiskCounts::spill(sample.counts(), &path, block_size)
        .map_err(|e| ScSketchError::sample_failure(sample.id(), Stage::Ingest, e))?;
    info!(
        "sample `{}`: {} non-zeros spilled to {}",
        sample.id(),
        disk.nnz(),
        path.display()
    );

    Sample::new(
        sample.id(),
        Arc::new(disk),
        sample.features().to_vec(),
        sample.metadata().clone(),
    )
}
