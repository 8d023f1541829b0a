use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgMatches;
use log::{info, warn};

use scsketch::config::PipelineConfig;
use scsketch::core::io::find_file;
use scsketch::core::models::Sample;
use scsketch::ingest::load_samples;
use scsketch::output::OutputWriter;
use scsketch::pipeline::Pipeline;
use scsketch::qc::PrecomputedDoublets;

use super::cli::DEFAULT_OUT;

fn load_doublets(dir: &Path, samples: &[Sample]) -> Result<PrecomputedDoublets> {
    let mut doublets = PrecomputedDoublets::new();
    for sample in samples {
        match find_file(dir, &format!("{}.tsv", sample.id())) {
            Some(path) => doublets
                .load_tsv(sample.id(), &path)
                .with_context(|| format!("loading doublet calls for `{}`", sample.id()))?,
            None => warn!(
                "no doublet calls for sample `{}` in {}; treating all cells as singlets",
                sample.id(),
                dir.display()
            ),
        }
    }
    Ok(doublets)
}

pub fn run_pipeline(matches: &ArgMatches) -> Result<()> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => PipelineConfig::from_path(Path::new(path))
            .with_context(|| format!("loading config {path}"))?,
        None => PipelineConfig::default(),
    };
    if let Some(threads) = matches.get_one::<usize>("threads") {
        config.threads = Some(*threads);
    }
    if matches.get_flag("progress") {
        config.progress = true;
    }
    if matches.get_flag("compress") {
        config.compress = true;
    }

    let default_out = DEFAULT_OUT.to_string();
    let output = PathBuf::from(matches.get_one::<String>("output").unwrap_or(&default_out));
    let dirs: Vec<PathBuf> = matches
        .get_many::<String>("samples")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();

    let pipeline = Pipeline::new(config)?;
    let config = pipeline.config();
    let loaded = load_samples(&dirs, config.spill_dir.as_deref(), config.block_size)?;
    let writer = OutputWriter::new(config.compress, config.parquet);
    let samples = loaded.samples;
    let mut pipeline = pipeline.with_ingest_failures(&loaded.failures);

    if let Some(dir) = matches.get_one::<String>("doublets") {
        let doublets = load_doublets(Path::new(dir), &samples)?;
        pipeline = pipeline.with_doublets(Arc::new(doublets));
    }

    let result = pipeline.run(samples)?;
    writer.write(&result, &output)?;

    for failure in &result.report.failures {
        warn!(
            "sample `{}` excluded at {}: {}",
            failure.sample_id, failure.stage, failure.reason
        );
    }
    info!(
        "{} cells from {} samples embedded; results in {}",
        result.report.merged_cells,
        result.merged.samples().len(),
        output.display()
    );

    Ok(())
}
