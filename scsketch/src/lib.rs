//! # scsketch
//!
//! Scalable multi-sample single-cell processing: robust per-sample quality
//! control, leverage-score sketching of every sample, canonical-correlation
//! integration computed on the sketches only, and streaming projection of the
//! shared embedding back onto every kept cell.
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//!
//! use scsketch::config::PipelineConfig;
//! use scsketch::ingest::load_samples;
//! use scsketch::output::OutputWriter;
//! use scsketch::pipeline::Pipeline;
//!
//! let config = PipelineConfig::from_path(Path::new("scsketch.toml")).unwrap();
//! let loaded = load_samples(&[PathBuf::from("data/pbmc_a")], None, config.block_size).unwrap();
//! let result = Pipeline::new(config)
//!     .unwrap()
//!     .with_ingest_failures(&loaded.failures)
//!     .run(loaded.samples)
//!     .unwrap();
//! OutputWriter::default().write(&result, Path::new("out")).unwrap();
//! ```
//!
//! The member crates are re-exported: [`core`], [`qc`], [`sketch`] and
//! [`integrate`].

pub mod config;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod report;

#[doc(inline)]
pub use scsketch_core as core;

#[doc(inline)]
pub use scsketch_qc as qc;

#[doc(inline)]
pub use scsketch_sketch as sketch;

#[doc(inline)]
pub use scsketch_integrate as integrate;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PipelineResult};
pub use report::RunReport;
