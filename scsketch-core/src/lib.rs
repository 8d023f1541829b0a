//! Core library for scsketch: models, errors and block matrix access shared by
//! every stage of the QC / sketch / integration pipeline.
//!
//! - [`matrix`]: the [`CountSource`](matrix::CountSource) and
//!   [`DenseBlockSource`](matrix::DenseBlockSource) traits, with in-memory and
//!   on-disk count storage
//! - [`models`]: ingested [`Sample`](models::Sample)s and their metadata
//! - [`io`]: Matrix Market triple reading/writing
//! - [`errors`]: the error taxonomy and pipeline [`Stage`](errors::Stage)s

pub mod consts;
pub mod errors;
pub mod io;
pub mod matrix;
pub mod models;
pub mod utils;

pub use errors::{Result, ScSketchError, Stage};
