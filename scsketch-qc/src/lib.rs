//! Quality control for scsketch: per-cell metrics, robust median/MAD outlier
//! thresholds, the doublet collaborator and the filter that merges the kept
//! cells of every sample into one [`MergedDataset`].

pub mod doublets;
pub mod filter;
pub mod metrics;
pub mod thresholds;

pub use doublets::{
    DoubletCall, DoubletClassifier, DoubletLabel, NoDoubletDetection, PrecomputedDoublets,
};
pub use filter::{CellRecord, FilterOutcome, Filterer, MergedDataset, MergedSample, SampleQc};
pub use metrics::{Metric, MetricStore, MetricTable};
pub use thresholds::{MetricThreshold, OutlierThresholder, SampleThresholds};
