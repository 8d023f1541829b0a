//! Normalization of raw counts into a dense assay over a ranked feature subset.
//!
//! A [`NormalizationStrategy`] fits a per-feature model in streaming passes
//! over the merged counts and afterwards transforms count blocks on demand, so
//! the [`NormalizedAssay`] is never materialised as a whole.

pub mod log_normalize;
pub mod pearson;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use faer::Mat;
use log::info;
use sprs::CsMat;

use scsketch_core::consts::{DEFAULT_BLOCK_SIZE, DEFAULT_N_FEATURES, DEFAULT_SCALE_FACTOR, DEFAULT_THETA};
use scsketch_core::matrix::{CountSource, DenseBlockSource, RowWindow};
use scsketch_core::{Result, ScSketchError};

pub use log_normalize::LogNormalize;
pub use pearson::PearsonResiduals;

///
/// Per-feature model fitted on the merged counts.
///
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureModel {
    pub n_cells: usize,
    /// ranking score per feature (higher is more informative)
    pub scores: Vec<f64>,
    /// strategy-specific per-feature parameters, may be empty
    pub params: Vec<f64>,
}

///
/// Selected feature columns in ranked order, with the inverse lookup.
///
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSelection {
    columns: Vec<usize>,
    positions: Vec<Option<usize>>,
}

impl FeatureSelection {
    pub fn new(columns: Vec<usize>, n_features: usize) -> Self {
        let mut positions = vec![None; n_features];
        for (pos, &col) in columns.iter().enumerate() {
            positions[col] = Some(pos);
        }
        Self { columns, positions }
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Output position of input column `col`.
    pub fn position(&self, col: usize) -> Option<usize> {
        self.positions.get(col).copied().flatten()
    }
}

pub trait NormalizationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&self, counts: &dyn CountSource, block_size: usize) -> Result<FeatureModel>;

    /// Normalized values of `block` (all features) restricted to `selection`.
    fn transform(
        &self,
        model: &FeatureModel,
        block: &CsMat<f64>,
        selection: &FeatureSelection,
    ) -> Result<Mat<f64>>;
}

///
/// Rank features by score, descending, ties by index. Zero, negative and
/// non-finite scores are never selected.
///
pub fn rank_features(scores: &[f64], n_features: usize) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..scores.len())
        .filter(|j| scores[*j] > 0.0 && scores[*j].is_finite())
        .collect();
    ranked.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]).then(a.cmp(b)));
    ranked.truncate(n_features);
    ranked
}

/// Strategy selection as it appears in configuration files.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "method", rename_all = "snake_case"))]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum NormalizationMethod {
    LogNormalize {
        #[cfg_attr(feature = "serde", serde(default = "default_scale_factor"))]
        scale_factor: f64,
    },
    PearsonResiduals {
        #[cfg_attr(feature = "serde", serde(default = "default_theta"))]
        theta: f64,
        /// defaults to `sqrt(n_cells)`
        #[cfg_attr(feature = "serde", serde(default))]
        clip: Option<f64>,
    },
}

fn default_scale_factor() -> f64 {
    DEFAULT_SCALE_FACTOR
}

fn default_theta() -> f64 {
    DEFAULT_THETA
}

impl Default for NormalizationMethod {
    fn default() -> Self {
        Self::log_normalize()
    }
}

impl NormalizationMethod {
    pub fn log_normalize() -> Self {
        NormalizationMethod::LogNormalize {
            scale_factor: default_scale_factor(),
        }
    }

    pub fn pearson_residuals() -> Self {
        NormalizationMethod::PearsonResiduals {
            theta: default_theta(),
            clip: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(ScSketchError::Configuration(format!(
                    "normalization {name} must be positive, got {v}"
                )))
            }
        };
        match self {
            NormalizationMethod::LogNormalize { scale_factor } => {
                positive("scale_factor", *scale_factor)
            }
            NormalizationMethod::PearsonResiduals { theta, clip } => {
                positive("theta", *theta)?;
                clip.map_or(Ok(()), |c| positive("clip", c))
            }
        }
    }

    pub fn strategy(&self) -> Arc<dyn NormalizationStrategy> {
        match self {
            NormalizationMethod::LogNormalize { scale_factor } => {
                Arc::new(LogNormalize::new(*scale_factor))
            }
            NormalizationMethod::PearsonResiduals { theta, clip } => {
                Arc::new(PearsonResiduals::new(*theta, *clip))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedAssayBuilder {
    method: NormalizationMethod,
    n_features: usize,
    block_size: usize,
}

impl Default for NormalizedAssayBuilder {
    fn default() -> Self {
        Self::new(NormalizationMethod::default(), DEFAULT_N_FEATURES, DEFAULT_BLOCK_SIZE)
    }
}

impl NormalizedAssayBuilder {
    pub fn new(method: NormalizationMethod, n_features: usize, block_size: usize) -> Self {
        Self {
            method,
            n_features,
            block_size,
        }
    }

    ///
    /// Fit the strategy on `counts` and select the top `n_features` features.
    ///
    pub fn build(
        &self,
        counts: Arc<dyn CountSource>,
        feature_names: &[String],
    ) -> Result<NormalizedAssay> {
        if feature_names.len() != counts.ncols() {
            return Err(ScSketchError::DimensionMismatch(format!(
                "{} feature names for {} columns",
                feature_names.len(),
                counts.ncols()
            )));
        }

        let strategy = self.method.strategy();
        let model = strategy.fit(counts.as_ref(), self.block_size)?;
        let ranked = rank_features(&model.scores, self.n_features);
        if ranked.is_empty() {
            return Err(ScSketchError::DimensionMismatch(format!(
                "normalize: no feature has a positive {} score",
                strategy.name()
            )));
        }

        info!(
            "normalize ({}): {} of {} features selected over {} cells",
            strategy.name(),
            ranked.len(),
            counts.ncols(),
            counts.nrows()
        );

        let selected_names = ranked.iter().map(|j| feature_names[*j].clone()).collect();
        Ok(NormalizedAssay {
            selection: Arc::new(FeatureSelection::new(ranked, counts.ncols())),
            counts,
            strategy,
            model: Arc::new(model),
            feature_names: selected_names,
        })
    }
}

///
/// Normalized expression of every merged cell over the selected features.
/// Rows are computed from the raw counts whenever a block is read.
///
#[derive(Clone)]
pub struct NormalizedAssay {
    counts: Arc<dyn CountSource>,
    strategy: Arc<dyn NormalizationStrategy>,
    model: Arc<FeatureModel>,
    selection: Arc<FeatureSelection>,
    feature_names: Vec<String>,
}

impl NormalizedAssay {
    /// Selected feature names, in ranked order.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn selection(&self) -> &FeatureSelection {
        &self.selection
    }

    pub fn model(&self) -> &FeatureModel {
        &self.model
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    ///
    /// The same fitted model and selection over different counts with the same
    /// feature space, e.g. the merged dataset after excluding samples.
    ///
    pub fn with_counts(&self, counts: Arc<dyn CountSource>) -> Result<Self> {
        if counts.ncols() != self.counts.ncols() {
            return Err(ScSketchError::DimensionMismatch(format!(
                "assay was fitted on {} features, got {}",
                self.counts.ncols(),
                counts.ncols()
            )));
        }
        Ok(Self {
            counts,
            ..self.clone()
        })
    }

    /// The rows of one sample.
    pub fn sample_view(&self, rows: Range<usize>) -> Result<RowWindow<'_>> {
        RowWindow::new(self, rows)
    }
}

impl DenseBlockSource for NormalizedAssay {
    fn nrows(&self) -> usize {
        self.counts.nrows()
    }

    fn ncols(&self) -> usize {
        self.selection.len()
    }

    fn read_block(&self, range: Range<usize>) -> Result<Mat<f64>> {
        let block = self.counts.read_rows(range)?;
        self.strategy.transform(&self.model, &block, &self.selection)
    }
}

impl fmt::Debug for NormalizedAssay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedAssay")
            .field("strategy", &self.strategy.name())
            .field("nrows", &self.counts.nrows())
            .field("features", &self.feature_names.len())
            .finish()
    }
}
