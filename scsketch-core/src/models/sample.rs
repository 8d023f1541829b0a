use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Result, ScSketchError};
use crate::matrix::CountSource;

///
/// Per-cell metadata supplied at ingestion: barcodes plus categorical covariates.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMetadata {
    pub barcodes: Vec<String>,
    pub covariates: BTreeMap<String, Vec<String>>,
}

impl CellMetadata {
    pub fn with_barcodes(barcodes: Vec<String>) -> Self {
        Self {
            barcodes,
            covariates: BTreeMap::new(),
        }
    }

    /// Placeholder barcodes `{prefix}_{i}` for `n` cells.
    pub fn numbered(prefix: &str, n: usize) -> Self {
        Self::with_barcodes((0..n).map(|i| format!("{prefix}_{i}")).collect())
    }

    pub fn with_covariate(mut self, name: &str, values: Vec<String>) -> Self {
        self.covariates.insert(name.to_string(), values);
        self
    }
}

///
/// One ingested sample. Read-only once constructed; clones share the counts.
///
#[derive(Clone)]
pub struct Sample {
    id: String,
    counts: Arc<dyn CountSource>,
    features: Vec<String>,
    metadata: CellMetadata,
}

impl Sample {
    pub fn new(
        id: impl Into<String>,
        counts: Arc<dyn CountSource>,
        features: Vec<String>,
        metadata: CellMetadata,
    ) -> Result<Self> {
        let id = id.into();
        if features.len() != counts.ncols() {
            return Err(ScSketchError::DimensionMismatch(format!(
                "sample `{id}` has {} feature names for {} columns",
                features.len(),
                counts.ncols()
            )));
        }
        if metadata.barcodes.len() != counts.nrows() {
            return Err(ScSketchError::DimensionMismatch(format!(
                "sample `{id}` has {} barcodes for {} cells",
                metadata.barcodes.len(),
                counts.nrows()
            )));
        }
        if let Some((name, values)) = metadata
            .covariates
            .iter()
            .find(|(_, values)| values.len() != counts.nrows())
        {
            return Err(ScSketchError::DimensionMismatch(format!(
                "covariate `{name}` of sample `{id}` has {} values for {} cells",
                values.len(),
                counts.nrows()
            )));
        }

        Ok(Self {
            id,
            counts,
            features,
            metadata,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn counts(&self) -> &dyn CountSource {
        self.counts.as_ref()
    }

    pub fn shared_counts(&self) -> Arc<dyn CountSource> {
        Arc::clone(&self.counts)
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn metadata(&self) -> &CellMetadata {
        &self.metadata
    }

    pub fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.counts.ncols()
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("id", &self.id)
            .field("n_cells", &self.n_cells())
            .field("n_features", &self.n_features())
            .finish()
    }
}
