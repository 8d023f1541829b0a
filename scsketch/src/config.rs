use std::ffi::OsStr;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use scsketch_core::consts::*;
use scsketch_core::{Result, ScSketchError};
use scsketch_integrate::ProjectionMethod;
use scsketch_qc::Metric;
use scsketch_sketch::NormalizationMethod;
use scsketch_sketch::SketchOptions;
use scsketch_sketch::linalg::EigenParams;

#[derive(Debug)]
pub enum ConfigFileType {
    Toml,
    Yaml,
    Json,
}

impl ConfigFileType {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(OsStr::to_str) {
            Some("toml") => Ok(ConfigFileType::Toml),
            Some("yaml") | Some("yml") => Ok(ConfigFileType::Yaml),
            Some("json") => Ok(ConfigFileType::Json),
            _ => Err(ScSketchError::Configuration(format!(
                "config file {} must end in `toml`, `yaml`, `yml` or `json`",
                path.display()
            ))),
        }
    }
}

///
/// Every tunable of a pipeline run. All fields have defaults, so an empty
/// file is a valid configuration.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PipelineConfig {
    /// MAD multiplier of the outlier bounds
    pub outlier_k: f64,
    /// also reject cells below the lower bound
    pub two_sided: bool,
    pub metrics: Vec<Metric>,
    pub mito_prefixes: Vec<String>,

    pub normalization: NormalizationMethod,
    pub n_features: usize,

    pub sketch_budget: usize,
    pub sketch_rank: usize,
    pub mix_alpha: f64,
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub oversampling: usize,
    pub factorization_timeout_secs: Option<f64>,

    pub integration_dims: usize,
    pub projection: ProjectionMethod,
    pub consistency_tolerance: f64,

    pub block_size: usize,
    /// worker threads, all cores when unset
    pub threads: Option<usize>,
    /// spill each sample's counts to disk after loading
    pub spill_dir: Option<PathBuf>,
    pub progress: bool,
    /// gzip the TSV outputs
    pub compress: bool,
    /// also write `embedding.parquet`
    pub parquet: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            outlier_k: DEFAULT_OUTLIER_K,
            two_sided: false,
            metrics: Metric::ALL.to_vec(),
            mito_prefixes: DEFAULT_MITO_PREFIXES.iter().map(|p| p.to_string()).collect(),
            normalization: NormalizationMethod::default(),
            n_features: DEFAULT_N_FEATURES,
            sketch_budget: DEFAULT_SKETCH_BUDGET,
            sketch_rank: DEFAULT_SKETCH_RANK,
            mix_alpha: DEFAULT_MIX_ALPHA,
            seed: DEFAULT_SEED,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            oversampling: DEFAULT_OVERSAMPLING,
            factorization_timeout_secs: None,
            integration_dims: DEFAULT_INTEGRATION_DIMS,
            projection: ProjectionMethod::default(),
            consistency_tolerance: DEFAULT_CONSISTENCY_TOLERANCE,
            block_size: DEFAULT_BLOCK_SIZE,
            threads: None,
            spill_dir: None,
            progress: false,
            compress: false,
            parquet: false,
        }
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(ScSketchError::Configuration(msg))
}

impl PipelineConfig {
    ///
    /// Load a configuration from a TOML, YAML or JSON file (chosen by
    /// extension) and validate it.
    ///
    pub fn from_path(path: &Path) -> Result<Self> {
        let kind = ConfigFileType::from_path(path)?;
        let text = read_to_string(path)?;
        let parse_error = |reason: String| ScSketchError::Parse {
            path: path.display().to_string(),
            reason,
        };

        let config: PipelineConfig = match kind {
            ConfigFileType::Toml => toml::from_str(&text).map_err(|e| parse_error(e.to_string()))?,
            ConfigFileType::Yaml => {
                serde_yaml::from_str(&text).map_err(|e| parse_error(e.to_string()))?
            }
            ConfigFileType::Json => {
                serde_json::from_str(&text).map_err(|e| parse_error(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.outlier_k.is_finite() && self.outlier_k > 0.0) {
            return invalid(format!("outlier_k must be positive, got {}", self.outlier_k));
        }
        if self.metrics.is_empty() {
            return invalid("at least one QC metric is required".to_string());
        }
        for (name, value) in [
            ("sketch_budget", self.sketch_budget),
            ("sketch_rank", self.sketch_rank),
            ("integration_dims", self.integration_dims),
            ("n_features", self.n_features),
            ("block_size", self.block_size),
            ("max_iterations", self.max_iterations),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be at least 1"));
            }
        }
        if !(0.0..=1.0).contains(&self.mix_alpha) {
            return invalid(format!("mix_alpha must lie in [0, 1], got {}", self.mix_alpha));
        }
        if self.integration_dims > self.sketch_rank {
            return invalid(format!(
                "integration_dims ({}) can't exceed sketch_rank ({})",
                self.integration_dims, self.sketch_rank
            ));
        }
        for (name, value) in [
            ("tolerance", self.tolerance),
            ("consistency_tolerance", self.consistency_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("{name} must be positive, got {value}"));
            }
        }
        if let Some(secs) = self.factorization_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid(format!(
                    "factorization_timeout_secs must be positive, got {secs}"
                ));
            }
            if let Err(e) = Duration::try_from_secs_f64(secs) {
                return invalid(format!("factorization_timeout_secs = {secs}: {e}"));
            }
        }
        if let ProjectionMethod::Neighbors { k: 0 } = self.projection {
            return invalid("neighbors projection needs k >= 1".to_string());
        }
        if self.threads == Some(0) {
            return invalid("threads must be at least 1 when set".to_string());
        }
        if self.parquet && !cfg!(feature = "parquet") {
            return invalid("parquet output requires the `parquet` feature".to_string());
        }
        self.normalization.validate()
    }

    /// `None` when unset or not representable; `validate` rejects the latter.
    pub fn factorization_timeout(&self) -> Option<Duration> {
        self.factorization_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn sketch_options(&self) -> SketchOptions {
        SketchOptions {
            budget: self.sketch_budget,
            rank: self.sketch_rank,
            mix_alpha: self.mix_alpha,
            seed: self.seed,
            block_size: self.block_size,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            oversampling: self.oversampling,
            timeout: self.factorization_timeout(),
            dense_threshold: DENSE_EIGEN_THRESHOLD,
        }
    }

    pub fn eigen_params(&self) -> EigenParams {
        EigenParams {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            oversampling: self.oversampling,
            timeout: self.factorization_timeout(),
            dense_threshold: DENSE_EIGEN_THRESHOLD,
            seed: self.seed,
        }
    }
}

impl TryFrom<&Path> for PipelineConfig {
    type Error = ScSketchError;

    fn try_from(path: &Path) -> Result<Self> {
        PipelineConfig::from_path(path)
    }
}

/// JSON schema of [`PipelineConfig`].
#[cfg(feature = "schema")]
pub fn config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(PipelineConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use pretty_assertions::assert_eq;
    use rstest::*;
    use tempfile::NamedTempFile;

    fn write_config(suffix: &str, body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[rstest]
    fn test_empty_toml_is_default() {
        let file = write_config(".toml", "");
        let config = PipelineConfig::from_path(file.path()).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[rstest]
    fn test_toml_with_tagged_methods() {
        let file = write_config(
            ".toml",
            r#"
outlier_k = 2.5
sketch_budget = 200
sketch_rank = 20
integration_dims = 10
metrics = ["total_counts", "percent_mito"]

[normalization]
method = "pearson_residuals"
theta = 50.0

[projection]
method = "neighbors"
k = 7
"#,
        );
        let config = PipelineConfig::try_from(file.path()).unwrap();
        assert_eq!(config.outlier_k, 2.5);
        assert_eq!(config.metrics, vec![Metric::TotalCounts, Metric::PercentMito]);
        assert_eq!(
            config.normalization,
            NormalizationMethod::PearsonResiduals {
                theta: 50.0,
                clip: None
            }
        );
        assert_eq!(config.projection, ProjectionMethod::Neighbors { k: 7 });
        assert_eq!(config.sketch_options().budget, 200);
    }

    #[rstest]
    fn test_yaml() {
        let file = write_config(
            ".yaml",
            "seed: 7\nmix_alpha: 0.5\nnormalization:\n  method: log_normalize\n",
        );
        let config = PipelineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.mix_alpha, 0.5);
        assert_eq!(config.normalization, NormalizationMethod::log_normalize());
    }

    #[rstest]
    fn test_unknown_field_is_parse_error() {
        let file = write_config(".toml", "sketch_budgt = 10\n");
        let err = PipelineConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ScSketchError::Parse { .. }));
    }

    #[rstest]
    fn test_unknown_extension() {
        let file = write_config(".ini", "");
        assert!(matches!(
            PipelineConfig::from_path(file.path()),
            Err(ScSketchError::Configuration(_))
        ));
    }

    #[rstest]
    #[case(PipelineConfig { outlier_k: 0.0, ..Default::default() })]
    #[case(PipelineConfig { outlier_k: f64::NAN, ..Default::default() })]
    #[case(PipelineConfig { sketch_budget: 0, ..Default::default() })]
    #[case(PipelineConfig { sketch_rank: 0, ..Default::default() })]
    #[case(PipelineConfig { mix_alpha: 1.5, ..Default::default() })]
    #[case(PipelineConfig { mix_alpha: -0.1, ..Default::default() })]
    #[case(PipelineConfig { integration_dims: 0, ..Default::default() })]
    #[case(PipelineConfig { sketch_rank: 10, integration_dims: 11, ..Default::default() })]
    #[case(PipelineConfig { block_size: 0, ..Default::default() })]
    #[case(PipelineConfig { tolerance: 0.0, ..Default::default() })]
    #[case(PipelineConfig { consistency_tolerance: -1.0, ..Default::default() })]
    #[case(PipelineConfig { threads: Some(0), ..Default::default() })]
    #[case(PipelineConfig { metrics: vec![], ..Default::default() })]
    #[case(PipelineConfig { factorization_timeout_secs: Some(0.0), ..Default::default() })]
    #[case(PipelineConfig { factorization_timeout_secs: Some(1e300), ..Default::default() })]
    #[case(PipelineConfig { factorization_timeout_secs: Some(f64::INFINITY), ..Default::default() })]
    #[case(PipelineConfig { projection: ProjectionMethod::Neighbors { k: 0 }, ..Default::default() })]
    #[case(PipelineConfig {
        normalization: NormalizationMethod::LogNormalize { scale_factor: 0.0 },
        ..Default::default()
    })]
    fn test_invalid_configs(#[case] config: PipelineConfig) {
        assert!(matches!(
            config.validate(),
            Err(ScSketchError::Configuration(_))
        ));
    }

    #[rstest]
    fn test_oversized_timeout_does_not_panic() {
        let config = PipelineConfig {
            factorization_timeout_secs: Some(1e300),
            ..Default::default()
        };
        assert_eq!(config.factorization_timeout(), None);
        assert_eq!(config.sketch_options().timeout, None);
    }

    #[rstest]
    fn test_timeout_in_seconds() {
        let config = PipelineConfig {
            factorization_timeout_secs: Some(2.5),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.factorization_timeout(), Some(Duration::from_millis(2500)));
    }

    #[rstest]
    fn test_default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
