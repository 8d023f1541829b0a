use std::fmt;

use thiserror::Error;

/// Pipeline stage an error or failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Stage {
    Config,
    Ingest,
    Metrics,
    Thresholds,
    Doublets,
    Filter,
    Normalize,
    Sketch,
    Integrate,
    Project,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Ingest => "ingest",
            Stage::Metrics => "metrics",
            Stage::Thresholds => "thresholds",
            Stage::Doublets => "doublets",
            Stage::Filter => "filter",
            Stage::Normalize => "normalize",
            Stage::Sketch => "sketch",
            Stage::Integrate => "integrate",
            Stage::Project => "project",
            Stage::Output => "output",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum ScSketchError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Metric `{metric}` has zero spread in sample `{sample}`")]
    DegenerateMetric { sample: String, metric: String },

    #[error("Sample `{sample}` failed during {stage}: {reason}")]
    SampleFailure {
        sample: String,
        stage: Stage,
        reason: String,
    },

    #[error("Factorization did not converge after {iterations} iterations (last relative change {change:.3e})")]
    NonConvergence { iterations: usize, change: f64 },

    #[error(
        "Cell {global_index} of sample `{sample}` deviates from its shared embedding by {deviation:.3e}"
    )]
    ConsistencyViolation {
        sample: String,
        global_index: usize,
        deviation: f64,
    },

    #[error("No samples remain after {0}")]
    NoSamplesRemaining(Stage),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Can't parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScSketchError {
    pub fn sample_failure(sample: &str, stage: Stage, reason: impl fmt::Display) -> Self {
        ScSketchError::SampleFailure {
            sample: sample.to_string(),
            stage,
            reason: reason.to_string(),
        }
    }

    /// Sample-level failures exclude one sample; everything else aborts the run.
    pub fn is_sample_failure(&self) -> bool {
        matches!(self, ScSketchError::SampleFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScSketchError>;

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Stage::Sketch, "sketch")]
    #[case(Stage::Thresholds, "thresholds")]
    #[case(Stage::Project, "project")]
    fn test_stage_display(#[case] stage: Stage, #[case] expected: &str) {
        assert_eq!(stage.to_string(), expected);
    }

    #[rstest]
    fn test_sample_failure_carries_context() {
        let err = ScSketchError::sample_failure("pbmc_a", Stage::Sketch, "no convergence");
        assert!(err.is_sample_failure());
        assert_eq!(
            err.to_string(),
            "Sample `pbmc_a` failed during sketch: no convergence"
        );
    }

    #[rstest]
    fn test_fatal_errors_are_not_sample_failures() {
        let err = ScSketchError::NoSamplesRemaining(Stage::Filter);
        assert!(!err.is_sample_failure());
        assert_eq!(err.to_string(), "No samples remain after filter");
    }
}
