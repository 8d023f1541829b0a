//! Robust median/MAD outlier bounds.

use log::warn;
use ndarray::Array2;

use scsketch_core::consts::MAD_SCALE;
use scsketch_core::utils::{median, median_abs_deviation};
use scsketch_core::{Result, ScSketchError, Stage};

use crate::metrics::{Metric, MetricTable};

///
/// Accept/reject bounds for one metric of one sample.
///
/// A bound of `None` is absent and never enforced. Thresholds are derived
/// values: they are recomputed as a whole, never edited.
///
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MetricThreshold {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub median: f64,
    /// scaled MAD
    pub mad: f64,
    /// zero spread: the metric is not used for filtering
    pub degenerate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierThresholder {
    k: f64,
    two_sided: bool,
}

impl Default for OutlierThresholder {
    fn default() -> Self {
        Self {
            k: scsketch_core::consts::DEFAULT_OUTLIER_K,
            two_sided: false,
        }
    }
}

impl OutlierThresholder {
    pub fn new(k: f64, two_sided: bool) -> Self {
        Self { k, two_sided }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    ///
    /// Compute `median +/- k * 1.4826 * MAD` for `values`, clipped to the
    /// metric's domain. Returns `None` for empty input.
    ///
    pub fn compute(&self, values: &[f64], metric: Metric) -> Option<MetricThreshold> {
        let center = median(values)?;
        let mad = MAD_SCALE * median_abs_deviation(values, center)?;

        if mad == 0.0 {
            return Some(MetricThreshold {
                lower: None,
                upper: None,
                median: center,
                mad,
                degenerate: true,
            });
        }

        let (floor, ceiling) = metric.domain();
        let lower = center - self.k * mad;
        let upper = center + self.k * mad;

        Some(MetricThreshold {
            lower: (lower >= floor).then_some(lower),
            upper: Some(ceiling.map_or(upper, |c| upper.min(c))),
            median: center,
            mad,
            degenerate: false,
        })
    }

    pub fn is_outlier(&self, threshold: &MetricThreshold, value: f64) -> bool {
        let above = threshold.upper.is_some_and(|u| value > u);
        let below = self.two_sided && threshold.lower.is_some_and(|l| value < l);
        above || below
    }

    ///
    /// Thresholds for every metric of a sample plus the per-cell outlier flags
    /// (cells x metrics).
    ///
    pub fn apply(&self, table: &MetricTable) -> Result<SampleThresholds> {
        if table.n_cells() == 0 {
            return Err(ScSketchError::sample_failure(
                &table.sample_id,
                Stage::Thresholds,
                "sample has no cells",
            ));
        }

        let mut entries = Vec::with_capacity(table.metrics.len());
        let mut flags = Array2::from_elem((table.n_cells(), table.metrics.len()), false);

        for (j, metric) in table.metrics.iter().enumerate() {
            let column = table.values.column(j).to_vec();
            let threshold = self.compute(&column, *metric).ok_or_else(|| {
                ScSketchError::sample_failure(&table.sample_id, Stage::Thresholds, "empty metric")
            })?;

            if threshold.degenerate {
                warn!(
                    "{}; skipping it for filtering",
                    ScSketchError::DegenerateMetric {
                        sample: table.sample_id.clone(),
                        metric: metric.to_string(),
                    }
                );
            } else {
                for (i, value) in column.iter().enumerate() {
                    flags[[i, j]] = self.is_outlier(&threshold, *value);
                }
            }

            entries.push((*metric, threshold));
        }

        Ok(SampleThresholds {
            sample_id: table.sample_id.clone(),
            entries,
            flags,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleThresholds {
    pub sample_id: String,
    pub entries: Vec<(Metric, MetricThreshold)>,
    /// cells x metrics, true where the cell is an outlier for the metric
    pub flags: Array2<bool>,
}

impl SampleThresholds {
    pub fn get(&self, metric: Metric) -> Option<&MetricThreshold> {
        self.entries
            .iter()
            .find(|(m, _)| *m == metric)
            .map(|(_, t)| t)
    }

    /// OR over all metrics.
    pub fn is_outlier(&self, cell: usize) -> bool {
        self.flags.row(cell).iter().any(|f| *f)
    }

    pub fn degenerate_metrics(&self) -> Vec<Metric> {
        self.entries
            .iter()
            .filter(|(_, t)| t.degenerate)
            .map(|(m, _)| *m)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::*;

    const EPS: f64 = 1e-9;

    #[rstest]
    fn test_bounds_are_median_plus_minus_k_mad() {
        // median 120, raw MAD 1
        let values: Vec<f64> = (0..100).map(|i| 118.0 + (i % 5) as f64).collect();
        let t = OutlierThresholder::new(3.0, false)
            .compute(&values, Metric::TotalCounts)
            .unwrap();

        assert_eq!(t.median, 120.0);
        assert!((t.mad - 1.4826).abs() < EPS);
        assert!((t.upper.unwrap() - (120.0 + 3.0 * 1.4826)).abs() < EPS);
        assert!((t.lower.unwrap() - (120.0 - 3.0 * 1.4826)).abs() < EPS);
        assert!(!t.degenerate);
    }

    #[rstest]
    fn test_negative_lower_bound_is_absent() {
        let values = vec![0.0, 1.0, 2.0, 10.0, 20.0];
        let t = OutlierThresholder::default()
            .compute(&values, Metric::DetectedFeatures)
            .unwrap();
        assert_eq!(t.lower, None);
        assert!(t.upper.is_some());
    }

    #[rstest]
    fn test_percent_upper_bound_is_clipped() {
        let values = vec![20.0, 70.0, 80.0, 90.0, 99.0];
        let t = OutlierThresholder::default()
            .compute(&values, Metric::PercentMito)
            .unwrap();
        assert_eq!(t.upper, Some(100.0));
    }

    #[rstest]
    fn test_zero_mad_never_flags() {
        let table = MetricTable {
            sample_id: "s1".to_string(),
            metrics: vec![Metric::DetectedFeatures],
            values: Array2::from_shape_vec((5, 1), vec![12.0, 12.0, 12.0, 12.0, 400.0]).unwrap(),
        };
        let thresholds = OutlierThresholder::new(3.0, true).apply(&table).unwrap();

        assert_eq!(thresholds.degenerate_metrics(), vec![Metric::DetectedFeatures]);
        assert!((0..5).all(|i| !thresholds.is_outlier(i)));
    }

    #[rstest]
    #[case(false, vec![false, false, false, false, false, false, true])]
    #[case(true, vec![true, false, false, false, false, false, true])]
    fn test_one_and_two_sided(#[case] two_sided: bool, #[case] expected: Vec<bool>) {
        // median 120, raw MAD 2: bounds 120 +/- 8.8956
        let values = vec![100.0, 118.0, 119.0, 120.0, 121.0, 122.0, 300.0];
        let table = MetricTable {
            sample_id: "s1".to_string(),
            metrics: vec![Metric::TotalCounts],
            values: Array2::from_shape_vec((7, 1), values).unwrap(),
        };
        let thresholds = OutlierThresholder::new(3.0, two_sided).apply(&table).unwrap();
        let flags: Vec<bool> = (0..7).map(|i| thresholds.is_outlier(i)).collect();

        assert_eq!(flags, expected);
    }

    #[rstest]
    fn test_empty_sample_is_sample_failure() {
        let table = MetricTable {
            sample_id: "empty".to_string(),
            metrics: vec![Metric::TotalCounts],
            values: Array2::zeros((0, 1)),
        };
        let err = OutlierThresholder::default().apply(&table).unwrap_err();
        assert!(err.is_sample_failure());
    }
}
