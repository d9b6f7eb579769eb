//! Lethal-concentration estimates with confidence intervals.
//!
//! The log-dose producing a treatment-attributable response of `p` percent is
//! the ratio estimate `x_p = (Φ⁻¹(p / 100) - intercept) / slope`. Intervals use
//! Fieller's theorem on that ratio; the delta method is available as a
//! flagged approximation.

use log::warn;

use crate::{
    config::{EstimateConfig, IntervalMethod},
    error::{BioassayError, Result},
    goodness::HeterogeneityResult,
    math::{critical_value, normal_quantile},
    probit::FittedProbitModel,
};

/// How an LC confidence interval was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Fieller,
    /// First-order approximation
    DeltaMethod,
    /// The slope is not significantly non-zero so the dose cannot be bounded
    Unbounded,
}

/// An LC value and its confidence interval, in dose units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LCResult {
    pub percentile: f64,
    pub dose_estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub confidence_level: f64,
    /// Normal or Student t quantile the interval was built with
    pub critical_value: f64,
    pub interval: IntervalKind,
}

impl LCResult {
    /// Whether the interval is a delta-method approximation
    pub fn is_approximate(&self) -> bool {
        self.interval == IntervalKind::DeltaMethod
    }

    pub fn is_bounded(&self) -> bool {
        self.interval != IntervalKind::Unbounded
    }

    /// Standard error of `ln(dose_estimate)` implied by the interval width,
    /// assuming a log-normal estimate. `None` for unbounded intervals.
    pub fn log_standard_error(&self) -> Option<f64> {
        if !self.is_bounded() || self.ci_lower <= 0.0 || !self.ci_upper.is_finite() {
            return None;
        }
        Some((self.ci_upper.ln() - self.ci_lower.ln()) / (2.0 * self.critical_value))
    }
}

/// Covariance of (intercept, slope) after heterogeneity inflation.
#[derive(Debug, Clone, Copy)]
struct Variances {
    intercept: f64,
    cross: f64,
    slope: f64,
}

impl Variances {
    fn inflated(model: &FittedProbitModel, heterogeneity: &HeterogeneityResult) -> Self {
        let h = heterogeneity.heterogeneity_factor.max(1.0);
        Self {
            intercept: h * model.covariance[0][0],
            cross: h * model.covariance[0][1],
            slope: h * model.covariance[1][1],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LCEstimator {
    config: EstimateConfig,
}

impl LCEstimator {
    pub fn new(config: EstimateConfig) -> Self {
        Self { config }
    }

    /// LC value at `percentile` with its confidence interval.
    ///
    /// The percentile refers to response attributable to treatment, i.e.
    /// after natural response has been corrected for.
    ///
    /// # Errors
    ///
    /// * `InvalidPercentile` when `percentile` is not in (0, 100).
    /// * `ModelNotMonotonic` when the slope is not significantly non-zero at
    ///   the configured confidence level, unless unbounded intervals are
    ///   allowed.
    pub fn estimate(
        &self,
        model: &FittedProbitModel,
        heterogeneity: &HeterogeneityResult,
        percentile: f64,
    ) -> Result<LCResult> {
        self.config.validate()?;
        validate_percentile(percentile)?;

        let variances = Variances::inflated(model, heterogeneity);
        let t = self.critical_value(heterogeneity)?;
        let target = normal_quantile(percentile / 100.0);
        let log_dose = (target - model.intercept) / model.slope;

        let result =
            |dose_estimate: f64, ci_lower: f64, ci_upper: f64, interval: IntervalKind| LCResult {
                percentile,
                dose_estimate,
                ci_lower,
                ci_upper,
                confidence_level: self.config.confidence_level,
                critical_value: t,
                interval,
            };

        if let Err(err) = check_monotonic(model.slope, variances.slope, t) {
            let dose_estimate = log_dose.exp();
            if self.config.allow_unbounded && dose_estimate.is_finite() && dose_estimate > 0.0 {
                return Ok(result(dose_estimate, 0.0, f64::INFINITY, IntervalKind::Unbounded));
            }
            return Err(err);
        }
        let dose_estimate = finite_dose(log_dose, model.slope, variances.slope)?;

        let d = target - model.intercept;
        let interval = match self.config.interval_method {
            IntervalMethod::Fieller => fieller_log_interval(d, model.slope, &variances, t)
                .map(|bounds| (bounds, IntervalKind::Fieller))
                .or_else(|| {
                    warn!(
                        "Fieller interval for LC{percentile} is not finite, using the delta method"
                    );
                    delta_log_interval(log_dose, model.slope, &variances, t)
                        .map(|bounds| (bounds, IntervalKind::DeltaMethod))
                }),
            IntervalMethod::DeltaMethod => delta_log_interval(log_dose, model.slope, &variances, t)
                .map(|bounds| (bounds, IntervalKind::DeltaMethod)),
        };

        Ok(match interval {
            Some(((lower, upper), kind)) => result(dose_estimate, lower.exp(), upper.exp(), kind),
            None => result(dose_estimate, 0.0, f64::INFINITY, IntervalKind::Unbounded),
        })
    }

    /// LC values at several percentiles.
    pub fn estimate_many(
        &self,
        model: &FittedProbitModel,
        heterogeneity: &HeterogeneityResult,
        percentiles: &[f64],
    ) -> Result<Vec<LCResult>> {
        percentiles
            .iter()
            .map(|&percentile| self.estimate(model, heterogeneity, percentile))
            .collect()
    }

    /// Dose at `percentile` without an interval.
    ///
    /// Fails with `ModelNotMonotonic` under the same condition as
    /// [`LCEstimator::estimate`].
    pub fn point_estimate(
        &self,
        model: &FittedProbitModel,
        heterogeneity: &HeterogeneityResult,
        percentile: f64,
    ) -> Result<f64> {
        self.config.validate()?;
        validate_percentile(percentile)?;
        let variances = Variances::inflated(model, heterogeneity);
        let t = self.critical_value(heterogeneity)?;
        check_monotonic(model.slope, variances.slope, t)?;
        let log_dose = (normal_quantile(percentile / 100.0) - model.intercept) / model.slope;
        finite_dose(log_dose, model.slope, variances.slope)
    }

    /// Student t on the residual degrees of freedom once the variance is
    /// inflated for heterogeneity, standard normal otherwise.
    fn critical_value(&self, heterogeneity: &HeterogeneityResult) -> Result<f64> {
        let df = heterogeneity
            .is_heterogeneous()
            .then_some(heterogeneity.degrees_of_freedom);
        critical_value(self.config.confidence_level, df)
    }
}

pub(crate) fn validate_percentile(percentile: f64) -> Result<()> {
    if percentile > 0.0 && percentile < 100.0 {
        Ok(())
    } else {
        Err(BioassayError::InvalidPercentile { percentile })
    }
}

/// The slope is significant when `g = t² var(b) / b² < 1`.
fn check_monotonic(slope: f64, slope_variance: f64, t: f64) -> Result<()> {
    let g = t * t * slope_variance / (slope * slope);
    if slope != 0.0 && slope.is_finite() && g.is_finite() && g < 1.0 {
        Ok(())
    } else {
        Err(BioassayError::ModelNotMonotonic {
            slope,
            standard_error: slope_variance.sqrt(),
        })
    }
}

fn finite_dose(log_dose: f64, slope: f64, slope_variance: f64) -> Result<f64> {
    let dose = log_dose.exp();
    if dose.is_finite() && dose > 0.0 {
        Ok(dose)
    } else {
        Err(BioassayError::ModelNotMonotonic {
            slope,
            standard_error: slope_variance.sqrt(),
        })
    }
}

/// Fieller bounds on the log-dose scale.
///
/// The interval is the set of `μ` with
/// `(d - bμ)² ≤ t² Var(a + bμ)`, which is bounded when `b² > t² var(b)`.
fn fieller_log_interval(d: f64, b: f64, v: &Variances, t: f64) -> Option<(f64, f64)> {
    let t2 = t * t;
    let qa = b * b - t2 * v.slope;
    if qa <= 0.0 {
        return None;
    }
    let qb = -2.0 * (b * d + t2 * v.cross);
    let qc = d * d - t2 * v.intercept;
    let root = (qb * qb - 4.0 * qa * qc).max(0.0).sqrt();
    let lower = (-qb - root) / (2.0 * qa);
    let upper = (-qb + root) / (2.0 * qa);
    (lower.is_finite() && upper.is_finite()).then_some((lower.min(upper), lower.max(upper)))
}

/// Delta-method bounds on the log-dose scale.
fn delta_log_interval(m: f64, b: f64, v: &Variances, t: f64) -> Option<(f64, f64)> {
    let variance = (v.intercept + 2.0 * m * v.cross + m * m * v.slope) / (b * b);
    let half_width = t * variance.max(0.0).sqrt();
    (half_width.is_finite() && m.is_finite()).then_some((m - half_width, m + half_width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::DoseResponseDataset, goodness::GoodnessOfFit, probit::ProbitModel};
    use approx::assert_relative_eq;

    fn model(intercept: f64, slope: f64, covariance: [[f64; 2]; 2]) -> FittedProbitModel {
        FittedProbitModel {
            intercept,
            slope,
            covariance,
            natural_response_rate: 0.0,
            natural_response_free: false,
            natural_response_variance: None,
            log_likelihood: -10.0,
            n_observations: 5,
            iterations: 4,
        }
    }

    #[test]
    fn test_lc50_symmetric_two_point() -> anyhow::Result<()> {
        let dataset = DoseResponseDataset::from_counts(vec![(1.0, 100, 20), (4.0, 100, 80)], None)?;
        let fitted = ProbitModel::default().fit(&dataset)?;
        let heterogeneity = GoodnessOfFit::compute(&fitted, &dataset);
        let lc50 = LCEstimator::default().estimate(&fitted, &heterogeneity, 50.0)?;
        assert_relative_eq!(lc50.dose_estimate, 2.0, max_relative = 1e-4);
        assert!(lc50.ci_lower <= lc50.dose_estimate);
        assert!(lc50.dose_estimate <= lc50.ci_upper);
        assert_eq!(lc50.interval, IntervalKind::Fieller);
        assert!(!lc50.is_approximate());
        Ok(())
    }

    #[test]
    fn test_fieller_reference_interval() -> anyhow::Result<()> {
        let fitted = model(0.0, 2.0, [[0.04, 0.0], [0.0, 0.04]]);
        let heterogeneity = HeterogeneityResult::homogeneous();
        let lc50 = LCEstimator::default().estimate(&fitted, &heterogeneity, 50.0)?;
        assert_relative_eq!(lc50.dose_estimate, 1.0, epsilon = 1e-12);
        assert_relative_eq!(lc50.ci_upper, 1.2212476649975126, epsilon = 1e-9);
        assert_relative_eq!(lc50.ci_lower, 0.8188347283366448, epsilon = 1e-9);
        assert_relative_eq!(lc50.critical_value, 1.959963984540054, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_fieller_contains_delta_interval() -> anyhow::Result<()> {
        let fitted = model(-1.7, 1.2, [[0.04, -0.02], [-0.02, 0.015]]);
        let heterogeneity = HeterogeneityResult::homogeneous();
        let fieller = LCEstimator::default().estimate(&fitted, &heterogeneity, 90.0)?;
        let delta = LCEstimator::new(
            EstimateConfig::builder()
                .interval_method(IntervalMethod::DeltaMethod)
                .build(),
        )
        .estimate(&fitted, &heterogeneity, 90.0)?;
        assert_eq!(delta.interval, IntervalKind::DeltaMethod);
        assert!(delta.is_approximate());
        assert_relative_eq!(fieller.dose_estimate, delta.dose_estimate, epsilon = 1e-12);
        assert!(fieller.ci_upper > delta.ci_upper);
        assert!(fieller.ci_lower < fieller.dose_estimate);
        Ok(())
    }

    #[test]
    fn test_higher_percentile_needs_higher_dose() -> anyhow::Result<()> {
        let fitted = model(-1.7, 1.2, [[0.04, -0.02], [-0.02, 0.015]]);
        let results = LCEstimator::default().estimate_many(
            &fitted,
            &HeterogeneityResult::homogeneous(),
            &[10.0, 50.0, 90.0],
        )?;
        assert!(results[0].dose_estimate < results[1].dose_estimate);
        assert!(results[1].dose_estimate < results[2].dose_estimate);
        for result in &results {
            assert!(result.ci_lower <= result.dose_estimate);
            assert!(result.dose_estimate <= result.ci_upper);
        }
        Ok(())
    }

    #[test]
    fn test_heterogeneity_widens_interval() -> anyhow::Result<()> {
        let fitted = model(-1.7, 1.2, [[0.04, -0.02], [-0.02, 0.015]]);
        let estimator = LCEstimator::default();
        let plain = estimator.estimate(&fitted, &HeterogeneityResult::homogeneous(), 50.0)?;
        let heterogeneity = HeterogeneityResult {
            chi_square: 6.0,
            degrees_of_freedom: 3,
            heterogeneity_factor: 2.0,
            p_value: Some(0.11),
        };
        let inflated = estimator.estimate(&fitted, &heterogeneity, 50.0)?;
        assert_relative_eq!(plain.dose_estimate, inflated.dose_estimate, epsilon = 1e-12);
        assert!(inflated.ci_lower < plain.ci_lower);
        assert!(inflated.ci_upper > plain.ci_upper);
        assert!(inflated.critical_value > plain.critical_value);
        Ok(())
    }

    #[test]
    fn test_insignificant_slope_is_not_monotonic() {
        // standard error 1.0 exceeds the slope magnitude
        let fitted = model(0.1, 0.5, [[0.2, 0.0], [0.0, 1.0]]);
        let heterogeneity = HeterogeneityResult::homogeneous();
        let estimator = LCEstimator::default();
        let err = estimator
            .estimate(&fitted, &heterogeneity, 50.0)
            .unwrap_err();
        assert_eq!(
            err,
            BioassayError::ModelNotMonotonic {
                slope: 0.5,
                standard_error: 1.0
            }
        );
        assert!(matches!(
            estimator.point_estimate(&fitted, &heterogeneity, 50.0),
            Err(BioassayError::ModelNotMonotonic { .. })
        ));
    }

    #[test]
    fn test_unbounded_interval_when_allowed() -> anyhow::Result<()> {
        let fitted = model(0.1, 0.5, [[0.2, 0.0], [0.0, 1.0]]);
        let estimator = LCEstimator::new(EstimateConfig::builder().allow_unbounded(true).build());
        let result = estimator.estimate(&fitted, &HeterogeneityResult::homogeneous(), 50.0)?;
        assert_eq!(result.interval, IntervalKind::Unbounded);
        assert!(!result.is_bounded());
        assert_eq!(result.ci_lower, 0.0);
        assert!(result.ci_upper.is_infinite());
        assert_relative_eq!(result.dose_estimate, (-0.2f64).exp(), epsilon = 1e-12);
        assert!(result.log_standard_error().is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_percentile() {
        let fitted = model(-1.7, 1.2, [[0.04, -0.02], [-0.02, 0.015]]);
        let heterogeneity = HeterogeneityResult::homogeneous();
        for percentile in [0.0, 100.0, -5.0, f64::NAN] {
            assert!(matches!(
                LCEstimator::default().estimate(&fitted, &heterogeneity, percentile),
                Err(BioassayError::InvalidPercentile { .. })
            ));
        }
    }

    #[test]
    fn test_point_estimate_matches_estimate() -> anyhow::Result<()> {
        let fitted = model(-1.7, 1.2, [[0.04, -0.02], [-0.02, 0.015]]);
        let heterogeneity = HeterogeneityResult::homogeneous();
        let estimator = LCEstimator::default();
        let point = estimator.point_estimate(&fitted, &heterogeneity, 90.0)?;
        let full = estimator.estimate(&fitted, &heterogeneity, 90.0)?;
        assert_relative_eq!(point, full.dose_estimate, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_log_standard_error_from_symmetric_interval() {
        let result = LCResult {
            percentile: 50.0,
            dose_estimate: 10.0,
            ci_lower: 10.0 * (-0.392f64).exp(),
            ci_upper: 10.0 * 0.392f64.exp(),
            confidence_level: 0.95,
            critical_value: 1.96,
            interval: IntervalKind::Fieller,
        };
        assert_relative_eq!(result.log_standard_error().unwrap(), 0.2, epsilon = 1e-12);
    }
}
