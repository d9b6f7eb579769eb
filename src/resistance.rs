//! Resistance ratios between a test strain and a susceptible reference.

use crate::{
    config::RatioConfig,
    error::{BioassayError, Result},
    lc::LCResult,
    math::{critical_value, normal_cdf},
};

/// Tolerance when matching the percentiles of two LC results.
const PERCENTILE_TOLERANCE: f64 = 1e-9;

/// Ratio of a test LC to a reference LC at the same percentile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResistanceRatioResult {
    pub percentile: f64,
    pub ratio: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// The interval excludes 1
    pub significant: bool,
    /// Two-sided z-test of `ln(ratio) = 0`
    pub p_value: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResistanceRatioCalculator {
    config: RatioConfig,
}

impl ResistanceRatioCalculator {
    pub fn new(config: RatioConfig) -> Self {
        Self { config }
    }

    /// Resistance ratio `test / reference`.
    ///
    /// The two estimates are treated as independent and log-normal, each with
    /// a standard error recovered from its interval width. An unbounded input
    /// interval gives an unbounded, non-significant ratio.
    pub fn compute(&self, test: &LCResult, reference: &LCResult) -> Result<ResistanceRatioResult> {
        self.config.validate()?;
        if (test.percentile - reference.percentile).abs() > PERCENTILE_TOLERANCE {
            return Err(BioassayError::IncompatiblePercentiles {
                test: test.percentile,
                reference: reference.percentile,
            });
        }

        let ratio = test.dose_estimate / reference.dose_estimate;
        let log_ratio = ratio.ln();

        let (Some(test_se), Some(reference_se)) =
            (test.log_standard_error(), reference.log_standard_error())
        else {
            return Ok(ResistanceRatioResult {
                percentile: test.percentile,
                ratio,
                ci_lower: 0.0,
                ci_upper: f64::INFINITY,
                significant: false,
                p_value: 1.0,
            });
        };

        let standard_error = (test_se * test_se + reference_se * reference_se).sqrt();
        let z = critical_value(self.config.confidence_level, None)?;
        let ci_lower = (log_ratio - z * standard_error).exp();
        let ci_upper = (log_ratio + z * standard_error).exp();
        let p_value = if standard_error > 0.0 {
            2.0 * (1.0 - normal_cdf(log_ratio.abs() / standard_error))
        } else if log_ratio == 0.0 {
            1.0
        } else {
            0.0
        };

        Ok(ResistanceRatioResult {
            percentile: test.percentile,
            ratio,
            ci_lower,
            ci_upper,
            significant: !(ci_lower <= 1.0 && 1.0 <= ci_upper),
            p_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lc::IntervalKind;
    use approx::assert_relative_eq;

    fn lc(percentile: f64, dose: f64, lower: f64, upper: f64) -> LCResult {
        LCResult {
            percentile,
            dose_estimate: dose,
            ci_lower: lower,
            ci_upper: upper,
            confidence_level: 0.95,
            critical_value: 1.96,
            interval: IntervalKind::Fieller,
        }
    }

    #[test]
    fn test_identical_results_are_not_significant() -> anyhow::Result<()> {
        let result = lc(50.0, 3.2, 2.5, 4.1);
        let ratio = ResistanceRatioCalculator::default().compute(&result, &result)?;
        assert_eq!(ratio.ratio, 1.0);
        assert!(!ratio.significant);
        assert!(ratio.ci_lower < 1.0 && ratio.ci_upper > 1.0);
        assert_relative_eq!(ratio.p_value, 1.0);
        Ok(())
    }

    #[test]
    fn test_resistant_strain() -> anyhow::Result<()> {
        let test = lc(50.0, 10.0, 8.0, 12.5);
        let reference = lc(50.0, 1.0, 0.8, 1.25);
        let ratio = ResistanceRatioCalculator::default().compute(&test, &reference)?;
        assert_relative_eq!(ratio.ratio, 10.0, epsilon = 1e-12);
        assert_relative_eq!(ratio.ci_lower, 7.293753194939757, epsilon = 1e-6);
        assert_relative_eq!(ratio.ci_upper, 13.710362460492608, epsilon = 1e-6);
        assert!(ratio.significant);
        assert!(ratio.p_value < 1e-6);
        Ok(())
    }

    #[test]
    fn test_mismatched_percentiles() {
        let test = lc(90.0, 10.0, 8.0, 12.5);
        let reference = lc(50.0, 1.0, 0.8, 1.25);
        assert_eq!(
            ResistanceRatioCalculator::default()
                .compute(&test, &reference)
                .unwrap_err(),
            BioassayError::IncompatiblePercentiles {
                test: 90.0,
                reference: 50.0
            }
        );
    }

    #[test]
    fn test_unbounded_input_gives_unbounded_ratio() -> anyhow::Result<()> {
        let mut test = lc(50.0, 10.0, 0.0, f64::INFINITY);
        test.interval = IntervalKind::Unbounded;
        let reference = lc(50.0, 1.0, 0.8, 1.25);
        let ratio = ResistanceRatioCalculator::default().compute(&test, &reference)?;
        assert_relative_eq!(ratio.ratio, 10.0, epsilon = 1e-12);
        assert_eq!(ratio.ci_lower, 0.0);
        assert!(ratio.ci_upper.is_infinite());
        assert!(!ratio.significant);
        Ok(())
    }

    #[test]
    fn test_ratio_below_one_is_significant_too() -> anyhow::Result<()> {
        let test = lc(50.0, 1.0, 0.8, 1.25);
        let reference = lc(50.0, 10.0, 8.0, 12.5);
        let ratio = ResistanceRatioCalculator::default().compute(&test, &reference)?;
        assert_relative_eq!(ratio.ratio, 0.1, epsilon = 1e-12);
        assert!(ratio.ci_upper < 1.0);
        assert!(ratio.significant);
        Ok(())
    }
}
