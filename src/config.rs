use adjustp::{adjust, Procedure};
use bon::Builder;

use crate::error::{BioassayError, Result};

/// How background (natural) response is handled during the probit fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NaturalResponse {
    /// Abbott's correction with the control proportion held fixed
    /// (zero when the dataset has no control)
    #[default]
    Fixed,
    /// Natural response rate estimated jointly with intercept and slope
    Free,
}

/// Method used for LC confidence intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntervalMethod {
    #[default]
    Fieller,
    /// First-order delta method on log-dose (approximate)
    DeltaMethod,
}

/// Options for the maximum-likelihood probit fit.
#[derive(Debug, Clone, Copy, Builder)]
pub struct FitConfig {
    #[builder(default)]
    pub natural_response: NaturalResponse,
    /// Hard cap on Newton iterations
    #[builder(default = 100)]
    pub max_iterations: usize,
    /// Log-likelihood change below which the fit is converged
    #[builder(default = 1e-8)]
    pub tolerance: f64,
    /// Slope magnitude treated as divergence (perfect separation)
    #[builder(default = 1e6)]
    pub separation_bound: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(BioassayError::InvalidConfiguration {
                parameter: "max_iterations",
                reason: "at least one iteration is required".to_string(),
            });
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(BioassayError::InvalidConfiguration {
                parameter: "tolerance",
                reason: format!("{} is not a positive finite value", self.tolerance),
            });
        }
        if !(self.separation_bound > 0.0) {
            return Err(BioassayError::InvalidConfiguration {
                parameter: "separation_bound",
                reason: format!("{} is not positive", self.separation_bound),
            });
        }
        Ok(())
    }
}

/// Options for LC estimation.
#[derive(Debug, Clone, Copy, Builder)]
pub struct EstimateConfig {
    #[builder(default = 0.95)]
    pub confidence_level: f64,
    #[builder(default)]
    pub interval_method: IntervalMethod,
    /// Return an unbounded interval instead of failing when the slope is not
    /// significantly non-zero
    #[builder(default = false)]
    pub allow_unbounded: bool,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EstimateConfig {
    pub fn validate(&self) -> Result<()> {
        validate_confidence_level(self.confidence_level)
    }
}

/// Options for resistance ratio intervals.
#[derive(Debug, Clone, Copy, Builder)]
pub struct RatioConfig {
    #[builder(default = 0.95)]
    pub confidence_level: f64,
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RatioConfig {
    pub fn validate(&self) -> Result<()> {
        validate_confidence_level(self.confidence_level)
    }
}

/// Diagnostic-dose mortality bands and control handling, in percent.
///
/// The defaults follow the WHO susceptibility test bands: at least 98%
/// mortality is susceptible, 90% or less is resistant. Control mortality of
/// 5% or more triggers Abbott's correction, above 20% invalidates the test.
#[derive(Debug, Clone, Copy, Builder)]
pub struct DiagnosticConfig {
    #[builder(default = 98.0)]
    pub susceptible_threshold: f64,
    #[builder(default = 90.0)]
    pub resistant_threshold: f64,
    #[builder(default = 5.0)]
    pub correction_threshold: f64,
    #[builder(default = 20.0)]
    pub max_control_mortality: f64,
    #[builder(default = 0.95)]
    pub confidence_level: f64,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DiagnosticConfig {
    pub fn validate(&self) -> Result<()> {
        for (parameter, value) in [
            ("susceptible_threshold", self.susceptible_threshold),
            ("resistant_threshold", self.resistant_threshold),
            ("correction_threshold", self.correction_threshold),
            ("max_control_mortality", self.max_control_mortality),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(BioassayError::InvalidConfiguration {
                    parameter,
                    reason: format!("{value} is not a percentage"),
                });
            }
        }
        if self.resistant_threshold >= self.susceptible_threshold {
            return Err(BioassayError::InvalidConfiguration {
                parameter: "resistant_threshold",
                reason: format!(
                    "{} must be below the susceptible threshold {}",
                    self.resistant_threshold, self.susceptible_threshold
                ),
            });
        }
        if self.correction_threshold > self.max_control_mortality {
            return Err(BioassayError::InvalidConfiguration {
                parameter: "correction_threshold",
                reason: format!(
                    "{} must not exceed the maximum control mortality {}",
                    self.correction_threshold, self.max_control_mortality
                ),
            });
        }
        validate_confidence_level(self.confidence_level)
    }
}

/// Multiple-comparison adjustment applied to resistance ratio p-values.
#[derive(Debug, Clone, Copy, Default)]
pub enum TransformConfig {
    #[default]
    Identity,
    Fdr,
    Bonferroni,
}
impl TransformConfig {
    pub fn transform(&self, pvalues: &[f64]) -> Vec<f64> {
        if pvalues.is_empty() {
            return Vec::new();
        }
        match self {
            TransformConfig::Identity => pvalues.to_vec(),
            TransformConfig::Fdr => adjust(pvalues, Procedure::BenjaminiHochberg),
            TransformConfig::Bonferroni => adjust(pvalues, Procedure::Bonferroni),
        }
    }
}

fn validate_confidence_level(level: f64) -> Result<()> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(BioassayError::InvalidConfiguration {
            parameter: "confidence_level",
            reason: format!("{level} must lie strictly between 0 and 1"),
        })
    }
}
