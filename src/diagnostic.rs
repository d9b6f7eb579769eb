//! Diagnostic-dose susceptibility classification.
//!
//! A population exposed to a single discriminating dose is classified from
//! its mortality alone; no dose-response model is fitted.

use std::fmt;

use crate::{
    config::DiagnosticConfig,
    dataset::validate_counts,
    error::{BioassayError, ObservationIndex, Result},
    math::{abbott_correction, critical_value},
};

/// Susceptibility status of a tested population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Susceptibility {
    Susceptible,
    PossibleResistance,
    Resistant,
}

impl fmt::Display for Susceptibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Susceptibility::Susceptible => write!(f, "susceptible"),
            Susceptibility::PossibleResistance => write!(f, "possible resistance"),
            Susceptibility::Resistant => write!(f, "resistant"),
        }
    }
}

/// Mortality at the diagnostic dose, in percent, and the resulting status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosticResult {
    pub n_tested: u64,
    pub n_responding: u64,
    pub mortality: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Mortality was corrected for control mortality with Abbott's formula
    pub corrected: bool,
    pub status: Susceptibility,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticDoseClassifier {
    config: DiagnosticConfig,
}

impl DiagnosticDoseClassifier {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self { config }
    }

    /// Status for a mortality percentage.
    pub fn status(&self, mortality: f64) -> Susceptibility {
        if mortality >= self.config.susceptible_threshold {
            Susceptibility::Susceptible
        } else if mortality <= self.config.resistant_threshold {
            Susceptibility::Resistant
        } else {
            Susceptibility::PossibleResistance
        }
    }

    /// Classifies raw mortality counts at the diagnostic dose.
    ///
    /// The interval is a Student t interval on the mortality proportion with
    /// `n_tested - 1` degrees of freedom, clamped to [0, 100].
    pub fn classify(&self, n_tested: u64, n_responding: u64) -> Result<DiagnosticResult> {
        self.config.validate()?;
        validate_counts(n_tested, n_responding, ObservationIndex::Treated(0))?;

        let (mortality, ci_lower, ci_upper) = self.mortality_interval(n_tested, n_responding)?;
        Ok(DiagnosticResult {
            n_tested,
            n_responding,
            mortality,
            ci_lower,
            ci_upper,
            corrected: false,
            status: self.status(mortality),
        })
    }

    /// Classifies mortality counts alongside an unexposed control group.
    ///
    /// Control mortality at or above the correction threshold is removed with
    /// Abbott's formula; above the maximum the test is rejected.
    pub fn classify_with_control(
        &self,
        n_tested: u64,
        n_responding: u64,
        control_tested: u64,
        control_responding: u64,
    ) -> Result<DiagnosticResult> {
        validate_counts(control_tested, control_responding, ObservationIndex::Control)?;
        let uncorrected = self.classify(n_tested, n_responding)?;

        let control_mortality = 100.0 * control_responding as f64 / control_tested as f64;
        if control_mortality > self.config.max_control_mortality
            || control_responding == control_tested
        {
            return Err(BioassayError::InvalidObservation {
                location: ObservationIndex::Control,
                reason: format!(
                    "control mortality {control_mortality:.1}% exceeds {}%",
                    self.config.max_control_mortality
                ),
            });
        }
        if control_mortality < self.config.correction_threshold {
            return Ok(uncorrected);
        }

        let natural = control_mortality / 100.0;
        let correct =
            |percent: f64| (100.0 * abbott_correction(percent / 100.0, natural)).clamp(0.0, 100.0);
        let mortality = correct(uncorrected.mortality);
        Ok(DiagnosticResult {
            mortality,
            ci_lower: correct(uncorrected.ci_lower),
            ci_upper: correct(uncorrected.ci_upper),
            corrected: true,
            status: self.status(mortality),
            ..uncorrected
        })
    }

    fn mortality_interval(&self, n_tested: u64, n_responding: u64) -> Result<(f64, f64, f64)> {
        let n = n_tested as f64;
        let mortality = 100.0 * n_responding as f64 / n;
        let p = n_responding as f64 / n;
        let standard_error = (p * (1.0 - p) / n).sqrt();
        if standard_error == 0.0 {
            return Ok((mortality, mortality, mortality));
        }
        let t = critical_value(
            self.config.confidence_level,
            Some(n_tested.saturating_sub(1) as usize),
        )?;
        let lower = (100.0 * (p - t * standard_error)).max(0.0);
        let upper = (100.0 * (p + t * standard_error)).min(100.0);
        Ok((mortality, lower, upper))
    }
}
