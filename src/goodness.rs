//! Pearson chi-square goodness of fit and heterogeneity correction.

use log::debug;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::{dataset::DoseResponseDataset, math::PROBABILITY_EPS, probit::FittedProbitModel};

/// Heterogeneity of a probit fit.
///
/// `heterogeneity_factor` is `chi_square / degrees_of_freedom` floored at 1;
/// it multiplies the parameter covariance when LC intervals are computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeterogeneityResult {
    pub chi_square: f64,
    pub degrees_of_freedom: usize,
    pub heterogeneity_factor: f64,
    /// Upper-tail chi-square probability, absent without residual degrees of freedom
    pub p_value: Option<f64>,
}

impl HeterogeneityResult {
    /// A result that applies no variance inflation.
    pub fn homogeneous() -> Self {
        Self {
            chi_square: 0.0,
            degrees_of_freedom: 0,
            heterogeneity_factor: 1.0,
            p_value: None,
        }
    }

    /// Whether variance is being inflated
    pub fn is_heterogeneous(&self) -> bool {
        self.heterogeneity_factor > 1.0
    }
}

impl Default for HeterogeneityResult {
    fn default() -> Self {
        Self::homogeneous()
    }
}

pub struct GoodnessOfFit;

impl GoodnessOfFit {
    /// Pearson chi-square of `model` against the observations it was fit to.
    ///
    /// Cells whose expected proportion is numerically 0 or 1 carry no
    /// information and are skipped.
    pub fn compute(
        model: &FittedProbitModel,
        dataset: &DoseResponseDataset,
    ) -> HeterogeneityResult {
        let chi_square = Self::pearson_residuals(model, dataset)
            .iter()
            .flatten()
            .map(|residual| residual * residual)
            .sum::<f64>();
        let degrees_of_freedom = model.n_observations.saturating_sub(model.n_parameters());

        let (heterogeneity_factor, p_value) = if degrees_of_freedom > 0 {
            let p_value = ChiSquared::new(degrees_of_freedom as f64)
                .ok()
                .map(|dist| 1.0 - dist.cdf(chi_square));
            let factor = (chi_square / degrees_of_freedom as f64).max(1.0);
            (factor, p_value)
        } else {
            (1.0, None)
        };
        debug!(
            "goodness of fit: chi2={chi_square:.4} df={degrees_of_freedom} factor={heterogeneity_factor:.4}"
        );

        HeterogeneityResult {
            chi_square,
            degrees_of_freedom,
            heterogeneity_factor,
            p_value,
        }
    }

    /// Pearson residual `(r - n p) / sqrt(n p (1 - p))` for each treated
    /// observation, `None` for cells with a degenerate expectation.
    pub fn pearson_residuals(
        model: &FittedProbitModel,
        dataset: &DoseResponseDataset,
    ) -> Vec<Option<f64>> {
        dataset
            .observations()
            .iter()
            .map(|observation| {
                let p = model.predict(observation.dose);
                let variance = p * (1.0 - p);
                if variance < PROBABILITY_EPS {
                    return None;
                }
                let n = observation.n_tested as f64;
                let expected = n * p;
                Some((observation.n_responding as f64 - expected) / (n * variance).sqrt())
            })
            .collect()
    }
}
