use std::f64::consts::{PI, SQRT_2};

use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::{BioassayError, Result};

/// Probabilities are kept this far away from 0 and 1 inside log-likelihoods.
pub const PROBABILITY_EPS: f64 = 1e-12;

/// Standard normal cumulative distribution function.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal density.
pub fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

/// Standard normal quantile (the probit of `p`).
pub fn normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

pub fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROBABILITY_EPS, 1.0 - PROBABILITY_EPS)
}

/// Binomial log-likelihood kernel `r ln p + (n - r) ln(1 - p)`.
pub fn binomial_log_likelihood(responding: f64, tested: f64, p: f64) -> f64 {
    let p = clamp_probability(p);
    responding * p.ln() + (tested - responding) * (1.0 - p).ln()
}

/// Two-sided critical value at `confidence_level`.
///
/// Uses the standard normal unless degrees of freedom are given, in which
/// case Student's t is used.
pub fn critical_value(confidence_level: f64, degrees_of_freedom: Option<usize>) -> Result<f64> {
    let upper = 1.0 - (1.0 - confidence_level) / 2.0;
    match degrees_of_freedom {
        Some(df) if df > 0 => {
            let dist = StudentsT::new(0.0, 1.0, df as f64).map_err(|err| {
                BioassayError::InvalidConfiguration {
                    parameter: "degrees_of_freedom",
                    reason: err.to_string(),
                }
            })?;
            Ok(dist.inverse_cdf(upper))
        }
        _ => Ok(normal_quantile(upper)),
    }
}

/// Ordinary least squares fit of `y = intercept + slope * x`.
///
/// Returns `None` when `x` has no spread.
pub fn simple_linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.len() < 2 || x.len() != y.len() {
        return None;
    }
    let x_mean = arithmetic_mean(x);
    let y_mean = arithmetic_mean(y);
    let (sxy, sxx) = x
        .iter()
        .zip(y.iter())
        .fold((0.0, 0.0), |(sxy, sxx), (xi, yi)| {
            let dx = xi - x_mean;
            (sxy + dx * (yi - y_mean), sxx + dx * dx)
        });
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some((y_mean - slope * x_mean, slope))
}

pub fn arithmetic_mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Abbott's correction of a response proportion for background rate `c`.
pub fn abbott_correction(proportion: f64, natural_response: f64) -> f64 {
    (proportion - natural_response) / (1.0 - natural_response)
}
