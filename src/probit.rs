//! Maximum-likelihood probit regression of response on log-dose.
//!
//! The response probability at dose `d` is
//!
//! ```text
//! P(d) = c + (1 - c) * Φ(intercept + slope * ln d)
//! ```
//!
//! where `c` is the natural (background) response rate. `c` is either held
//! at the control proportion (Abbott's correction) or estimated jointly as a
//! third parameter.
//!
//! The binomial log-likelihood is maximized with Fisher scoring on the score
//! equations, halving the step whenever a full step would lower the
//! likelihood. The covariance of the estimates is the inverse expected
//! information at the optimum.

use derive_new::new;
use itertools::Itertools;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::{
    config::{FitConfig, NaturalResponse},
    dataset::{DoseResponseDataset, Observation},
    error::{BioassayError, Result},
    math::{
        abbott_correction, binomial_log_likelihood, clamp_probability, normal_cdf, normal_pdf,
        normal_quantile, simple_linear_regression,
    },
    utils::pool_by_dose,
};

/// Largest number of step halvings tried along one scoring direction.
const MAX_STEP_HALVINGS: usize = 40;

/// Upper bound on the natural response rate while it is estimated.
const MAX_NATURAL_RESPONSE: f64 = 0.99;

/// Seed bounds for a free natural response rate when no control is available.
const NATURAL_SEED_RANGE: (f64, f64) = (1e-3, 0.5);

/// Parameters of a probit dose-response curve.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct ProbitParameters {
    pub intercept: f64,
    pub slope: f64,
    pub natural_response: f64,
}

impl ProbitParameters {
    /// Probability of response at `dose`, including natural response.
    ///
    /// Doses at or below zero respond at the natural rate only.
    pub fn response_probability(&self, dose: f64) -> f64 {
        if dose <= 0.0 {
            return self.natural_response;
        }
        let eta = self.intercept + self.slope * dose.ln();
        self.natural_response + (1.0 - self.natural_response) * normal_cdf(eta)
    }

    fn step(&self, direction: &DVector<f64>, scale: f64) -> Self {
        let natural_response = if direction.len() > 2 {
            (self.natural_response + scale * direction[2]).clamp(0.0, MAX_NATURAL_RESPONSE)
        } else {
            self.natural_response
        };
        Self {
            intercept: self.intercept + scale * direction[0],
            slope: self.slope + scale * direction[1],
            natural_response,
        }
    }
}

/// A converged probit fit.
///
/// `covariance` holds the variances and covariance of (intercept, slope) in
/// that order. It is not inflated for heterogeneity; see
/// [`crate::HeterogeneityResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct FittedProbitModel {
    pub intercept: f64,
    pub slope: f64,
    pub covariance: [[f64; 2]; 2],
    pub natural_response_rate: f64,
    /// Whether the natural response rate was estimated by the fit
    pub natural_response_free: bool,
    /// Sampling variance of the natural response rate when it was estimated
    pub natural_response_variance: Option<f64>,
    pub log_likelihood: f64,
    pub n_observations: usize,
    pub iterations: usize,
}

impl FittedProbitModel {
    pub fn parameters(&self) -> ProbitParameters {
        ProbitParameters::new(self.intercept, self.slope, self.natural_response_rate)
    }

    /// Number of estimated parameters (2, or 3 with a free natural response)
    pub fn n_parameters(&self) -> usize {
        if self.natural_response_free {
            3
        } else {
            2
        }
    }

    /// Probit of the treatment-attributable response at `dose`
    pub fn linear_predictor(&self, dose: f64) -> f64 {
        self.intercept + self.slope * dose.ln()
    }

    /// Expected response proportion at `dose`, natural response included
    pub fn predict(&self, dose: f64) -> f64 {
        self.parameters().response_probability(dose)
    }

    pub fn intercept_standard_error(&self) -> f64 {
        self.covariance[0][0].sqrt()
    }

    pub fn slope_standard_error(&self) -> f64 {
        self.covariance[1][1].sqrt()
    }

    /// Fitted curve sampled at `points` log-spaced doses over `[min_dose, max_dose]`.
    ///
    /// Returns `(dose, expected proportion)` pairs; empty when the range is not
    /// positive.
    pub fn curve(&self, min_dose: f64, max_dose: f64, points: usize) -> Vec<(f64, f64)> {
        if points == 0 || min_dose <= 0.0 || max_dose < min_dose {
            return Vec::new();
        }
        if points == 1 {
            return vec![(min_dose, self.predict(min_dose))];
        }
        let (lo, hi) = (min_dose.ln(), max_dose.ln());
        let step = (hi - lo) / (points - 1) as f64;
        (0..points)
            .map(|i| {
                let dose = (lo + step * i as f64).exp();
                (dose, self.predict(dose))
            })
            .collect()
    }
}

/// Fits probit dose-response models.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbitModel {
    config: FitConfig,
}

impl ProbitModel {
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit the probit model to `dataset` by maximum likelihood.
    ///
    /// # Errors
    ///
    /// * `DegenerateData` when no dose shows any variation in response, or the
    ///   information matrix is singular.
    /// * `PerfectSeparation` when the responses switch from none to all at a
    ///   dose boundary, with at most one partial group on the boundary, or the
    ///   slope diverges during the iterations.
    /// * `FitDidNotConverge` when the iteration cap is reached while the
    ///   log-likelihood is still changing by more than the tolerance, or when
    ///   step halving finds no ascent although the scoring step predicts one.
    pub fn fit(&self, dataset: &DoseResponseDataset) -> Result<FittedProbitModel> {
        self.config.validate()?;
        check_degenerate(dataset)?;
        check_separation(dataset)?;

        let free = self.config.natural_response == NaturalResponse::Free;
        let likelihood = Likelihood::new(dataset, free);
        let natural_seed = if free {
            free_natural_seed(dataset)
        } else {
            dataset.control_proportion()
        };
        let seed = seed_parameters(dataset, natural_seed);
        debug!(
            "probit seed: intercept={:.6} slope={:.6} natural={:.4}",
            seed.intercept, seed.slope, seed.natural_response
        );

        let (parameters, evaluation, iterations) = match self.iterate(&likelihood, seed)? {
            FitOutcome::Converged {
                parameters,
                evaluation,
                iterations,
            } => (parameters, evaluation, iterations),
            FitOutcome::DidNotConverge {
                iterations,
                last_change,
            } => {
                warn!(
                    "probit fit stopped after {iterations} iterations, log-likelihood still changing by {last_change:e}"
                );
                return Err(BioassayError::FitDidNotConverge {
                    iterations,
                    last_change,
                });
            }
            FitOutcome::PerfectSeparation { slope } => {
                return Err(BioassayError::PerfectSeparation {
                    detail: format!(
                        "slope magnitude {:e} exceeded the divergence bound {:e}",
                        slope.abs(),
                        self.config.separation_bound
                    ),
                });
            }
        };

        let Evaluation {
            log_likelihood,
            information,
            ..
        } = evaluation;
        let inverse = information
            .try_inverse()
            .filter(|inverse| {
                inverse
                    .diagonal()
                    .iter()
                    .all(|variance| *variance > 0.0 && variance.is_finite())
            })
            .ok_or_else(|| BioassayError::DegenerateData {
                reason: format!(
                    "information matrix is singular at intercept {} and slope {}",
                    parameters.intercept, parameters.slope
                ),
            })?;

        Ok(FittedProbitModel {
            intercept: parameters.intercept,
            slope: parameters.slope,
            covariance: [
                [inverse[(0, 0)], inverse[(0, 1)]],
                [inverse[(1, 0)], inverse[(1, 1)]],
            ],
            natural_response_rate: parameters.natural_response,
            natural_response_free: free,
            natural_response_variance: free.then(|| inverse[(2, 2)]),
            log_likelihood,
            n_observations: dataset.n_observations(),
            iterations,
        })
    }

    /// Runs bounded Fisher scoring from `seed`.
    fn iterate(&self, likelihood: &Likelihood, seed: ProbitParameters) -> Result<FitOutcome> {
        let mut parameters = seed;
        let mut current = likelihood.evaluate(&parameters);
        let mut last_change = f64::INFINITY;

        for iteration in 1..=self.config.max_iterations {
            let direction = solve_direction(&current, &parameters)?;
            let Some((candidate, evaluation)) =
                line_search(likelihood, &parameters, &direction, current.log_likelihood)
            else {
                // Half the Newton decrement estimates the gain still available.
                let remaining = 0.5 * current.score.dot(&direction);
                debug!(
                    "iteration {iteration}: no ascent along the scoring direction, \
                     estimated remaining gain {remaining:e}"
                );
                if remaining < self.config.tolerance {
                    return Ok(FitOutcome::Converged {
                        parameters,
                        evaluation: current,
                        iterations: iteration,
                    });
                }
                return Ok(FitOutcome::DidNotConverge {
                    iterations: iteration,
                    last_change: remaining,
                });
            };

            let change = evaluation.log_likelihood - current.log_likelihood;
            parameters = candidate;
            current = evaluation;
            debug!(
                "iteration {iteration}: loglik={:.10} change={change:e} intercept={:.6} slope={:.6} natural={:.4}",
                current.log_likelihood,
                parameters.intercept,
                parameters.slope,
                parameters.natural_response
            );

            let slope = parameters.slope;
            if !slope.is_finite() || slope.abs() > self.config.separation_bound {
                return Ok(FitOutcome::PerfectSeparation { slope });
            }
            if change.abs() < self.config.tolerance {
                return Ok(FitOutcome::Converged {
                    parameters,
                    evaluation: current,
                    iterations: iteration,
                });
            }
            last_change = change;
        }

        Ok(FitOutcome::DidNotConverge {
            iterations: self.config.max_iterations,
            last_change,
        })
    }
}

/// Terminal state of the scoring iterations.
enum FitOutcome {
    Converged {
        parameters: ProbitParameters,
        evaluation: Evaluation,
        iterations: usize,
    },
    DidNotConverge {
        iterations: usize,
        last_change: f64,
    },
    PerfectSeparation {
        slope: f64,
    },
}

/// A binomial cell in log-dose space.
#[derive(Debug, Clone, Copy)]
struct Cell {
    log_dose: f64,
    tested: f64,
    responding: f64,
}

/// Log-likelihood, score and expected information at a parameter point.
#[derive(Debug, Clone)]
struct Evaluation {
    log_likelihood: f64,
    score: DVector<f64>,
    information: DMatrix<f64>,
}

struct Likelihood {
    cells: Vec<Cell>,
    control: Option<Cell>,
    free: bool,
}

impl Likelihood {
    fn new(dataset: &DoseResponseDataset, free: bool) -> Self {
        let cells = dataset
            .observations()
            .iter()
            .map(|o| Cell {
                log_dose: o.dose.ln(),
                tested: o.n_tested as f64,
                responding: o.n_responding as f64,
            })
            .collect();
        let control = dataset.control().map(|o| Cell {
            log_dose: f64::NEG_INFINITY,
            tested: o.n_tested as f64,
            responding: o.n_responding as f64,
        });
        Self {
            cells,
            control,
            free,
        }
    }

    fn n_parameters(&self) -> usize {
        if self.free {
            3
        } else {
            2
        }
    }

    fn evaluate(&self, parameters: &ProbitParameters) -> Evaluation {
        let k = self.n_parameters();
        let c = parameters.natural_response;
        let mut log_likelihood = 0.0;
        let mut score = DVector::zeros(k);
        let mut information = DMatrix::zeros(k, k);

        for cell in &self.cells {
            let eta = parameters.intercept + parameters.slope * cell.log_dose;
            let cdf = normal_cdf(eta);
            let density = normal_pdf(eta);
            let p = clamp_probability(c + (1.0 - c) * cdf);
            log_likelihood += binomial_log_likelihood(cell.responding, cell.tested, p);

            // dp/d(intercept, slope, natural)
            let gradient = [
                (1.0 - c) * density,
                (1.0 - c) * density * cell.log_dose,
                1.0 - cdf,
            ];
            let variance = p * (1.0 - p);
            let residual_weight = (cell.responding - cell.tested * p) / variance;
            let information_weight = cell.tested / variance;
            for j in 0..k {
                score[j] += residual_weight * gradient[j];
                for l in 0..k {
                    information[(j, l)] += information_weight * gradient[j] * gradient[l];
                }
            }
        }

        if self.free {
            if let Some(control) = &self.control {
                let p = clamp_probability(c);
                let variance = p * (1.0 - p);
                log_likelihood += binomial_log_likelihood(control.responding, control.tested, p);
                score[2] += (control.responding - control.tested * p) / variance;
                information[(2, 2)] += control.tested / variance;
            }
        }

        Evaluation {
            log_likelihood,
            score,
            information,
        }
    }
}

/// Scoring direction `I⁻¹ U` at the current point.
///
/// A free natural response already at one of its bounds, with the full
/// direction pointing past it, is held fixed and only the intercept and slope
/// move.
fn solve_direction(evaluation: &Evaluation, parameters: &ProbitParameters) -> Result<DVector<f64>> {
    let direction = solve_system(&evaluation.information, &evaluation.score).and_then(|full| {
        if full.len() > 2 && pushes_past_bound(parameters.natural_response, full[2]) {
            let information = evaluation.information.view((0, 0), (2, 2)).into_owned();
            let score = evaluation.score.rows(0, 2).into_owned();
            solve_system(&information, &score)
                .map(|reduced| DVector::from_vec(vec![reduced[0], reduced[1], 0.0]))
        } else {
            Some(full)
        }
    });
    direction
        .filter(|direction| direction.iter().all(|v| v.is_finite()))
        .ok_or_else(|| BioassayError::DegenerateData {
            reason: format!(
                "information matrix is singular at intercept {} and slope {}",
                parameters.intercept, parameters.slope
            ),
        })
}

fn solve_system(information: &DMatrix<f64>, score: &DVector<f64>) -> Option<DVector<f64>> {
    match information.clone().cholesky() {
        Some(cholesky) => Some(cholesky.solve(score)),
        None => information.clone().lu().solve(score),
    }
}

fn pushes_past_bound(natural_response: f64, step: f64) -> bool {
    (natural_response <= 0.0 && step < 0.0)
        || (natural_response >= MAX_NATURAL_RESPONSE && step > 0.0)
}

/// Step-halving search for a point that does not lower the log-likelihood.
fn line_search(
    likelihood: &Likelihood,
    parameters: &ProbitParameters,
    direction: &DVector<f64>,
    baseline: f64,
) -> Option<(ProbitParameters, Evaluation)> {
    let mut scale = 1.0;
    for _ in 0..MAX_STEP_HALVINGS {
        let candidate = parameters.step(direction, scale);
        let evaluation = likelihood.evaluate(&candidate);
        if evaluation.log_likelihood.is_finite() && evaluation.log_likelihood >= baseline {
            return Some((candidate, evaluation));
        }
        scale *= 0.5;
    }
    None
}

/// Empirical-probit regression seed.
///
/// Cells whose (Abbott-corrected) proportion is 0 or 1 are left out. When
/// fewer than two distinct doses remain, continuity-adjusted proportions of
/// every cell are used instead.
fn seed_parameters(dataset: &DoseResponseDataset, natural_response: f64) -> ProbitParameters {
    let (x, y): (Vec<f64>, Vec<f64>) = dataset
        .observations()
        .iter()
        .filter_map(|o| {
            let p = abbott_correction(o.proportion(), natural_response);
            (p > 0.0 && p < 1.0).then(|| (o.dose.ln(), normal_quantile(p)))
        })
        .unzip();

    let (intercept, slope) = simple_linear_regression(&x, &y)
        .or_else(|| {
            let (x, y): (Vec<f64>, Vec<f64>) = dataset
                .observations()
                .iter()
                .map(|o| {
                    let adjusted = (o.n_responding as f64 + 0.5) / (o.n_tested as f64 + 1.0);
                    let p = abbott_correction(adjusted, natural_response).clamp(1e-3, 1.0 - 1e-3);
                    (o.dose.ln(), normal_quantile(p))
                })
                .unzip();
            simple_linear_regression(&x, &y)
        })
        .unwrap_or((0.0, 1.0));

    ProbitParameters::new(intercept, slope, natural_response)
}

/// Starting natural response rate for a joint fit.
fn free_natural_seed(dataset: &DoseResponseDataset) -> f64 {
    if dataset.control().is_some() {
        return dataset.control_proportion().min(MAX_NATURAL_RESPONSE);
    }
    let lowest = dataset
        .observations()
        .iter()
        .map(|o| o.proportion())
        .fold(f64::INFINITY, f64::min);
    (lowest / 2.0).clamp(NATURAL_SEED_RANGE.0, NATURAL_SEED_RANGE.1)
}

fn check_degenerate(dataset: &DoseResponseDataset) -> Result<()> {
    let observations = dataset.observations();
    if observations.iter().all(|o| o.n_responding == 0) {
        return Err(BioassayError::DegenerateData {
            reason: format!("no response at any of {} doses", observations.len()),
        });
    }
    if observations.iter().all(|o| o.n_responding == o.n_tested) {
        return Err(BioassayError::DegenerateData {
            reason: format!("complete response at all {} doses", observations.len()),
        });
    }
    Ok(())
}

/// Response state of a pooled dose group, ordered from none to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CellResponse {
    Zero,
    Partial,
    Complete,
}

impl CellResponse {
    fn of(observation: &Observation) -> Self {
        if observation.n_responding == 0 {
            CellResponse::Zero
        } else if observation.n_responding == observation.n_tested {
            CellResponse::Complete
        } else {
            CellResponse::Partial
        }
    }
}

/// Detects doses that split into no-response and complete-response groups,
/// where the likelihood has no finite maximum.
///
/// Complete separation has no partial group between the two sides. Quasi
/// separation allows a single partial group at the boundary dose, which the
/// slope can still only match in the limit.
fn check_separation(dataset: &DoseResponseDataset) -> Result<()> {
    let pooled = pool_by_dose(dataset.observations());
    let states = pooled.iter().map(CellResponse::of).collect::<Vec<_>>();
    let partial = doses_with(&pooled, &states, CellResponse::Partial);
    if partial.len() > 1 || states.iter().all_equal() {
        return Ok(());
    }

    let rising = states.iter().tuple_windows().all(|(a, b)| a <= b);
    let falling = states.iter().tuple_windows().all(|(a, b)| a >= b);
    let none = doses_with(&pooled, &states, CellResponse::Zero);
    let complete = doses_with(&pooled, &states, CellResponse::Complete);

    let detail = match (partial.first(), rising, falling) {
        (_, false, false) => return Ok(()),
        (Some(boundary), true, _) => {
            format!("no response below dose {boundary} and complete response above it")
        }
        (Some(boundary), false, true) => {
            format!("complete response below dose {boundary} and no response above it")
        }
        (None, true, _) => format!(
            "no response at doses up to {} and complete response from dose {}",
            none[none.len() - 1],
            complete[0]
        ),
        (None, false, true) => format!(
            "complete response at doses up to {} and no response from dose {}",
            complete[complete.len() - 1],
            none[0]
        ),
    };
    Err(BioassayError::PerfectSeparation { detail })
}

/// Sorted doses of the pooled groups in `state`
fn doses_with(pooled: &[Observation], states: &[CellResponse], state: CellResponse) -> Vec<f64> {
    pooled
        .iter()
        .zip(states)
        .filter(|(_, s)| **s == state)
        .map(|(observation, _)| observation.dose)
        .collect()
}
