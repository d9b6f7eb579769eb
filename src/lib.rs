//! Bioassay: probit analysis of insecticide dose-response data
//!
//! This library fits probit dose-response models to mortality counts from
//! susceptibility bioassays, estimates lethal concentrations with confidence
//! intervals, and compares strains with resistance ratios.
//!
//! The main components of this library are:
//! - `DoseResponseDataset`: Validated dose groups of a single strain
//! - `ProbitModel`: Maximum likelihood probit fit with natural response handling
//! - `GoodnessOfFit`: Pearson chi-square heterogeneity of a fit
//! - `LCEstimator`: Lethal concentrations with Fieller confidence intervals
//! - `ResistanceRatioCalculator`: Test versus reference strain comparison
//! - `DiagnosticDoseClassifier`: Susceptibility status at a discriminating dose
//! - `Bioassay`: Batch analysis of many strains against a reference
//! - `BioassayResults`: Structure to hold and display the batch results

mod analysis;
mod config;
mod dataset;
mod diagnostic;
mod error;
mod goodness;
mod lc;
mod math;
mod probit;
mod resistance;
mod results;
mod simulate;
mod utils;

pub use analysis::{Bioassay, StrainRecord};
pub use config::{
    DiagnosticConfig, EstimateConfig, FitConfig, IntervalMethod, NaturalResponse, RatioConfig,
    TransformConfig,
};
pub use dataset::{DoseResponseDataset, Observation};
pub use diagnostic::{DiagnosticDoseClassifier, DiagnosticResult, Susceptibility};
pub use error::{BioassayError, ObservationIndex, Result};
pub use goodness::{GoodnessOfFit, HeterogeneityResult};
pub use lc::{IntervalKind, LCEstimator, LCResult};
pub use probit::{FittedProbitModel, ProbitModel, ProbitParameters};
pub use resistance::{ResistanceRatioCalculator, ResistanceRatioResult};
pub use results::{BioassayResults, RatioResult, StrainAnalysis, StrainResult};
pub use simulate::simulate_dataset;
