//! Error types for bioassay analysis.

use std::fmt;

use thiserror::Error;

/// Position of an observation within a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationIndex {
    /// Zero-based index into the treated observations
    Treated(usize),
    /// The (pooled) control observation
    Control,
}

impl fmt::Display for ObservationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationIndex::Treated(index) => write!(f, "#{index}"),
            ObservationIndex::Control => write!(f, "control"),
        }
    }
}

/// Failures reported by the estimation pipeline.
///
/// All variants are deterministic numerical or validation failures; none are
/// retried internally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BioassayError {
    /// An observation violates the dataset contract.
    #[error("invalid observation {location}: {reason}")]
    InvalidObservation {
        location: ObservationIndex,
        reason: String,
    },

    /// Too few distinct positive doses to estimate intercept and slope.
    #[error("insufficient data: {distinct_doses} distinct positive dose(s), at least 2 required")]
    InsufficientData { distinct_doses: usize },

    /// The responses carry no information about the slope.
    #[error("degenerate data: {reason}")]
    DegenerateData { reason: String },

    /// Newton iterations hit the cap while the log-likelihood was still moving.
    #[error("fit did not converge after {iterations} iterations (last log-likelihood change {last_change:e})")]
    FitDidNotConverge { iterations: usize, last_change: f64 },

    /// Responses separate perfectly in dose so the slope diverges.
    #[error("perfect separation: {detail}")]
    PerfectSeparation { detail: String },

    /// Target percentile outside (0, 100).
    #[error("invalid percentile {percentile}: must lie strictly between 0 and 100")]
    InvalidPercentile { percentile: f64 },

    /// Slope is not significantly different from zero.
    #[error("model is not monotonic: slope {slope} has standard error {standard_error}")]
    ModelNotMonotonic { slope: f64, standard_error: f64 },

    /// Resistance ratios need LC values at matching response levels.
    #[error("incompatible percentiles: test LC{test} vs reference LC{reference}")]
    IncompatiblePercentiles { test: f64, reference: f64 },

    /// A configuration value is out of range.
    #[error("invalid configuration for `{parameter}`: {reason}")]
    InvalidConfiguration {
        parameter: &'static str,
        reason: String,
    },
}

/// Result type alias for bioassay operations.
pub type Result<T> = std::result::Result<T, BioassayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_identify_location() {
        let err = BioassayError::InvalidObservation {
            location: ObservationIndex::Treated(3),
            reason: "12 responding out of 10 tested".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid observation #3: 12 responding out of 10 tested"
        );

        let err = BioassayError::InvalidObservation {
            location: ObservationIndex::Control,
            reason: "all subjects responded".to_string(),
        };
        assert!(err.to_string().contains("control"));
    }
}
