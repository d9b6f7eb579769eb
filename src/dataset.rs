use derive_new::new;

use crate::{
    error::{BioassayError, ObservationIndex, Result},
    utils::distinct_doses,
};

/// A single dose group: subjects exposed at `dose` and how many responded.
///
/// A dose of zero marks a control group.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct Observation {
    pub dose: f64,
    pub n_tested: u64,
    pub n_responding: u64,
}

impl Observation {
    /// Observed response proportion
    pub fn proportion(&self) -> f64 {
        self.n_responding as f64 / self.n_tested as f64
    }

    pub fn is_control(&self) -> bool {
        self.dose == 0.0
    }

    fn validate(&self, location: ObservationIndex) -> Result<()> {
        let violation = if !self.dose.is_finite() {
            Some(format!("dose {} is not finite", self.dose))
        } else if self.dose < 0.0 {
            Some(format!("dose {} is negative", self.dose))
        } else {
            count_violation(self.n_tested, self.n_responding)
                .map(|reason| format!("{reason} at dose {}", self.dose))
        };
        match violation {
            Some(reason) => Err(BioassayError::InvalidObservation { location, reason }),
            None => Ok(()),
        }
    }

    /// Sums the counts of two observations at the same dose.
    fn pool(&self, other: &Observation) -> Observation {
        Observation::new(
            self.dose,
            self.n_tested + other.n_tested,
            self.n_responding + other.n_responding,
        )
    }
}

fn count_violation(n_tested: u64, n_responding: u64) -> Option<String> {
    if n_tested == 0 {
        Some("no subjects tested".to_string())
    } else if n_responding > n_tested {
        Some(format!("{n_responding} responding out of {n_tested} tested"))
    } else {
        None
    }
}

/// Checks that a group tested subjects and that responders do not exceed them.
pub(crate) fn validate_counts(
    n_tested: u64,
    n_responding: u64,
    location: ObservationIndex,
) -> Result<()> {
    match count_violation(n_tested, n_responding) {
        Some(reason) => Err(BioassayError::InvalidObservation { location, reason }),
        None => Ok(()),
    }
}

/// Validated dose-response observations for a single strain and compound.
///
/// Treated observations keep their input order. Zero-dose rows are pooled
/// into the control and never enter the log-dose transform.
#[derive(Debug, Clone)]
pub struct DoseResponseDataset {
    observations: Vec<Observation>,
    control: Option<Observation>,
}

impl DoseResponseDataset {
    /// Builds a dataset from treated observations and an optional control.
    ///
    /// # Errors
    ///
    /// * `InvalidObservation` for a negative or non-finite dose, an empty
    ///   group, more responders than subjects, a control with non-zero dose,
    ///   or a control in which every subject responded.
    /// * `InsufficientData` when fewer than two distinct positive doses remain.
    pub fn new(observations: Vec<Observation>, control: Option<Observation>) -> Result<Self> {
        let mut pooled_control = None;
        if let Some(control) = control {
            control.validate(ObservationIndex::Control)?;
            if !control.is_control() {
                return Err(BioassayError::InvalidObservation {
                    location: ObservationIndex::Control,
                    reason: format!("control dose must be zero, got {}", control.dose),
                });
            }
            pooled_control = Some(control);
        }

        let mut treated = Vec::with_capacity(observations.len());
        for (index, observation) in observations.into_iter().enumerate() {
            observation.validate(ObservationIndex::Treated(index))?;
            if observation.is_control() {
                pooled_control = Some(match pooled_control {
                    Some(control) => observation.pool(&control),
                    None => observation,
                });
            } else {
                treated.push(observation);
            }
        }

        if let Some(control) = &pooled_control {
            if control.n_responding == control.n_tested {
                return Err(BioassayError::InvalidObservation {
                    location: ObservationIndex::Control,
                    reason: format!(
                        "all {} control subjects responded; natural response cannot be corrected",
                        control.n_tested
                    ),
                });
            }
        }

        let n_distinct = distinct_doses(&treated).len();
        if n_distinct < 2 {
            return Err(BioassayError::InsufficientData {
                distinct_doses: n_distinct,
            });
        }

        Ok(Self {
            observations: treated,
            control: pooled_control,
        })
    }

    /// Builds a dataset from raw `(dose, n_tested, n_responding)` triples and
    /// optional `(n_tested, n_responding)` control counts.
    pub fn from_counts<I>(triples: I, control: Option<(u64, u64)>) -> Result<Self>
    where
        I: IntoIterator<Item = (f64, u64, u64)>,
    {
        let observations = triples
            .into_iter()
            .map(|(dose, n_tested, n_responding)| Observation::new(dose, n_tested, n_responding))
            .collect();
        let control = control.map(|(n_tested, n_responding)| {
            Observation::new(0.0, n_tested, n_responding)
        });
        Self::new(observations, control)
    }

    /// Treated (positive dose) observations in input order
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn control(&self) -> Option<&Observation> {
        self.control.as_ref()
    }

    /// Response proportion in the control group, 0 when there is no control.
    pub fn control_proportion(&self) -> f64 {
        self.control.map_or(0.0, |control| control.proportion())
    }

    /// Sorted distinct positive doses
    pub fn distinct_doses(&self) -> Vec<f64> {
        distinct_doses(&self.observations)
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dataset_keeps_order_and_control() -> anyhow::Result<()> {
        let dataset = DoseResponseDataset::from_counts(
            vec![(4.0, 20, 15), (1.0, 20, 2), (2.0, 20, 8)],
            Some((20, 2)),
        )?;
        let doses: Vec<f64> = dataset.observations().iter().map(|o| o.dose).collect();
        assert_eq!(doses, vec![4.0, 1.0, 2.0]);
        assert_eq!(dataset.distinct_doses(), vec![1.0, 2.0, 4.0]);
        assert_relative_eq!(dataset.control_proportion(), 0.1);
        Ok(())
    }

    #[test]
    fn test_zero_dose_rows_are_pooled_into_control() -> anyhow::Result<()> {
        let dataset = DoseResponseDataset::from_counts(
            vec![(0.0, 25, 1), (1.0, 25, 5), (0.0, 25, 3), (3.0, 25, 20)],
            Some((50, 0)),
        )?;
        assert_eq!(dataset.n_observations(), 2);
        let control = dataset.control().copied().unwrap();
        assert_eq!(control.n_tested, 100);
        assert_eq!(control.n_responding, 4);
        assert_relative_eq!(dataset.control_proportion(), 0.04);
        Ok(())
    }

    #[test]
    fn test_no_control_proportion_is_zero() -> anyhow::Result<()> {
        let dataset = DoseResponseDataset::from_counts(vec![(1.0, 10, 1), (2.0, 10, 5)], None)?;
        assert_eq!(dataset.control_proportion(), 0.0);
        assert!(dataset.control().is_none());
        Ok(())
    }

    #[test]
    fn test_more_responders_than_tested() {
        let err = DoseResponseDataset::from_counts(
            vec![(1.0, 10, 1), (2.0, 10, 12)],
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BioassayError::InvalidObservation {
                location: ObservationIndex::Treated(1),
                reason: "12 responding out of 10 tested at dose 2".to_string(),
            }
        );
    }

    #[test]
    fn test_negative_dose_and_empty_group() {
        let err =
            DoseResponseDataset::from_counts(vec![(-1.0, 10, 1), (2.0, 10, 5)], None).unwrap_err();
        assert!(matches!(
            err,
            BioassayError::InvalidObservation {
                location: ObservationIndex::Treated(0),
                ..
            }
        ));

        let err =
            DoseResponseDataset::from_counts(vec![(1.0, 10, 1), (2.0, 0, 0)], None).unwrap_err();
        assert!(matches!(
            err,
            BioassayError::InvalidObservation {
                location: ObservationIndex::Treated(1),
                ..
            }
        ));
    }

    #[test]
    fn test_single_distinct_dose_is_insufficient() {
        let err = DoseResponseDataset::from_counts(
            vec![(5.0, 1000, 100), (5.0, 1000, 900)],
            None,
        )
        .unwrap_err();
        assert_eq!(err, BioassayError::InsufficientData { distinct_doses: 1 });
    }

    #[test]
    fn test_control_must_not_be_saturated() {
        let err = DoseResponseDataset::from_counts(vec![(1.0, 10, 1), (2.0, 10, 5)], Some((10, 10)))
            .unwrap_err();
        assert!(matches!(
            err,
            BioassayError::InvalidObservation {
                location: ObservationIndex::Control,
                ..
            }
        ));
    }

    #[test]
    fn test_control_with_positive_dose_rejected() {
        let err = DoseResponseDataset::new(
            vec![Observation::new(1.0, 10, 1), Observation::new(2.0, 10, 5)],
            Some(Observation::new(0.5, 10, 0)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BioassayError::InvalidObservation {
                location: ObservationIndex::Control,
                ..
            }
        ));
    }
}
