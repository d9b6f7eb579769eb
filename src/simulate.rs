use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Distribution};

use crate::{
    dataset::{DoseResponseDataset, Observation},
    error::{BioassayError, Result},
    probit::ProbitParameters,
};

/// Simulates a bioassay from known probit parameters.
///
/// Every dose group (and the control group, when `control_tested` is given)
/// draws binomial responses with `n_tested` subjects. Draws are reproducible
/// for a given `seed`.
pub fn simulate_dataset(
    parameters: &ProbitParameters,
    doses: &[f64],
    n_tested: u64,
    control_tested: Option<u64>,
    seed: u64,
) -> Result<DoseResponseDataset> {
    if !(0.0..1.0).contains(&parameters.natural_response) {
        return Err(BioassayError::InvalidConfiguration {
            parameter: "natural_response",
            reason: format!("{} is not in [0, 1)", parameters.natural_response),
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut draw = |n: u64, dose: f64| -> Result<Observation> {
        let p = parameters.response_probability(dose);
        let binomial = Binomial::new(n, p).map_err(|err| BioassayError::InvalidConfiguration {
            parameter: "doses",
            reason: format!("cannot draw responses at dose {dose}: {err}"),
        })?;
        Ok(Observation::new(dose, n, binomial.sample(&mut rng)))
    };

    let observations = doses
        .iter()
        .map(|&dose| draw(n_tested, dose))
        .collect::<Result<Vec<_>>>()?;
    let control = control_tested.map(|n| draw(n, 0.0)).transpose()?;

    DoseResponseDataset::new(observations, control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_is_reproducible() -> anyhow::Result<()> {
        let parameters = ProbitParameters::new(-1.0, 2.0, 0.05);
        let doses = [0.5, 1.0, 2.0, 4.0];
        let a = simulate_dataset(&parameters, &doses, 100, Some(100), 9)?;
        let b = simulate_dataset(&parameters, &doses, 100, Some(100), 9)?;
        assert_eq!(a.observations(), b.observations());
        assert_eq!(a.control(), b.control());
        Ok(())
    }

    #[test]
    fn test_simulated_proportions_follow_model() -> anyhow::Result<()> {
        let parameters = ProbitParameters::new(0.0, 1.0, 0.0);
        let dataset = simulate_dataset(&parameters, &[0.1, 1.0, 10.0], 100_000, None, 1)?;
        for observation in dataset.observations() {
            let expected = parameters.response_probability(observation.dose);
            assert!((observation.proportion() - expected).abs() < 0.01);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_natural_response() {
        let parameters = ProbitParameters::new(0.0, 1.0, 1.0);
        assert!(matches!(
            simulate_dataset(&parameters, &[1.0, 2.0], 10, None, 0),
            Err(BioassayError::InvalidConfiguration { .. })
        ));
    }
}
