use bon::Builder;
use derive_new::new;
use itertools::Itertools;
use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    config::{EstimateConfig, FitConfig, RatioConfig, TransformConfig},
    dataset::{DoseResponseDataset, Observation},
    error::{BioassayError, Result},
    goodness::GoodnessOfFit,
    lc::{validate_percentile, LCEstimator},
    probit::ProbitModel,
    resistance::ResistanceRatioCalculator,
    results::{BioassayResults, RatioResult, StrainAnalysis, StrainResult},
    utils::group_by_strain,
};

/// A single dose group of a named strain, as read from a bioassay sheet.
///
/// Rows with a dose of zero are the strain's control.
#[derive(Debug, Clone, PartialEq, new)]
pub struct StrainRecord {
    pub strain: String,
    pub dose: f64,
    pub n_tested: u64,
    pub n_responding: u64,
}

/// Probit analysis of every strain in a bioassay.
///
/// Each strain is fitted independently. When a reference strain is named,
/// every other strain is compared against it with resistance ratios at each
/// requested percentile.
#[derive(Builder)]
pub struct Bioassay<'a> {
    records: &'a [StrainRecord],
    /// Susceptible strain the resistance ratios are computed against
    reference: Option<&'a str>,
    #[builder(default = vec![50.0, 90.0])]
    percentiles: Vec<f64>,
    #[builder(default)]
    fit_config: FitConfig,
    #[builder(default)]
    estimate_config: EstimateConfig,
    #[builder(default)]
    ratio_config: RatioConfig,
    /// Adjustment of the ratio p-values across strains at each percentile
    #[builder(default)]
    transform: TransformConfig,
}

impl Bioassay<'_> {
    /// Run the analysis
    ///
    /// 1. Group the records by strain
    /// 2. Fit and estimate each strain
    /// 3. Compare each strain against the reference
    /// 4. Adjust the ratio p-values per percentile
    ///
    /// A strain whose analysis fails is reported in the results and does not
    /// stop the others.
    ///
    /// # Errors
    ///
    /// * `InvalidPercentile` or `InvalidConfiguration` before any fitting.
    /// * `InvalidConfiguration` when the reference strain has no records.
    pub fn run(&self) -> Result<BioassayResults> {
        self.validate()?;

        let groups = group_by_strain(self.records);
        if let Some(reference) = self.reference {
            if !groups.iter().any(|(strain, _)| *strain == reference) {
                return Err(BioassayError::InvalidConfiguration {
                    parameter: "reference",
                    reason: format!("no records for strain {reference}"),
                });
            }
        }

        let strain_results = groups
            .par_iter()
            .map(|(strain, records)| StrainResult {
                strain: strain.to_string(),
                analysis: self.analyze_strain(strain, records),
            })
            .collect::<Vec<_>>();

        let mut ratios = match self.reference {
            Some(reference) => self.compare_to_reference(reference, &strain_results)?,
            None => Vec::new(),
        };
        self.adjust_pvalues(&mut ratios);

        Ok(BioassayResults::from_vec(strain_results, ratios))
    }

    fn validate(&self) -> Result<()> {
        self.fit_config.validate()?;
        self.estimate_config.validate()?;
        self.ratio_config.validate()?;
        self.percentiles
            .iter()
            .try_for_each(|&percentile| validate_percentile(percentile))
    }

    /// Fits a single strain and estimates its LC values
    fn analyze_strain(&self, strain: &str, records: &[&StrainRecord]) -> Result<StrainAnalysis> {
        let observations = records
            .iter()
            .map(|record| Observation::new(record.dose, record.n_tested, record.n_responding))
            .collect();
        let result = DoseResponseDataset::new(observations, None).and_then(|dataset| {
            let model = ProbitModel::new(self.fit_config).fit(&dataset)?;
            let heterogeneity = GoodnessOfFit::compute(&model, &dataset);
            let lc_values = LCEstimator::new(self.estimate_config).estimate_many(
                &model,
                &heterogeneity,
                &self.percentiles,
            )?;
            Ok(StrainAnalysis {
                model,
                heterogeneity,
                lc_values,
            })
        });

        match &result {
            Ok(analysis) => debug!(
                "{strain}: slope {} after {} iterations, heterogeneity factor {}",
                analysis.model.slope,
                analysis.model.iterations,
                analysis.heterogeneity.heterogeneity_factor
            ),
            Err(err) => warn!("{strain}: analysis failed: {err}"),
        }
        result
    }

    /// Resistance ratios of every analyzed strain against the reference
    fn compare_to_reference(
        &self,
        reference: &str,
        strain_results: &[StrainResult],
    ) -> Result<Vec<RatioResult>> {
        let reference_analysis = strain_results
            .iter()
            .find(|result| result.strain == reference)
            .and_then(|result| result.analysis.as_ref().ok());
        let Some(reference_analysis) = reference_analysis else {
            warn!("reference strain {reference} could not be analyzed, no ratios computed");
            return Ok(Vec::new());
        };

        let calculator = ResistanceRatioCalculator::new(self.ratio_config);
        let mut ratios = Vec::new();
        for result in strain_results {
            if result.strain == reference {
                continue;
            }
            let Ok(analysis) = &result.analysis else {
                continue;
            };
            let pairs = analysis.lc_values.iter().zip(&reference_analysis.lc_values);
            for (test, reference_lc) in pairs {
                let ratio = calculator.compute(test, reference_lc)?;
                ratios.push(RatioResult::new(
                    result.strain.clone(),
                    reference.to_string(),
                    ratio,
                ));
            }
        }
        Ok(ratios)
    }

    /// Adjusts the p-values of all ratios sharing a percentile together
    fn adjust_pvalues(&self, ratios: &mut [RatioResult]) {
        let by_percentile = (0..ratios.len())
            .into_group_map_by(|&index| ratios[index].ratio.percentile.to_bits());
        for indices in by_percentile.into_values() {
            let pvalues = indices
                .iter()
                .map(|&index| ratios[index].ratio.p_value)
                .collect::<Vec<_>>();
            let adjusted = self.transform.transform(&pvalues);
            for (index, pvalue) in indices.into_iter().zip(adjusted) {
                ratios[index].adjusted_p_value = pvalue;
            }
        }
    }
}
