use crate::{
    error::BioassayError,
    goodness::HeterogeneityResult,
    lc::LCResult,
    probit::FittedProbitModel,
    resistance::ResistanceRatioResult,
};

/// Fitted model, heterogeneity and LC values of a single strain.
#[derive(Debug, Clone)]
pub struct StrainAnalysis {
    pub model: FittedProbitModel,
    pub heterogeneity: HeterogeneityResult,
    /// One entry per requested percentile, in request order
    pub lc_values: Vec<LCResult>,
}
impl StrainAnalysis {
    pub fn lc(&self, percentile: f64) -> Option<&LCResult> {
        self.lc_values
            .iter()
            .find(|lc| lc.percentile == percentile)
    }
}

#[derive(Debug, Clone)]
pub struct StrainResult {
    pub strain: String,
    pub analysis: Result<StrainAnalysis, BioassayError>,
}

#[derive(Debug, Clone)]
pub struct RatioResult {
    pub strain: String,
    pub reference: String,
    pub ratio: ResistanceRatioResult,
    /// `ratio.p_value` after the multiple-comparison adjustment.
    ///
    /// Initialized to the raw p-value and adjusted per percentile once all
    /// strains are compared.
    pub adjusted_p_value: f64,
}
impl RatioResult {
    pub fn new(strain: String, reference: String, ratio: ResistanceRatioResult) -> Self {
        Self {
            strain,
            reference,
            adjusted_p_value: ratio.p_value,
            ratio,
        }
    }
}

pub struct BioassayResults {
    pub strains: Vec<StrainResult>,
    pub ratios: Vec<RatioResult>,
}
impl BioassayResults {
    pub fn from_vec(mut strains: Vec<StrainResult>, mut ratios: Vec<RatioResult>) -> Self {
        // Sort the results by strain name
        strains.sort_unstable_by(|a, b| a.strain.cmp(&b.strain));
        ratios.sort_by(|a, b| {
            a.strain
                .cmp(&b.strain)
                .then(a.ratio.percentile.total_cmp(&b.ratio.percentile))
        });
        Self { strains, ratios }
    }

    pub fn strain(&self, strain: &str) -> Option<&StrainResult> {
        self.strains.iter().find(|result| result.strain == strain)
    }

    pub fn ratio(&self, strain: &str, percentile: f64) -> Option<&RatioResult> {
        self.ratios
            .iter()
            .find(|result| result.strain == strain && result.ratio.percentile == percentile)
    }

    /// Strains whose analysis failed, with the reason
    pub fn failures(&self) -> impl Iterator<Item = (&str, &BioassayError)> {
        self.strains.iter().filter_map(|result| match &result.analysis {
            Ok(_) => None,
            Err(err) => Some((result.strain.as_str(), err)),
        })
    }

    pub fn pprint(&self) {
        println!("Strain\tPercentile\tLC\tLower\tUpper\tInterval\tSlope\tHeterogeneity\tError");
        for result in &self.strains {
            match &result.analysis {
                Ok(analysis) => {
                    for lc in &analysis.lc_values {
                        println!(
                            "{}\t{}\t{}\t{}\t{}\t{:?}\t{}\t{}\t",
                            result.strain,
                            lc.percentile,
                            lc.dose_estimate,
                            lc.ci_lower,
                            lc.ci_upper,
                            lc.interval,
                            analysis.model.slope,
                            analysis.heterogeneity.heterogeneity_factor,
                        );
                    }
                }
                Err(err) => println!("{}\t\t\t\t\t\t\t\t{}", result.strain, err),
            }
        }

        if self.ratios.is_empty() {
            return;
        }
        println!();
        println!("Strain\tReference\tPercentile\tRR\tLower\tUpper\tP-value\tAdjusted P-value\tSignificant");
        for result in &self.ratios {
            println!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                result.strain,
                result.reference,
                result.ratio.percentile,
                result.ratio.ratio,
                result.ratio.ci_lower,
                result.ratio.ci_upper,
                result.ratio.p_value,
                result.adjusted_p_value,
                result.ratio.significant,
            );
        }
    }
}
