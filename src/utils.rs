use itertools::Itertools;

use crate::{analysis::StrainRecord, dataset::Observation};

/// Sorted distinct doses of the given observations
pub fn distinct_doses(observations: &[Observation]) -> Vec<f64> {
    observations
        .iter()
        .map(|observation| observation.dose)
        .sorted_by(f64::total_cmp)
        .dedup()
        .collect()
}

/// Pools observations sharing a dose, sorted by dose.
pub fn pool_by_dose(observations: &[Observation]) -> Vec<Observation> {
    observations
        .iter()
        .sorted_by(|a, b| a.dose.total_cmp(&b.dose))
        .chunk_by(|observation| observation.dose)
        .into_iter()
        .map(|(dose, group)| {
            let (n_tested, n_responding) = group.fold((0, 0), |(tested, responding), o| {
                (tested + o.n_tested, responding + o.n_responding)
            });
            Observation::new(dose, n_tested, n_responding)
        })
        .collect()
}

/// Groups records by strain, keeping each strain's records in input order.
///
/// Strains are returned in order of first appearance.
pub fn group_by_strain(records: &[StrainRecord]) -> Vec<(&str, Vec<&StrainRecord>)> {
    let strains = records
        .iter()
        .map(|record| record.strain.as_str())
        .unique()
        .collect::<Vec<_>>();
    let mut groups = records
        .iter()
        .into_group_map_by(|record| record.strain.as_str());
    strains
        .into_iter()
        .map(|strain| (strain, groups.remove(strain).unwrap_or_default()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_doses_sorted() {
        let observations = vec![
            Observation::new(2.0, 10, 1),
            Observation::new(1.0, 10, 1),
            Observation::new(2.0, 10, 3),
        ];
        assert_eq!(distinct_doses(&observations), vec![1.0, 2.0]);
    }

    #[test]
    fn test_pool_by_dose() {
        let observations = vec![
            Observation::new(2.0, 10, 1),
            Observation::new(1.0, 10, 1),
            Observation::new(2.0, 10, 3),
        ];
        let pooled = pool_by_dose(&observations);
        assert_eq!(
            pooled,
            vec![Observation::new(1.0, 10, 1), Observation::new(2.0, 20, 4)]
        );
    }

    #[test]
    fn test_group_by_strain() {
        let records = vec![
            StrainRecord::new("kisumu".to_string(), 1.0, 10, 2),
            StrainRecord::new("tiassale".to_string(), 1.0, 10, 0),
            StrainRecord::new("kisumu".to_string(), 2.0, 10, 6),
        ];
        let groups = group_by_strain(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "kisumu");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[1].dose, 2.0);
        assert_eq!(groups[1].0, "tiassale");
    }
}
