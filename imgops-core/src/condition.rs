//! Matching operations against runtime options.
//!
//! Filtering happens once, before any I/O, so that a configuration which can
//! never be satisfied is reported up front instead of partway through a burn.
use std::collections::BTreeSet;

use crate::operation::Operation;
use crate::options::Options;

/// Returns `true` if every entry of `requirement` is present in `candidate`
/// with an equal value.
///
/// An empty requirement is satisfied by anything, including an empty
/// candidate. A non-empty requirement is never satisfied by an empty one.
pub fn is_subset(candidate: &Options, requirement: &Options) -> bool {
    requirement
        .iter()
        .all(|(key, value)| candidate.get(key) == Some(value))
}

/// Keeps the operations whose `when` clause is satisfied by `options`.
pub fn filter_by_options(operations: &[Operation], options: &Options) -> Vec<Operation> {
    operations
        .iter()
        .filter(|operation| is_subset(options, &operation.when))
        .cloned()
        .collect()
}

/// Lists the option names referenced by any `when` clause but absent from
/// `options`, in the order they are first seen.
pub fn missing_options(operations: &[Operation], options: &Options) -> Vec<String> {
    let mut seen = BTreeSet::new();
    operations
        .iter()
        .flat_map(|operation| operation.when.keys())
        .filter(|key| !options.contains_key(*key))
        .filter(|key| seen.insert(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Action;
    use crate::options::OptionValue;

    fn options(pairs: &[(&str, OptionValue)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn burn_when(pairs: &[(&str, OptionValue)]) -> Operation {
        Operation::new(Action::Burn { verify: false }).when(options(pairs))
    }

    #[test]
    fn empty_requirement_is_always_satisfied() {
        assert!(is_subset(&options(&[("foo", "bar".into())]), &Options::new()));
        assert!(is_subset(&Options::new(), &Options::new()));
    }

    #[test]
    fn empty_candidate_never_satisfies_a_requirement() {
        assert!(!is_subset(&Options::new(), &options(&[("foo", "bar".into())])));
    }

    #[test]
    fn subset_comparison_is_type_strict() {
        assert!(!is_subset(
            &options(&[("foo", 1.into())]),
            &options(&[("foo", "1".into())])
        ));
        assert!(is_subset(
            &options(&[("foo", 1.into()), ("bar", "x".into())]),
            &options(&[("foo", 1.into())])
        ));
        assert!(!is_subset(
            &options(&[("foo", 2.into())]),
            &options(&[("foo", 1.into())])
        ));
    }

    #[test]
    fn filter_keeps_unconditional_and_matching_operations() {
        let operations = vec![
            Operation::new(Action::Burn { verify: true }),
            burn_when(&[("network", "wifi".into())]),
            burn_when(&[("network", "ethernet".into())]),
            burn_when(&[("network", "wifi".into()), ("slot", 1.into())]),
        ];
        let opts = options(&[("network", "wifi".into()), ("slot", 1.into())]);

        let kept = filter_by_options(&operations, &opts);
        assert_eq!(kept, vec![
            operations[0].clone(),
            operations[1].clone(),
            operations[3].clone(),
        ]);
    }

    #[test]
    fn missing_options_reports_absent_names_once() {
        let operations = vec![burn_when(&[("foo", 1.into())])];
        assert_eq!(
            missing_options(&operations, &options(&[("bar", 2.into())])),
            vec!["foo".to_string()]
        );
        assert!(missing_options(&[], &Options::new()).is_empty());

        let operations = vec![
            burn_when(&[("network", "wifi".into())]),
            burn_when(&[("variant", "a".into()), ("network", "wifi".into())]),
            burn_when(&[("drive", "/dev/sdb".into())]),
        ];
        assert_eq!(
            missing_options(&operations, &options(&[("drive", "/dev/sdc".into())])),
            vec!["network".to_string(), "variant".to_string()]
        );
    }
}
