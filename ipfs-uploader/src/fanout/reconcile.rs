//! Picking one identifier out of the identifiers the backends reported.

use serde::{Deserialize, Serialize};

use super::BackendOutcome;

/// How to choose the reported identifier when successful backends disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierPolicy {
    /// The identifier reported by the most backends; ties go to the earliest backend in registry
    /// order
    #[default]
    Majority,
    /// The identifier of the earliest successful backend in registry order
    FirstSuccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub cid: Option<String>,
    /// Under `Majority`, the most reported identifier was tied with another. Under
    /// `FirstSuccess`, some successful backend disagreed with the chosen identifier.
    pub mismatch: bool,
}

/// Reconcile the identifiers of the successful outcomes, which must be in registry order.
pub fn reconcile(outcomes: &[BackendOutcome], policy: IdentifierPolicy) -> Reconciled {
    // Distinct identifiers in order of first appearance, with their counts
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for cid in outcomes.iter().filter_map(BackendOutcome::cid) {
        match tally.iter_mut().find(|(seen, _)| *seen == cid) {
            Some((_, count)) => *count += 1,
            None => tally.push((cid, 1)),
        }
    }

    let (chosen, mismatch) = match policy {
        IdentifierPolicy::FirstSuccess => (tally.first(), tally.len() > 1),
        IdentifierPolicy::Majority => {
            // max_by_key keeps the last maximum; fold keeps the first
            let best = tally.iter().fold(None, |best: Option<&(&str, usize)>, entry| match best {
                Some(b) if b.1 >= entry.1 => Some(b),
                _ => Some(entry),
            });
            let tied = best.is_some_and(|(_, top)| tally.iter().filter(|(_, count)| count == top).count() > 1);
            (best, tied)
        }
    };

    Reconciled {
        cid: chosen.map(|(cid, _)| cid.to_string()),
        mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FailureKind;
    use std::time::Duration;

    fn ok(backend: &str, cid: &str) -> BackendOutcome {
        BackendOutcome::succeeded(backend, cid, Duration::ZERO)
    }

    fn failed(backend: &str) -> BackendOutcome {
        BackendOutcome::failed(backend, FailureKind::ConnectionRefused, "refused", Duration::ZERO)
    }

    #[test]
    fn test_agreement() {
        let outcomes = vec![ok("a", "bafy-x"), failed("b"), ok("c", "bafy-x")];
        let result = reconcile(&outcomes, IdentifierPolicy::Majority);
        assert_eq!(result.cid.as_deref(), Some("bafy-x"));
        assert!(!result.mismatch);
    }

    #[test]
    fn test_majority_wins_without_mismatch() {
        let outcomes = vec![ok("a", "bafy-a"), ok("b", "bafy-a"), ok("c", "bafy-b")];
        let result = reconcile(&outcomes, IdentifierPolicy::Majority);
        assert_eq!(result.cid.as_deref(), Some("bafy-a"));
        assert!(!result.mismatch);

        let outcomes = vec![ok("a", "bafy-b"), ok("b", "bafy-a"), ok("c", "bafy-a")];
        let result = reconcile(&outcomes, IdentifierPolicy::Majority);
        assert_eq!(result.cid.as_deref(), Some("bafy-a"));
        assert!(!result.mismatch);
    }

    #[test]
    fn test_two_way_tie_flags_mismatch() {
        let outcomes = vec![ok("a", "bafy-a"), ok("b", "bafy-b")];
        let result = reconcile(&outcomes, IdentifierPolicy::Majority);
        assert_eq!(result.cid.as_deref(), Some("bafy-a"));
        assert!(result.mismatch);
    }

    #[test]
    fn test_tie_goes_to_registry_order() {
        let outcomes = vec![failed("a"), ok("b", "bafy-b"), ok("c", "bafy-a")];
        let result = reconcile(&outcomes, IdentifierPolicy::Majority);
        assert_eq!(result.cid.as_deref(), Some("bafy-b"));
        assert!(result.mismatch);
    }

    #[test]
    fn test_first_success_ignores_counts() {
        let outcomes = vec![failed("a"), ok("b", "bafy-b"), ok("c", "bafy-a"), ok("d", "bafy-a")];
        let result = reconcile(&outcomes, IdentifierPolicy::FirstSuccess);
        assert_eq!(result.cid.as_deref(), Some("bafy-b"));
        assert!(result.mismatch);
    }

    #[test]
    fn test_no_successes() {
        let outcomes = vec![failed("a"), failed("b")];
        for policy in [IdentifierPolicy::Majority, IdentifierPolicy::FirstSuccess] {
            let result = reconcile(&outcomes, policy);
            assert_eq!(result.cid, None);
            assert!(!result.mismatch);
        }
    }
}
