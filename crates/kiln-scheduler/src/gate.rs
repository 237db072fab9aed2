//! Tree-stable debounce gate.
//!
//! The gate looks only at a scheduler's classified changes and the current
//! time. It never touches the store, so every outcome can be computed and
//! tested in isolation.

use chrono::{DateTime, TimeDelta, Utc};
use kiln_core::change::{Change, ClassifiedChanges};
use kiln_core::{Error, Result};

/// How long the tree must stay quiet before a batch is acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityMode {
    /// No timer: act on every change as soon as it is seen, one stamp each.
    Immediate,
    /// Wait for the quiet period, then build all changes as one stamp.
    Debounced(TimeDelta),
}

impl StabilityMode {
    /// `None` selects immediate mode. `Some(0)` is a zero-length quiet period,
    /// which still batches. Periods `TimeDelta` cannot hold are rejected.
    pub fn from_secs(tree_stable_timer_secs: Option<u64>) -> Result<Self> {
        match tree_stable_timer_secs {
            None => Ok(StabilityMode::Immediate),
            Some(secs) => seconds(secs).map(StabilityMode::Debounced).ok_or_else(|| {
                Error::InvalidConfig(format!("tree stable timer of {secs}s is out of range"))
            }),
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, StabilityMode::Immediate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Nothing important is waiting.
    Idle,
    /// Act on this batch (important and unimportant, ordered by change id).
    Ready(Vec<Change>),
    /// Not stable yet; evaluate again at this time.
    RecheckAt(DateTime<Utc>),
}

/// Extra delay added to a recheck so the scheduler does not wake exactly on
/// the boundary and spin.
pub fn recheck_margin() -> TimeDelta {
    TimeDelta::seconds(1)
}

/// `secs` as a `TimeDelta`, if it fits.
pub fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

/// `at + delta`, saturating at the latest representable instant.
pub fn later(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn evaluate(
    mode: StabilityMode,
    classified: &ClassifiedChanges,
    now: DateTime<Utc>,
) -> GateDecision {
    let Some(latest) = classified.latest_important() else {
        return GateDecision::Idle;
    };

    if let StabilityMode::Debounced(quiet) = mode {
        let stable_at = later(latest, quiet);
        if stable_at > now {
            return GateDecision::RecheckAt(later(stable_at, recheck_margin()));
        }
    }

    GateDecision::Ready(classified.batch())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kiln_core::change::Properties;
    use kiln_core::ids::ChangeId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn change(id: i64, when: DateTime<Utc>) -> Change {
        Change {
            id: ChangeId::new(id),
            author: "dev".into(),
            branch: None,
            revision: None,
            comments: String::new(),
            files: vec![],
            when,
            properties: Properties::new(),
        }
    }

    fn quiet(secs: i64) -> StabilityMode {
        StabilityMode::Debounced(TimeDelta::seconds(secs))
    }

    #[test]
    fn test_no_important_changes_is_idle() {
        let classified = ClassifiedChanges {
            important: vec![],
            unimportant: vec![change(1, at(0))],
        };
        assert_eq!(evaluate(quiet(30), &classified, at(100)), GateDecision::Idle);
        assert_eq!(
            evaluate(StabilityMode::Immediate, &ClassifiedChanges::default(), at(0)),
            GateDecision::Idle
        );
    }

    #[test]
    fn test_immediate_mode_is_always_ready() {
        let classified = ClassifiedChanges {
            important: vec![change(2, at(50))],
            unimportant: vec![change(1, at(10))],
        };
        match evaluate(StabilityMode::Immediate, &classified, at(0)) {
            GateDecision::Ready(batch) => {
                let ids: Vec<_> = batch.iter().map(|c| c.id.get()).collect();
                assert_eq!(ids, vec![1, 2]);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_debounce_waits_for_latest_important_change() {
        let classified = ClassifiedChanges {
            important: vec![change(1, at(10)), change(2, at(20))],
            unimportant: vec![],
        };

        assert_eq!(
            evaluate(quiet(30), &classified, at(49)),
            GateDecision::RecheckAt(at(51))
        );
        assert!(matches!(
            evaluate(quiet(30), &classified, at(50)),
            GateDecision::Ready(_)
        ));
        assert!(matches!(
            evaluate(quiet(30), &classified, at(90)),
            GateDecision::Ready(_)
        ));
    }

    #[test]
    fn test_unimportant_changes_do_not_extend_the_wait() {
        let classified = ClassifiedChanges {
            important: vec![change(1, at(10))],
            unimportant: vec![change(2, at(100))],
        };
        match evaluate(quiet(30), &classified, at(40)) {
            GateDecision::Ready(batch) => assert_eq!(batch.len(), 2),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let classified = ClassifiedChanges {
            important: vec![change(1, at(10))],
            unimportant: vec![],
        };
        let first = evaluate(quiet(60), &classified, at(20));
        let second = evaluate(quiet(60), &classified, at(20));
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_quiet_period_is_not_immediate() {
        let mode = StabilityMode::from_secs(Some(0)).unwrap();
        assert_eq!(mode, quiet(0));
        assert!(!mode.is_immediate());
        assert!(StabilityMode::from_secs(None).unwrap().is_immediate());
    }

    #[test]
    fn test_unrepresentable_timer_is_a_config_error() {
        for secs in [100_000_000_000_000_000, u64::MAX] {
            assert!(matches!(
                StabilityMode::from_secs(Some(secs)),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_quiet_period_past_the_calendar_saturates() {
        let classified = ClassifiedChanges {
            important: vec![change(1, at(10))],
            unimportant: vec![],
        };
        let mode = StabilityMode::from_secs(Some(10_000_000_000_000)).unwrap();

        assert_eq!(
            evaluate(mode, &classified, at(20)),
            GateDecision::RecheckAt(DateTime::<Utc>::MAX_UTC)
        );
    }
}
