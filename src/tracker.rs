use crate::address::Range;
use crate::space::IntervalSet;
use anyhow::Result;
use log::{error, info};

/// Side effects of range ownership, e.g. updating routes.
pub trait RangeTracker: Send {
    fn on_range_owned(&mut self, range: Range) -> Result<()>;
    fn on_range_disowned(&mut self, range: Range) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Owned(Range),
    Disowned(Range),
}

impl Transition {
    fn inverse(self) -> Self {
        match self {
            Transition::Owned(r) => Transition::Disowned(r),
            Transition::Disowned(r) => Transition::Owned(r),
        }
    }

    fn call(self, tracker: &mut dyn RangeTracker) -> Result<()> {
        match self {
            Transition::Owned(r) => tracker.on_range_owned(r),
            Transition::Disowned(r) => tracker.on_range_disowned(r),
        }
    }
}

/// Pieces that left and joined our ownership between two sets of owned
/// ranges. Disowned pieces come first.
pub fn transitions(before: &[Range], after: &[Range]) -> Vec<Transition> {
    let before: IntervalSet = before.iter().copied().collect();
    let after: IntervalSet = after.iter().copied().collect();

    let disowned = before.difference(&after);
    let owned = after.difference(&before);
    disowned
        .ranges()
        .map(Transition::Disowned)
        .chain(owned.ranges().map(Transition::Owned))
        .collect()
}

/// Calls the tracker for every transition. If one fails, the ones already
/// applied are undone in reverse order and the error is returned.
pub fn apply(tracker: &mut dyn RangeTracker, transitions: &[Transition]) -> Result<()> {
    for (i, t) in transitions.iter().enumerate() {
        if let Err(e) = t.call(tracker) {
            revert(tracker, &transitions[..i]);
            return Err(e);
        }
    }
    Ok(())
}

/// Undoes applied transitions, newest first.
pub fn revert(tracker: &mut dyn RangeTracker, applied: &[Transition]) {
    for t in applied.iter().rev() {
        if let Err(e) = t.inverse().call(tracker) {
            error!("failed to undo range tracker change {t:?}: {e}");
        }
    }
}

/// Tracker that only logs ownership changes.
pub struct LogTracker;

impl RangeTracker for LogTracker {
    fn on_range_owned(&mut self, range: Range) -> Result<()> {
        info!("now owning {range}");
        Ok(())
    }

    fn on_range_disowned(&mut self, range: Range) -> Result<()> {
        info!("no longer owning {range}");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTracker;
    use super::*;
    use crate::address::Address;

    fn r(start: u32, end: u32) -> Range {
        Range::new(Address(start), Address(end))
    }

    #[test]
    fn computes_transitions() {
        let before = [r(0, 128)];
        let after = [r(0, 64), r(128, 192)];

        assert_eq!(
            transitions(&before, &after),
            vec![
                Transition::Disowned(r(64, 128)),
                Transition::Owned(r(128, 192))
            ]
        );
        assert!(transitions(&after, &after).is_empty());
    }

    #[test]
    fn failure_undoes_applied_calls() {
        let mut tracker = RecordingTracker::default();
        *tracker.fail_on.lock().unwrap() = Some(r(128, 192));

        let changes = [Transition::Disowned(r(64, 128)), Transition::Owned(r(128, 192))];
        assert!(apply(&mut tracker, &changes).is_err());
        assert_eq!(
            tracker.calls(),
            vec![
                Transition::Disowned(r(64, 128)),
                Transition::Owned(r(64, 128))
            ]
        );
    }
}
