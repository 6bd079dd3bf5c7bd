use crate::address::{Address, Count, Range};
use std::collections::BTreeMap;

/// Set of addresses stored as disjoint, non-adjacent ranges keyed by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet(BTreeMap<Address, Address>);

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, range: Range) {
        if range.start >= range.end {
            return;
        }
        let (mut start, mut end) = (range.start, range.end);

        // Piece starting before us that overlaps or touches
        if let Some((&s, &e)) = self.0.range(..start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.0.remove(&s);
            }
        }

        let swallowed: Vec<Address> = self.0.range(start..=end).map(|(&s, _)| s).collect();
        for s in swallowed {
            if let Some(e) = self.0.remove(&s) {
                end = end.max(e);
            }
        }

        self.0.insert(start, end);
    }

    pub fn subtract(&mut self, range: Range) {
        if range.start >= range.end {
            return;
        }
        let affected: Vec<(Address, Address)> = self
            .0
            .range(..range.end)
            .rev()
            .take_while(|&(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in affected {
            self.0.remove(&s);
            if s < range.start {
                self.0.insert(s, range.start);
            }
            if e > range.end {
                self.0.insert(range.end, e);
            }
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.0
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &e)| addr < e)
    }

    /// Pieces of the set inside `within`, clipped to it, in ascending order.
    pub fn ranges_in(&self, within: Range) -> impl Iterator<Item = Range> + '_ {
        // A piece starting before `within` may still reach into it
        let first = self
            .0
            .range(..within.start)
            .next_back()
            .map(|(&s, _)| s)
            .unwrap_or(within.start);
        self.0
            .range(first..within.end.max(first))
            .filter_map(move |(&s, &e)| Range::new(s, e).intersect(&within))
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range> + '_ {
        self.0.iter().map(|(&s, &e)| Range::new(s, e))
    }

    pub fn count_in(&self, within: Range) -> Count {
        self.ranges_in(within).map(|r| r.size()).sum()
    }

    pub fn count(&self) -> Count {
        self.ranges().map(|r| r.size()).sum()
    }

    /// Lowest address of the set inside `within`.
    pub fn first_in(&self, within: Range) -> Option<Address> {
        self.ranges_in(within).next().map(|r| r.start)
    }

    /// Everything in `self` that is not in `other`.
    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = self.clone();
        for r in other.ranges() {
            result.subtract(r);
        }
        result
    }
}

impl FromIterator<Range> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Range>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for r in iter {
            set.add(r);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u32, end: u32) -> Range {
        Range::new(Address(start), Address(end))
    }

    fn pieces(set: &IntervalSet) -> Vec<(u32, u32)> {
        set.ranges().map(|r| (r.start.0, r.end.0)).collect()
    }

    #[test]
    fn add_and_subtract_keep_pieces_coalesced() {
        let mut set = IntervalSet::new();
        set.add(r(100, 200));
        assert!(!set.contains(Address(99)));
        assert!(set.contains(Address(100)));
        assert!(set.contains(Address(199)));
        assert!(!set.contains(Address(200)));

        set.add(r(700, 800));
        set.add(r(300, 400));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 400), (700, 800)]);
        set.add(r(400, 500));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 500), (700, 800)]);
        set.add(r(600, 700));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 500), (600, 800)]);
        set.add(r(500, 600));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 800)]);

        set.subtract(r(500, 600));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 500), (600, 800)]);
        set.subtract(r(600, 700));
        assert_eq!(pieces(&set), vec![(100, 200), (300, 500), (700, 800)]);
        set.subtract(r(400, 500));
        set.subtract(r(300, 400));
        set.subtract(r(700, 800));
        assert_eq!(pieces(&set), vec![(100, 200)]);
        set.subtract(r(100, 200));
        assert!(set.is_empty());
    }

    #[test]
    fn overlapping_operations() {
        let mut set: IntervalSet = [r(10, 20), r(30, 40), r(50, 60)].into_iter().collect();
        set.add(r(15, 55));
        assert_eq!(pieces(&set), vec![(10, 60)]);

        set.subtract(r(0, 12));
        set.subtract(r(58, 100));
        set.subtract(r(20, 30));
        assert_eq!(pieces(&set), vec![(12, 20), (30, 58)]);
    }

    #[test]
    fn counting_inside_a_range() {
        let set: IntervalSet = [r(10, 20), r(30, 40)].into_iter().collect();
        assert_eq!(set.count(), 20);
        assert_eq!(set.count_in(r(15, 35)), 10);
        assert_eq!(set.count_in(r(20, 30)), 0);
        assert_eq!(set.first_in(r(15, 35)), Some(Address(15)));
        assert_eq!(set.first_in(r(20, 30)), None);
        assert_eq!(
            set.ranges_in(r(0, 100)).collect::<Vec<_>>(),
            vec![r(10, 20), r(30, 40)]
        );
    }

    #[test]
    fn difference_of_sets() {
        let owned: IntervalSet = [r(0, 100)].into_iter().collect();
        let used: IntervalSet = [r(10, 20), r(50, 60)].into_iter().collect();
        assert_eq!(
            pieces(&owned.difference(&used)),
            vec![(0, 10), (20, 50), (60, 100)]
        );
    }
}
