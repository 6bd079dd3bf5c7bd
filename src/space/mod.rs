//! Free and allocated addresses inside the ranges this peer owns.

mod intervals;

pub use intervals::IntervalSet;

use crate::address::{Address, Count, Range};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SpaceError {
    #[error("address {0} is already in use")]
    Taken(Address),
    #[error("address {0} is not in a range we own")]
    NotMine(Address),
    #[error("address {0} is not allocated")]
    NotAllocated(Address),
}

#[derive(Debug, Clone, Default)]
pub struct Space {
    allocated: IntervalSet,
    free: IntervalSet,
    cursor: Address,
}

impl Space {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a newly owned range; all of it is free.
    pub fn add(&mut self, range: Range) {
        let fresh: IntervalSet = [range].into_iter().collect();
        for r in fresh.difference(&self.allocated).ranges() {
            self.free.add(r);
        }
    }

    /// Forgets a range we no longer own, including its allocations.
    pub fn remove(&mut self, range: Range) {
        self.free.subtract(range);
        self.allocated.subtract(range);
    }

    /// Makes the owned ranges exactly `owned`, keeping allocations that are
    /// still inside them.
    pub fn update_ranges(&mut self, owned: &[Range]) {
        let owned: IntervalSet = owned.iter().copied().collect();
        for gone in self.owned().difference(&owned).ranges() {
            self.remove(gone);
        }
        for r in owned.ranges() {
            self.add(r);
        }
    }

    fn owned(&self) -> IntervalSet {
        let mut owned = self.free.clone();
        for r in self.allocated.ranges() {
            owned.add(r);
        }
        owned
    }

    #[cfg(test)]
    pub fn owned_ranges(&self) -> Vec<Range> {
        self.owned().ranges().collect()
    }

    /// Picks a free address inside `range`, continuing after the last one
    /// handed out and wrapping back to the start of `range`.
    pub fn allocate(&mut self, range: Range) -> Option<Address> {
        let from = if range.contains(self.cursor) {
            self.cursor
        } else {
            range.start
        };
        let addr = self
            .free
            .first_in(Range::new(from, range.end))
            .or_else(|| self.free.first_in(Range::new(range.start, from)))?;

        self.take(addr);
        self.cursor = addr.add(1);
        Some(addr)
    }

    /// Where the next `allocate` starts looking.
    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Address) {
        self.cursor = cursor;
    }

    fn take(&mut self, addr: Address) {
        let one = Range::with_size(addr, 1);
        self.free.subtract(one);
        self.allocated.add(one);
    }

    pub fn claim(&mut self, addr: Address) -> Result<(), SpaceError> {
        if self.allocated.contains(addr) {
            return Err(SpaceError::Taken(addr));
        }
        if !self.free.contains(addr) {
            return Err(SpaceError::NotMine(addr));
        }
        self.take(addr);
        Ok(())
    }

    pub fn free(&mut self, addr: Address) -> Result<(), SpaceError> {
        if self.free.contains(addr) {
            return Err(SpaceError::NotAllocated(addr));
        }
        if !self.allocated.contains(addr) {
            return Err(SpaceError::NotMine(addr));
        }
        let one = Range::with_size(addr, 1);
        self.allocated.subtract(one);
        self.free.add(one);
        Ok(())
    }

    #[cfg(test)]
    pub fn is_allocated(&self, addr: Address) -> bool {
        self.allocated.contains(addr)
    }

    pub fn num_free(&self) -> Count {
        self.free.count()
    }

    pub fn num_allocated(&self) -> Count {
        self.allocated.count()
    }

    pub fn num_free_in_range(&self, range: Range) -> Count {
        self.free.count_in(range)
    }

    /// Chooses a block of free addresses inside `within` to give to another
    /// peer and removes it from our free space.
    ///
    /// The block is the larger of half our free addresses in `within` and
    /// the requester's `demand`, as a power of two no bigger than what is
    /// free. It is aligned to its own size and the lowest such block wins;
    /// when fragmentation leaves no block of that size, the size is halved
    /// until one fits.
    pub fn donate(&mut self, within: Range, demand: Count) -> Option<Range> {
        let total = self.free.count_in(within);
        if total == 0 {
            return None;
        }

        let half = prev_power_of_two((total / 2).max(1));
        let wanted = match demand {
            0 => 0,
            d if d > total => 0,
            d => match d.checked_next_power_of_two() {
                Some(up) if up <= total => up,
                _ => prev_power_of_two(d),
            },
        };

        let mut size = half.max(wanted);
        loop {
            if let Some(start) = self.aligned_free_block(within, size) {
                let block = Range::with_size(start, size);
                self.free.subtract(block);
                return Some(block);
            }
            if size == 1 {
                return None;
            }
            size /= 2;
        }
    }

    fn aligned_free_block(&self, within: Range, size: Count) -> Option<Address> {
        let size = size as u64;
        self.free.ranges_in(within).find_map(|piece| {
            let start = (piece.start.0 as u64).div_ceil(size) * size;
            (start + size <= piece.end.0 as u64).then_some(Address(start as u32))
        })
    }
}

fn prev_power_of_two(n: Count) -> Count {
    1 << (Count::BITS - 1 - n.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ip;

    fn space(start: &str, size: Count) -> Space {
        let mut s = Space::new();
        s.add(Range::with_size(ip(start), size));
        s
    }

    #[test]
    fn allocate_claim_and_free() {
        let mut s = Space::new();
        assert_eq!(s.num_free(), 0);
        assert_eq!(s.allocate(Range::new(Address(0), Address(1000))), None);

        s.add(Range::with_size(Address(100), 100));
        assert_eq!(s.num_free(), 100);
        assert_eq!(
            s.allocate(Range::new(Address(0), Address(1000))),
            Some(Address(100))
        );
        assert_eq!(s.num_free(), 99);

        assert_eq!(s.claim(Address(150)), Ok(()));
        assert_eq!(s.claim(Address(150)), Err(SpaceError::Taken(Address(150))));
        assert_eq!(s.claim(Address(10)), Err(SpaceError::NotMine(Address(10))));
        assert_eq!(s.num_free(), 98);

        assert_eq!(s.free(Address(100)), Ok(()));
        assert_eq!(s.num_free(), 99);
        assert_eq!(s.free(Address(0)), Err(SpaceError::NotMine(Address(0))));
        assert_eq!(
            s.free(Address(100)),
            Err(SpaceError::NotAllocated(Address(100)))
        );
        assert_eq!(s.num_allocated(), 1);
    }

    #[test]
    fn cursor_moves_forward_and_wraps() {
        let mut s = space("10.0.3.4", 20);
        let range = Range::with_size(ip("10.0.3.4"), 20);

        let first = s.allocate(range).unwrap();
        let second = s.allocate(range).unwrap();
        assert_eq!(first, ip("10.0.3.4"));
        assert_eq!(second, ip("10.0.3.5"));

        // Freed addresses are not reused until the cursor wraps
        s.free(first).unwrap();
        assert_eq!(s.allocate(range), Some(ip("10.0.3.6")));

        for _ in 0..17 {
            assert!(s.allocate(range).is_some());
        }
        assert_eq!(s.allocate(range), Some(ip("10.0.3.4")));
        assert_eq!(s.allocate(range), None);
    }

    #[test]
    fn cursor_can_be_put_back() {
        let mut s = space("10.0.3.4", 20);
        let range = Range::with_size(ip("10.0.3.4"), 20);
        s.allocate(range).unwrap();

        let cursor = s.cursor();
        let addr = s.allocate(range).unwrap();
        s.free(addr).unwrap();
        s.set_cursor(cursor);
        assert_eq!(s.allocate(range), Some(addr));
    }

    #[test]
    fn allocate_respects_the_requested_range() {
        let mut s = space("10.0.0.0", 256);
        let host = crate::address::cidr("10.0.0.0/30").host_range();

        assert_eq!(s.allocate(host), Some(ip("10.0.0.1")));
        assert_eq!(s.allocate(host), Some(ip("10.0.0.2")));
        assert_eq!(s.allocate(host), None);
    }

    #[test]
    fn counts_free_in_range() {
        let mut s = space("10.0.3.4", 20);
        let range = Range::with_size(ip("10.0.3.4"), 20);
        s.allocate(range);
        s.allocate(range);

        assert_eq!(
            s.num_free_in_range(Range::new(ip("10.0.3.4"), ip("10.0.3.19"))),
            13
        );
        assert_eq!(
            s.num_free_in_range(Range::new(ip("10.0.3.4"), ip("10.0.9.19"))),
            18
        );
    }

    #[test]
    fn donates_half_as_aligned_block() {
        let mut s = space("10.0.0.128", 128);
        let universe = Range::with_size(ip("10.0.0.0"), 256);

        assert_eq!(
            s.donate(universe, 1),
            Some(Range::new(ip("10.0.0.128"), ip("10.0.0.192")))
        );
        assert_eq!(s.num_free(), 64);
        assert_eq!(
            s.owned_ranges(),
            vec![Range::new(ip("10.0.0.192"), ip("10.0.1.0"))]
        );
    }

    #[test]
    fn donation_follows_demand_when_bigger() {
        let mut s = space("10.0.0.0", 64);
        let all = Range::with_size(ip("10.0.0.0"), 64);

        assert_eq!(
            s.donate(all, 40),
            Some(Range::with_size(ip("10.0.0.0"), 64))
        );

        let mut s = space("10.0.0.0", 64);
        // 48 would need a block of 64, which is all we have
        assert_eq!(s.donate(all, 48), Some(Range::with_size(ip("10.0.0.0"), 64)));

        let mut s = space("10.0.0.0", 64);
        s.claim(ip("10.0.0.0")).unwrap();
        // 63 free: rounds down to 32
        assert_eq!(
            s.donate(all, 40),
            Some(Range::with_size(ip("10.0.0.32"), 32))
        );
    }

    #[test]
    fn donation_shrinks_when_fragmented() {
        let mut s = space("10.0.0.0", 16);
        let all = Range::with_size(ip("10.0.0.0"), 16);
        for i in [1, 5, 9, 13] {
            s.claim(ip("10.0.0.0").add(i)).unwrap();
        }

        // 12 free, half is 4 but no aligned block of 4 is free
        assert_eq!(s.donate(all, 0), Some(Range::with_size(ip("10.0.0.2"), 2)));
    }

    #[test]
    fn donation_when_scarce() {
        let mut s = Space::new();
        let all = Range::new(Address(0), Address(1000));
        assert_eq!(s.donate(all, 0), None);

        s.add(Range::with_size(Address(0), 3));
        s.claim(Address(0)).unwrap();
        s.claim(Address(2)).unwrap();
        assert_eq!(s.donate(all, 0), Some(Range::with_size(Address(1), 1)));
        assert_eq!(s.donate(all, 0), None);
    }

    #[test]
    fn update_ranges_keeps_allocations_inside() {
        let mut s = space("10.0.0.0", 128);
        s.claim(ip("10.0.0.10")).unwrap();
        s.claim(ip("10.0.0.100")).unwrap();

        s.update_ranges(&[
            Range::new(ip("10.0.0.0"), ip("10.0.0.64")),
            Range::new(ip("10.0.0.128"), ip("10.0.0.192")),
        ]);

        assert!(s.is_allocated(ip("10.0.0.10")));
        assert!(!s.is_allocated(ip("10.0.0.100")));
        assert_eq!(s.num_free(), 63 + 64);
        assert_eq!(
            s.owned_ranges(),
            vec![
                Range::new(ip("10.0.0.0"), ip("10.0.0.64")),
                Range::new(ip("10.0.0.128"), ip("10.0.0.192"))
            ]
        );
    }
}
