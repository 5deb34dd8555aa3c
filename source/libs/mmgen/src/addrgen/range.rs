// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sorted set of closed `[start, end]` address ranges.

use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeSet<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        self.ranges.insert((start, end));
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    /// Stored ranges intersecting `[start, end]`, in order.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.range(..=(end, u64::MAX)).copied().filter(move |&(_, e)| e >= start)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.overlapping(start, end).next().is_some()
    }

    /// True when a single stored range contains all of `[start, end]`.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.overlapping(start, end).any(|(s, e)| s <= start && end <= e)
    }

    /// Pairwise intersection of both sets.
    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut out = RangeSet::new();
        for (s1, e1) in self.iter() {
            for (s2, e2) in other.overlapping(s1, e1) {
                let (start, end) = (s1.max(s2), e1.min(e2));
                if start <= end {
                    out.insert(start, end);
                }
            }
        }
        out
    }

    /// `self` with every byte covered by `holes` removed.
    pub fn subtract(&self, holes: &RangeSet) -> RangeSet {
        let mut out = RangeSet::new();
        for (s, e) in self.iter() {
            let mut cursor = Some(s);
            for (hs, he) in holes.overlapping(s, e) {
                let Some(start) = cursor else { break };
                if start < hs {
                    out.insert(start, hs - 1);
                }
                cursor = if he >= e { None } else { Some(start.max(he + 1)) };
            }
            if let Some(start) = cursor {
                out.insert(start, e);
            }
        }
        out
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (s, e)) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "({s:#x}, {e:#x})")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> RangeSet {
        let mut s = RangeSet::new();
        for &(a, b) in ranges {
            s.insert(a, b);
        }
        s
    }

    #[test]
    fn overlap_queries() {
        let s = set(&[(0x10, 0x1f), (0x40, 0x4f)]);
        assert_eq!(s.overlapping(0x1f, 0x40).collect::<Vec<_>>(), vec![(0x10, 0x1f), (0x40, 0x4f)]);
        assert!(!s.overlaps(0x20, 0x3f));
        assert!(s.covers(0x12, 0x1f));
        assert!(!s.covers(0x1e, 0x41));
    }

    #[test]
    fn subtract_splits_around_holes() {
        let free = set(&[(1, 100)]).subtract(&set(&[(20, 20), (70, 100)]));
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![(1, 19), (21, 69)]);
    }

    #[test]
    fn subtract_keeps_single_byte_tail() {
        let free = set(&[(0, 10)]).subtract(&set(&[(0, 9)]));
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![(10, 10)]);
    }

    #[test]
    fn subtract_at_top_of_address_space() {
        let free = set(&[(0, u64::MAX)]).subtract(&set(&[(0x1000, u64::MAX)]));
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![(0, 0xfff)]);
    }

    #[test]
    fn intersect_keeps_single_byte_overlap() {
        let a = set(&[(0, 0x10)]);
        let b = set(&[(0x10, 0x20), (0x30, 0x40)]);
        assert_eq!(a.intersect(&b).iter().collect::<Vec<_>>(), vec![(0x10, 0x10)]);
    }
}
