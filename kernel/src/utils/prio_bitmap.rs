//! The ready bitmap (§3 "Ready structure").
//!
//! The spec caps the priority count at the machine word width, so unlike
//! the teacher's multi-level `FixedPrioBitmap` (built to scale past 64/128
//! priorities by nesting word-sized levels), a single machine word is
//! always enough here — one bit per priority, found in `O(1)` via
//! `trailing_zeros`.
use core::fmt;

/// A bitmap with one bit per priority level, bit *i* set iff the ready queue
/// at priority *i* is non-empty (§3 invariant).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadyBitmap(usize);

impl ReadyBitmap {
    pub const CAPACITY: usize = usize::BITS as usize;

    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < Self::CAPACITY);
        self.0 & (1 << i) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < Self::CAPACITY);
        self.0 |= 1 << i;
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < Self::CAPACITY);
        self.0 &= !(1 << i);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The lowest-numbered set bit (i.e. the highest-priority non-empty
    /// ready queue), if any.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

impl fmt::Debug for ReadyBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadyBitmap({:#b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn set_clear_find() {
        let mut b = ReadyBitmap::new();
        assert!(b.is_empty());
        b.set(3);
        b.set(1);
        assert_eq!(b.find_set(), Some(1));
        b.clear(1);
        assert_eq!(b.find_set(), Some(3));
        b.clear(3);
        assert!(b.is_empty());
    }

    #[quickcheck]
    fn matches_btreeset(ops: Vec<(bool, u8)>) -> bool {
        use std::collections::BTreeSet;
        let mut model = BTreeSet::new();
        let mut bitmap = ReadyBitmap::new();
        for (set, i) in ops {
            let i = (i as usize) % ReadyBitmap::CAPACITY;
            if set {
                model.insert(i);
                bitmap.set(i);
            } else {
                model.remove(&i);
                bitmap.clear(i);
            }
            if bitmap.find_set() != model.iter().next().copied() {
                return false;
            }
        }
        true
    }
}
