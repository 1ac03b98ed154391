use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A 32 bit sequence number with wrap-around semantics.
///
/// Sequence numbers are deliberately *not* `Ord`: two values can only be compared relative to
///  each other via the signed difference (serial number arithmetic), which gives meaningful
///  results as long as they are less than half the sequence space apart.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    /// Half the sequence space: sequence numbers further apart than this can not be ordered
    pub const HALF_RANGE: u32 = u32::MAX / 2;

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    /// number of steps from `earlier` to `self`, wrapping
    pub fn distance_from(&self, earlier: SeqNum) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub fn wrapping_cmp(&self, other: &SeqNum) -> Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }

    pub fn lt(&self, other: SeqNum) -> bool {
        self.wrapping_cmp(&other) == Ordering::Less
    }

    pub fn lte(&self, other: SeqNum) -> bool {
        self.wrapping_cmp(&other) != Ordering::Greater
    }

    pub fn gt(&self, other: SeqNum) -> bool {
        self.wrapping_cmp(&other) == Ordering::Greater
    }

    pub fn gte(&self, other: SeqNum) -> bool {
        self.wrapping_cmp(&other) != Ordering::Less
    }

    /// iterate from self (inclusive) to `end` (exclusive), following wrap-around
    pub fn to(&self, end: SeqNum) -> impl Iterator<Item = SeqNum> {
        let start = *self;
        (0..end.distance_from(start)).map(move |i| start + i)
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u32) -> Self::Output {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNum {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u32) -> Self::Output {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}
