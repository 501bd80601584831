//! Sequence numbers on the wire are narrow (8 or 16 bits) and wrap around. They are compared
//!  with serial number arithmetic: `a` precedes `b` if going forward from `a` reaches `b` in less
//!  than half the number space.
//!
//! NB: This ordering is only meaningful while all numbers that are compared with each other lie
//!  within half the number space of each other. Queues and windows are sized to guarantee this.

pub trait SerialNumber: Copy + Eq {
    /// number of steps going forward from `self` to `other`, wrapping around
    fn distance_to(self, other: Self) -> usize;

    fn precedes(self, other: Self) -> bool;

    fn next(self) -> Self;
}

impl SerialNumber for u8 {
    fn distance_to(self, other: u8) -> usize {
        other.wrapping_sub(self) as usize
    }

    fn precedes(self, other: u8) -> bool {
        (self.wrapping_sub(other) as i8) < 0
    }

    fn next(self) -> u8 {
        self.wrapping_add(1)
    }
}

impl SerialNumber for u16 {
    fn distance_to(self, other: u16) -> usize {
        other.wrapping_sub(self) as usize
    }

    fn precedes(self, other: u16) -> bool {
        (self.wrapping_sub(other) as i16) < 0
    }

    fn next(self) -> u16 {
        self.wrapping_add(1)
    }
}

/// `true` if `seq` lies in the inclusive range `[start, end]`, going forward from `start`
pub fn is_in_range<S: SerialNumber>(seq: S, start: S, end: S) -> bool {
    start.distance_to(seq) <= start.distance_to(end)
}
