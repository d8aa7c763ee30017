use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A sequence number in the modulo-1024 space of AMD PDUs.
///
/// NB: There is deliberately no `Ord` implementation. Whether one SN is 'before' another depends
///      on the position of a window base, see [SnWindow].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Sn(u16);

impl Display for Sn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sn {
    pub const MODULUS: u16 = 1024;
    pub const BITS: u32 = 10;
    pub const ZERO: Sn = Sn(0);

    /// reduces the raw value modulo 1024
    pub fn new(raw: u16) -> Sn {
        Sn(raw % Self::MODULUS)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Sn {
        self + 1
    }

    pub fn prev(self) -> Sn {
        Sn((self.0 + Self::MODULUS - 1) % Self::MODULUS)
    }

    /// the number of steps from `base` forward to `self`, in `0..1024`
    pub fn offset_from(self, base: Sn) -> u16 {
        (self.0 + Self::MODULUS - base.0) % Self::MODULUS
    }

    /// iterate from `self` (inclusive) to `end` (exclusive), walking forward with wrap-around
    pub fn to(self, end: Sn) -> impl Iterator<Item = Sn> {
        let len = end.offset_from(self);
        (0..len).map(move |i| self + i)
    }
}

impl Add<u16> for Sn {
    type Output = Sn;

    fn add(self, rhs: u16) -> Sn {
        Sn(((self.0 as u32 + rhs as u32) % Self::MODULUS as u32) as u16)
    }
}

impl AddAssign<u16> for Sn {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl Sub<Sn> for Sn {
    type Output = u16;

    fn sub(self, rhs: Sn) -> u16 {
        self.offset_from(rhs)
    }
}


/// A window of `size` sequence numbers starting at `base` (inclusive).
///
/// All ordering of SNs goes through a window: SNs are compared by their distance from the base,
///  never by raw value. SNs that are not inside the window are considered to precede the base,
///  i.e. they are 'old' from the window's point of view.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SnWindow {
    pub base: Sn,
    pub size: u16,
}

impl SnWindow {
    pub fn new(base: Sn, size: u16) -> SnWindow {
        debug_assert!(size <= Sn::MODULUS / 2);
        SnWindow { base, size }
    }

    pub fn contains(&self, sn: Sn) -> bool {
        sn.offset_from(self.base) < self.size
    }

    /// signed distance from the window base: `0..size` inside the window, negative for SNs
    ///  outside it
    pub fn position(&self, sn: Sn) -> i32 {
        let offs = sn.offset_from(self.base) as i32;
        if offs < self.size as i32 {
            offs
        }
        else {
            offs - Sn::MODULUS as i32
        }
    }

    pub fn is_before(&self, a: Sn, b: Sn) -> bool {
        self.position(a) < self.position(b)
    }
}
