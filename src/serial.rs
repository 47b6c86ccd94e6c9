use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A per-sender packet sequence number.
///
/// Serials wrap around after `u32::MAX`, so they are compared modulo 2^32 (RFC 1982 style): `a`
///  is before `b` iff `b` is 'ahead' of `a` by less than 2^31. This is why `Serial` does not
///  implement `Ord` - the relation is not transitive across the whole number space, it is only
///  meaningful for serials that are reasonably close to each other.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Serial(u32);

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serial {
    pub const ZERO: Serial = Serial(0);

    pub fn from_raw(value: u32) -> Serial {
        Serial(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn random() -> Serial {
        Serial(rand::random())
    }

    pub fn next(&self) -> Serial {
        Serial(self.0.wrapping_add(1))
    }

    /// returns the current value, advancing `self` to the next serial
    pub fn post_increment(&mut self) -> Serial {
        let result = *self;
        *self = self.next();
        result
    }

    pub fn serial_cmp(&self, other: &Serial) -> Ordering {
        match self.0.wrapping_sub(other.0) {
            0 => Ordering::Equal,
            d if d < 0x8000_0000 => Ordering::Greater,
            _ => Ordering::Less,
        }
    }

    pub fn is_before(&self, other: &Serial) -> bool {
        self.serial_cmp(other) == Ordering::Less
    }

    pub fn is_after(&self, other: &Serial) -> bool {
        self.serial_cmp(other) == Ordering::Greater
    }
}
