//! Registry handle layout
//!
//! ```text
//!  31  30                    20 19                        0
//! ┌───┬────────────────────────┬──────────────────────────┐
//! │ C │   generation sequence   │        slot index + 1    │
//! └───┴────────────────────────┴──────────────────────────┘
//! ```
//!
//! `C` marks channel handles. The sequence wraps from `SEQUENCE_LIMIT`
//! back to 1, so it never reaches 0x7ff. Handle 0 is never issued.

use core::fmt;

/// Bit 31: the handle names a channel
pub const CHANNEL_BIT: u32 = 0x8000_0000;

/// Bits 0-19 hold `index + 1`
pub const INDEX_MASK: u32 = 0x000F_FFFF;

pub const SEQUENCE_SHIFT: u32 = 20;

/// Bits 20-30
pub const SEQUENCE_MASK: u32 = 0x7FF;

/// The sequence counter wraps to 1 when it reaches this value
pub const SEQUENCE_LIMIT: u32 = 0x7FF;

/// Largest number of slots a table can address
pub const MAX_SLOTS: usize = INDEX_MASK as usize;

/// Opaque 32-bit registry handle
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The "no handle" sentinel
    pub const NONE: Handle = Handle(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Handle(raw)
    }

    /// Build a handle from its parts. `index` is the zero-based slot.
    #[inline]
    pub const fn compose(index: usize, sequence: u32, channel: bool) -> Self {
        let mut raw = ((sequence & SEQUENCE_MASK) << SEQUENCE_SHIFT)
            | ((index as u32 + 1) & INDEX_MASK);
        if channel {
            raw |= CHANNEL_BIT;
        }
        Handle(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_channel(self) -> bool {
        self.0 & CHANNEL_BIT != 0
    }

    /// Zero-based slot index, `None` for the sentinel or a zero index field
    #[inline]
    pub const fn index(self) -> Option<usize> {
        let field = self.0 & INDEX_MASK;
        if field == 0 {
            None
        } else {
            Some(field as usize - 1)
        }
    }

    #[inline]
    pub const fn sequence(self) -> u32 {
        (self.0 >> SEQUENCE_SHIFT) & SEQUENCE_MASK
    }
}

/// Next value of a generation counter: +1, wrapping from the limit to 1
#[inline]
pub const fn next_sequence(seq: u32) -> u32 {
    let next = seq + 1;
    if next >= SEQUENCE_LIMIT {
        1
    } else {
        next
    }
}

impl From<u32> for Handle {
    #[inline]
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}

impl From<Handle> for u32 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Handle(NONE)")
        } else {
            write!(
                f,
                "Handle({}:{:#x} seq={} idx={:?})",
                if self.is_channel() { "chan" } else { "svc" },
                self.0,
                self.sequence(),
                self.index()
            )
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_layout() {
        let h = Handle::compose(0, 1, false);
        assert_eq!(h.as_u32(), (1 << 20) | 1);
        assert_eq!(h.index(), Some(0));
        assert_eq!(h.sequence(), 1);
        assert!(!h.is_channel());

        let c = Handle::compose(41, 0x7FE, true);
        assert_eq!(c.as_u32(), 0x8000_0000 | (0x7FE << 20) | 42);
        assert!(c.is_channel());
        assert_eq!(c.index(), Some(41));
        assert_eq!(c.sequence(), 0x7FE);
    }

    #[test]
    fn test_sentinel() {
        assert!(Handle::NONE.is_none());
        assert_eq!(Handle::NONE.index(), None);
        assert_eq!(Handle::from(CHANNEL_BIT).index(), None);
    }

    #[test]
    fn test_sequence_wraps_before_limit() {
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(0x7FD), 0x7FE);
        assert_eq!(next_sequence(0x7FE), 1);
    }

    #[test]
    fn test_highest_index_fits() {
        let h = Handle::compose(MAX_SLOTS - 1, 3, false);
        assert_eq!(h.index(), Some(MAX_SLOTS - 1));
        assert_eq!(h.sequence(), 3);
    }
}
