use std::fmt;
use std::num::NonZeroU8;
use std::ops;

// These must be unique bits.
const RECV: u8 = 0b000_001;
const SEND: u8 = 0b000_010;
const ACPT: u8 = 0b000_100;
const CONN: u8 = 0b001_000;
const CLEAR: u8 = 0b010_000;
const ONESHOT: u8 = 0b100_000;

/// The set of readiness/registration flags the AIOP reactor understands.
///
/// `RECV`/`SEND`/`ACPT`/`CONN` name the operation classes a registration
/// cares about (spec.md §4.6); `CLEAR` requests edge-triggered delivery and
/// `ONESHOT` requests auto-disarm on first delivery. Backed by a
/// `NonZeroU8` so `Option<Interest>` is free.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    pub const RECV: Interest = Interest(unsafe { NonZeroU8::new_unchecked(RECV) });
    pub const SEND: Interest = Interest(unsafe { NonZeroU8::new_unchecked(SEND) });
    pub const ACPT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ACPT) });
    pub const CONN: Interest = Interest(unsafe { NonZeroU8::new_unchecked(CONN) });
    pub const CLEAR: Interest = Interest(unsafe { NonZeroU8::new_unchecked(CLEAR) });
    pub const ONESHOT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ONESHOT) });

    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub const fn is_readable(self) -> bool {
        self.0.get() & (RECV | ACPT) != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & (SEND | CONN) != 0
    }

    pub const fn is_clear(self) -> bool {
        self.0.get() & CLEAR != 0
    }

    pub const fn is_oneshot(self) -> bool {
        self.0.get() & ONESHOT != 0
    }

    pub const fn without(self, other: Interest) -> Option<Interest> {
        match NonZeroU8::new(self.0.get() & !other.0.get()) {
            Some(bits) => Some(Interest(bits)),
            None => None,
        }
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut flag = |ok: bool, name: &str, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if ok {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
            Ok(())
        };
        flag(self.0.get() & RECV != 0, "RECV", f)?;
        flag(self.0.get() & SEND != 0, "SEND", f)?;
        flag(self.0.get() & ACPT != 0, "ACPT", f)?;
        flag(self.0.get() & CONN != 0, "CONN", f)?;
        flag(self.0.get() & CLEAR != 0, "CLEAR", f)?;
        flag(self.0.get() & ONESHOT != 0, "ONESHOT", f)?;
        Ok(())
    }
}
