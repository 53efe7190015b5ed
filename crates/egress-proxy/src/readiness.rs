//! Readiness bookkeeping for edge-triggered sockets.
//!
//! mio reports readiness once per edge. A session therefore remembers what
//! the socket last reported (`event`) separately from what it currently
//! wants to do (`interest`). Work happens while the two intersect; an event
//! bit is cleared only when the operation returns `WouldBlock`.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use mio::event::Event;

/// A small set of readiness flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() || event.is_read_closed() {
            ready.insert(Ready::READABLE);
        }
        if event.is_writable() || event.is_write_closed() {
            ready.insert(Ready::WRITABLE);
        }
        // Let the next read or write surface the actual error.
        if event.is_error() {
            ready.insert(Ready::ERROR | Ready::READABLE | Ready::WRITABLE);
        }
        ready
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Ready::READABLE, "R"),
            (Ready::WRITABLE, "W"),
            (Ready::ERROR, "E"),
        ];
        let mut any = false;
        for (flag, name) in names {
            if self.contains(flag) {
                f.write_str(name)?;
                any = true;
            }
        }
        if !any {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Interest and last-seen events for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// The operations that are both wanted and possible.
    pub fn filter_interest(&self) -> Ready {
        self.interest & self.event
    }

    /// True if `flag` is both wanted and reported ready.
    pub fn wants(&self, flag: Ready) -> bool {
        self.filter_interest().contains(flag)
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }
}
