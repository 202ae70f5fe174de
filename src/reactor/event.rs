use std::fmt;

/// Which readiness a registration is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Readable,
    Writable,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Readable => f.write_str("readable"),
            Direction::Writable => f.write_str("writable"),
        }
    }
}

/// What the event source observed on the descriptor.
///
/// `Hangup` and `Error` are hints. The channel still issues the syscall so
/// the socket itself reports end of stream or the concrete error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Hangup,
    Error,
}

/// The directions currently registered for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };

    pub fn contains(&self, direction: Direction) -> bool {
        match direction {
            Direction::Readable => self.read,
            Direction::Writable => self.write,
        }
    }

    pub(crate) fn set(&mut self, direction: Direction, enabled: bool) {
        match direction {
            Direction::Readable => self.read = enabled,
            Direction::Writable => self.write = enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}
