use std::fmt;
use std::io;

/// Errors surfaced across the frameserver API.
///
/// The per-frame tick never returns these; protocol violations there move
/// the segment to `Dead` instead. This type covers the synchronous entry
/// points (allocation, spawning, descriptor pushing).
#[derive(Debug)]
pub enum Error {
    /// Null-ish handle, descriptor 0, empty or malformed key.
    BadArgument,
    /// The rendezvous path does not fit the platform socket-address limit.
    PathTooLong,
    /// The outgoing event ring is full.
    QueueFull,
    /// Resource exhaustion or any other OS-level failure.
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadArgument => write!(f, "bad argument"),
            Error::PathTooLong => write!(f, "rendezvous path exceeds socket address limit"),
            Error::QueueFull => write!(f, "outgoing event queue full"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
