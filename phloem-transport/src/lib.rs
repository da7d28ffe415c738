//! Socket-level plumbing for the phloem load generator.
//!
//! This crate owns everything that talks to the kernel: raw TCP sockets with
//! the option sets the agent modes need, an I/O readiness multiplexer, and the
//! Linux hardware-timestamping machinery (SO_TIMESTAMPING, MSG_ERRQUEUE).
//! Policy lives upstream in `phloem-core`; this crate only moves bytes and
//! timestamps.

pub mod mux;
pub mod tcp;
pub mod timestamp;

#[cfg(target_os = "linux")]
pub mod hw_timestamp;

pub use mux::{Event, Interest, Multiplexer};
pub use tcp::{RecvOutcome, SocketProfile, TcpSock};
pub use timestamp::Timestamp;

use std::fmt;
use std::io;

/// Transport-level errors
#[derive(Debug)]
pub enum Error {
    /// I/O error from the OS
    Io(io::Error),
    /// Connection-level failure (reset, refused, unexpected close)
    Connection(String),
    /// Invalid configuration
    Config(String),
    /// Other errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Connection(s) => write!(f, "Connection error: {}", s),
            Error::Config(s) => write!(f, "Configuration error: {}", s),
            Error::Other(s) => write!(f, "Error: {}", s),
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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
