use std::fmt;
use std::io;

/// Engine-level errors
#[derive(Debug)]
pub enum Error {
    /// I/O error from the OS
    Io(io::Error),
    /// Connection-level failure
    Connection(String),
    /// Wire-protocol framing violation (fatal: the decoder lost sync)
    Protocol(String),
    /// Invalid configuration
    Config(String),
    /// Statistics computation failure (empty sample set, bad split)
    Stats(String),
    /// Other errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Connection(s) => write!(f, "Connection error: {}", s),
            Error::Protocol(s) => write!(f, "Protocol error: {}", s),
            Error::Config(s) => write!(f, "Configuration error: {}", s),
            Error::Stats(s) => write!(f, "Statistics error: {}", s),
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

impl From<phloem_transport::Error> for Error {
    fn from(e: phloem_transport::Error) -> Self {
        match e {
            phloem_transport::Error::Io(io) => Error::Io(io),
            phloem_transport::Error::Connection(s) => Error::Connection(s),
            phloem_transport::Error::Config(s) => Error::Config(s),
            phloem_transport::Error::Other(s) => Error::Other(s),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
