use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The partition cannot accept the operation in its current lifecycle
    /// state, e.g. a write against a frozen writer.
    IllegalState(String),
    /// The partition has accumulated too many segments; inserts must back
    /// off until compaction catches up.
    Overloaded(String),
    /// An optimistic-concurrency check failed: metadata txnid mismatch,
    /// segment list changed under a compaction, or a stale discovery
    /// response. The operation may be retried against fresh state.
    ConcurrentModification(String),
    /// Invalid caller input, e.g. an empty server list or a record version
    /// below the epoch floor.
    InvalidInput(String),
    /// Invalid data, typically decoding errors, checksum mismatches, or
    /// unexpected internal values.
    InvalidData(String),
    /// A disk or RPC failure.
    IO(String),
    /// Catch-all for failures that do not fit the categories above, e.g.
    /// "no suitable split point found" or a failed metadata quorum.
    Runtime(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Error::Overloaded(msg) => write!(f, "overloaded: {msg}"),
            Error::ConcurrentModification(msg) => write!(f, "concurrent modification: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Runtime(msg) => write!(f, "runtime error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Error::IO(err.to_string())
    }
}
