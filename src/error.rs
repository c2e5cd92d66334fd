//! Crate-wide error handling.
//!
//! Functions that can fail return `Result<T>` and propagate errors with `?`.
//! Protocol invariant breaches (e.g. two leaders in one term, or truncation
//! of committed log entries) are not errors: they must be unreachable, and
//! panic to abort the process with a non-zero exit code.

/// A replika error. Client-visible failures (lost leadership, minority
/// partitions) are protocol messages, not errors; these variants cover the
/// process's own failure modes.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid data, e.g. a malformed wire message.
    InvalidData(String),
    /// Invalid user input, e.g. bad command-line arguments.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

/// A replika result, using the crate-wide error type.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Allows `return errinput!(...)` in functions returning Result.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}
