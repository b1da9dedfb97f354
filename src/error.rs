//! Error types returned by the machine and its storage layer.

use std::fmt;

/// The kind of failure that occurred, independent of any human-readable detail.
///
/// Handlers return a kind; the dispatcher never masks or translates it, so
/// `step` surfaces exactly the kind the failing opcode produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A register, cursor, or instruction id was referenced but does not exist.
    NotFound,
    /// A buffer, register, cursor, or page could not be grown (includes a
    /// B-tree leaf with no room left for an insert).
    OutOfMemory,
    /// OpenRead/OpenWrite was given a register that does not hold an Int.
    InvalidPage,
    /// A comparison or index opcode saw operands of incompatible tags.
    TypeMismatch,
    /// An opcode was used against a cursor or column in a way its contract forbids.
    Misuse,
    /// A pager or file-level operation failed, or a column map was missing.
    IoError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::InvalidPage => "invalid page",
            ErrorCode::TypeMismatch => "type mismatch",
            ErrorCode::Misuse => "misuse",
            ErrorCode::IoError => "io error",
        };
        f.write_str(s)
    }
}

/// A machine-level error: a kind plus optional context.
#[derive(Debug, thiserror::Error)]
#[error("{code}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error { code, message: None }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error { code, message: Some(message.into()) }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
