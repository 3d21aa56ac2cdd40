//! Error types for value parsing in cellmap-types.

use thiserror::Error;

/// Errors that can occur when parsing sampling values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Unknown location source name.
    #[error("Unknown location source: {0}")]
    UnknownSource(String),
}

/// Result type alias using cellmap-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
