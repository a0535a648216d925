//! Error types for parsing in locker-types.

use thiserror::Error;

/// Errors that can occur when parsing locker values.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in locker-core).
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The action name is not one of the known actions.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Latitude or longitude is out of range.
    #[error("Invalid coordinates: lat={lat}, lng={lng}")]
    InvalidCoordinates {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lng: f64,
    },
}

/// Result type alias using locker-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
