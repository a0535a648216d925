//! Error types for locker-core.
//!
//! This module defines every error a locker session can end with.
//!
//! # Propagation
//!
//! | Error Type | Origin | Retried by the client |
//! |------------|--------|-----------------------|
//! | [`Error::DeviceNotFound`] | Scan time box elapsed | No |
//! | [`Error::ConnectFailed`] | Connecting stage | Yes |
//! | [`Error::ServiceNotFound`] | Service discovery stage | Yes |
//! | [`Error::CharacteristicNotFound`] | Characteristic discovery stage | Yes |
//! | [`Error::ReadFailed`] | Pre- or post-write read | Yes |
//! | [`Error::WriteFailed`] | Key write | Yes |
//! | [`Error::LinkUnavailable`] | Link lost or unknown to the transport | Yes |
//! | [`Error::KeyCapabilityFailed`] | Key service, passed through unchanged | Yes, as an attempt failure |
//! | [`Error::NetworkFailed`] | Network unlock path | No |
//! | [`Error::LocationPermissionDenied`] | Location fallback | No |
//!
//! Stage errors carry a [`StageFailure`] telling whether the stage timed out
//! or the transport reported the failure.

use std::time::Duration;

use thiserror::Error;

use crate::events::TransportError;

/// Errors that can occur while running a locker session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error raised while starting an operation.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Target locker was never discovered.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// No open physical link where one was expected.
    #[error("Link unavailable")]
    LinkUnavailable,

    /// Connecting to the locker failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(StageFailure),

    /// Service discovery failed or returned no services.
    #[error("Service not found: {0}")]
    ServiceNotFound(StageFailure),

    /// No characteristic was found on any discovered service.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(StageFailure),

    /// Reading the characteristic failed.
    #[error("Reading characteristic failed: {0}")]
    ReadFailed(StageFailure),

    /// Writing the key to the characteristic failed.
    #[error("Writing characteristic failed: {0}")]
    WriteFailed(StageFailure),

    /// The key service failed to produce or save a key.
    #[error("Key capability failed: {0}")]
    KeyCapabilityFailed(String),

    /// The network unlock path failed.
    #[error("Network request failed: {0}")]
    NetworkFailed(String),

    /// A location fix could not be obtained.
    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    /// Location permission is denied or restricted.
    #[error("Location permission denied")]
    LocationPermissionDenied,

    /// Another session is already in flight on this client.
    #[error("A locker session is already in progress")]
    Busy,

    /// The action needs an authorization token and none was given.
    #[error("Action '{0}' requires an authorization token")]
    MissingToken(locker_types::ActionKind),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session task ended without reporting an outcome.
    #[error("Locker session ended without an outcome")]
    SessionAborted,
}

/// Why a handshake stage failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StageFailure {
    /// The stage timer fired before the stage completed.
    TimedOut {
        /// The stage timeout.
        duration: Duration,
    },
    /// The transport reported an error for the stage.
    Transport(String),
    /// The stage completed without the value it needed.
    MissingValue,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut { duration } => write!(f, "timed out after {:?}", duration),
            Self::Transport(msg) => write!(f, "{}", msg),
            Self::MissingValue => write!(f, "no value reported"),
        }
    }
}

impl From<TransportError> for StageFailure {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Scan time box elapsed before the locker appeared.
    NotFound {
        /// The requested locker id.
        identifier: String,
    },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "locker '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific locker.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a key capability error.
    pub fn key_failed(message: impl Into<String>) -> Self {
        Self::KeyCapabilityFailed(message.into())
    }

    /// Create a network error.
    pub fn network_failed(message: impl Into<String>) -> Self {
        Self::NetworkFailed(message.into())
    }

    /// Whether the error ended a handshake stage (and so is subject to the
    /// wireless retry policy).
    pub fn is_stage_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_)
                | Error::ServiceNotFound(_)
                | Error::CharacteristicNotFound(_)
                | Error::ReadFailed(_)
                | Error::WriteFailed(_)
                | Error::LinkUnavailable
        )
    }

    /// Whether the error was caused by a stage timer firing.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(StageFailure::TimedOut { .. })
                | Error::ServiceNotFound(StageFailure::TimedOut { .. })
                | Error::CharacteristicNotFound(StageFailure::TimedOut { .. })
                | Error::ReadFailed(StageFailure::TimedOut { .. })
                | Error::WriteFailed(StageFailure::TimedOut { .. })
        )
    }
}

/// Result type alias using locker-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
