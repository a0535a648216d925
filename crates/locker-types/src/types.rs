//! Core types for locker handshakes.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

/// Payload a locker reports while a box is occupied.
pub const USING: &str = "using";

/// Payload a locker reports after a successful read-write cycle.
pub const RW_SUCCESS: &str = "rwsuccess";

/// Payload a locker reports after a successful write.
pub const W_SUCCESS: &str = "wsuccess";

/// Payloads that mean a key was already written (or the box is in use).
pub const USING_OR_WRITTEN: [&str; 3] = [USING, RW_SUCCESS, W_SUCCESS];

/// The action a caller requests against one locker.
///
/// The variant decides which payloads count as "already written" when an
/// attempt is retried, and whether a network path exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ActionKind {
    /// Deposit into the locker.
    Put,
    /// Collect from the locker.
    Take,
    /// Open the locker for maintenance staff.
    OpenForMaintenance,
    /// Read the locker's raw status payload only.
    Read,
}

impl ActionKind {
    /// Whether a payload read on a retry shows that a previous attempt
    /// already completed the write.
    ///
    /// # Examples
    ///
    /// ```
    /// use locker_types::ActionKind;
    ///
    /// assert!(ActionKind::Put.is_already_written("wsuccess"));
    /// assert!(!ActionKind::Put.is_already_written("2478699286901811"));
    /// assert!(ActionKind::Take.is_already_written("2478699286901811"));
    /// assert!(!ActionKind::Take.is_already_written("using"));
    /// ```
    #[must_use]
    pub fn is_already_written(&self, payload: &str) -> bool {
        match self {
            ActionKind::Put | ActionKind::OpenForMaintenance => USING_OR_WRITTEN.contains(&payload),
            ActionKind::Take => payload != USING,
            ActionKind::Read => false,
        }
    }

    /// Whether this action can fall over to a location-authenticated
    /// network request.
    #[must_use]
    pub fn has_network_fallback(&self) -> bool {
        !matches!(self, ActionKind::Read)
    }

    /// Whether the handshake writes a key to the locker.
    #[must_use]
    pub fn writes_key(&self) -> bool {
        !matches!(self, ActionKind::Read)
    }

    /// Whether the action needs an authorization token.
    #[must_use]
    pub fn requires_token(&self) -> bool {
        !matches!(self, ActionKind::Read)
    }

    /// Stable lowercase name, used in logs and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Put => "put",
            ActionKind::Take => "take",
            ActionKind::OpenForMaintenance => "open_for_maintenance",
            ActionKind::Read => "read",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "put" => Ok(ActionKind::Put),
            "take" => Ok(ActionKind::Take),
            "open_for_maintenance" | "maintenance" => Ok(ActionKind::OpenForMaintenance),
            "read" => Ok(ActionKind::Read),
            _ => Err(ParseError::UnknownAction(s.to_string())),
        }
    }
}

/// Progress of one handshake attempt against a locker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProtocolStatus {
    /// Nothing written yet in this attempt.
    #[default]
    None,
    /// The key was written once in this attempt.
    WroteOnce,
}

/// Opaque handle for a physical link, issued by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkHandle(String);

impl LinkHandle {
    /// Wrap a transport-specific identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The transport-specific identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A GATT service exposed on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServiceHandle {
    /// Service UUID.
    pub uuid: Uuid,
}

impl ServiceHandle {
    /// Create a service handle.
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

/// The characteristic the handshake reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicHandle {
    /// UUID of the owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl CharacteristicHandle {
    /// Create a handle for characteristic `uuid` of `service`.
    pub fn new(service: ServiceHandle, uuid: Uuid) -> Self {
        Self {
            service: service.uuid,
            uuid,
        }
    }
}

/// A locker seen during discovery, plus the state of the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LockerDevice {
    /// Locker identifier, matched against the caller's requested id.
    pub id: String,
    /// Physical link, present while discovered or connected.
    pub link: Option<LinkHandle>,
    read_data: String,
    status: ProtocolStatus,
}

impl LockerDevice {
    /// Create a device record as reported by discovery.
    pub fn new(id: impl Into<String>, link: Option<LinkHandle>) -> Self {
        Self {
            id: id.into(),
            link,
            read_data: String::new(),
            status: ProtocolStatus::None,
        }
    }

    /// Last payload read from the characteristic.
    pub fn read_data(&self) -> &str {
        &self.read_data
    }

    /// Current protocol status.
    pub fn status(&self) -> ProtocolStatus {
        self.status
    }

    /// Reset the per-attempt state. Called at the start of every attempt.
    pub fn reset_for_attempt(&mut self) {
        self.read_data.clear();
        self.status = ProtocolStatus::None;
    }

    /// Store a decoded payload. The status is left unchanged.
    pub fn set_read_data(&mut self, payload: impl Into<String>) {
        self.read_data = payload.into();
    }

    /// Record that the key was written. The status never moves back to
    /// [`ProtocolStatus::None`] within an attempt.
    pub fn mark_written(&mut self) {
        self.status = ProtocolStatus::WroteOnce;
    }
}

/// Decode a raw characteristic value into the locker's status string.
///
/// Invalid UTF-8 is replaced, and trailing NUL bytes and whitespace are
/// trimmed.
///
/// ```
/// use locker_types::decode_payload;
///
/// assert_eq!(decode_payload(b"wsuccess\0\0"), "wsuccess");
/// ```
#[must_use]
pub fn decode_payload(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// A device location fix.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coordinates {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl Coordinates {
    /// Create a coordinate pair, rejecting out-of-range values.
    pub fn new(lat: f64, lng: f64) -> Result<Self, ParseError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(ParseError::InvalidCoordinates { lat, lng });
        }
        Ok(Self { lat, lng })
    }
}

/// Locker metadata returned by the locker directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LockerInfo {
    /// Locker identifier.
    pub id: String,
    /// Whether the locker prefers the location-authenticated network path.
    #[cfg_attr(feature = "serde", serde(default))]
    pub network_capable: bool,
}
