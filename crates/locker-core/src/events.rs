//! Transport event stream.
//!
//! Transports only *start* operations; every completion (discovery batch,
//! connection, characteristic I/O) comes back as a [`TransportEvent`] on a
//! broadcast channel that the session task consumes in order. Each started
//! operation gets an [`OperationId`] that its completion event echoes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use locker_types::{CharacteristicHandle, LinkHandle, LockerDevice, ServiceHandle};

/// An error reported by the transport for one operation.
///
/// Cloneable so it can travel in broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransportError {
    /// Description reported by the transport.
    pub message: String,
}

impl TransportError {
    /// Create a transport error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Result of one transport operation.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Identifies one started transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Wrap a raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Hands out increasing [`OperationId`]s, starting at 1.
#[derive(Debug, Default)]
pub struct OperationIds {
    last: AtomicU64,
}

impl OperationIds {
    /// Create a counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next(&self) -> OperationId {
        OperationId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The most recently allocated id.
    pub fn last(&self) -> Option<OperationId> {
        match self.last.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(OperationId(raw)),
        }
    }
}

/// A locker seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLocker {
    /// Locker identifier (the advertised name).
    pub id: String,
    /// Link handle used to connect.
    pub link: LinkHandle,
    /// RSSI signal strength, if reported.
    pub rssi: Option<i16>,
}

impl DiscoveredLocker {
    /// Create a discovered locker record.
    pub fn new(id: impl Into<String>, link: LinkHandle) -> Self {
        Self {
            id: id.into(),
            link,
            rssi: None,
        }
    }

    /// Turn the discovery record into a device record for a handshake.
    pub fn into_device(self) -> LockerDevice {
        LockerDevice::new(self.id, Some(self.link))
    }
}

/// Completion events delivered by a transport.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportEvent {
    /// One or more lockers were seen.
    Discovered { lockers: Vec<DiscoveredLocker> },
    /// The scan time box elapsed.
    ScanFinished,
    /// A connection attempt completed.
    Connected {
        link: LinkHandle,
        op: OperationId,
        result: TransportResult<()>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        link: LinkHandle,
        op: OperationId,
        result: TransportResult<Vec<ServiceHandle>>,
    },
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        link: LinkHandle,
        op: OperationId,
        service: ServiceHandle,
        result: TransportResult<Vec<CharacteristicHandle>>,
    },
    /// A characteristic read completed.
    ValueRead {
        link: LinkHandle,
        op: OperationId,
        characteristic: CharacteristicHandle,
        result: TransportResult<Vec<u8>>,
    },
    /// A characteristic write was acknowledged.
    ValueWritten {
        link: LinkHandle,
        op: OperationId,
        characteristic: CharacteristicHandle,
        result: TransportResult<()>,
    },
    /// The link went down.
    Disconnected { link: LinkHandle },
}

impl TransportEvent {
    /// The link this event belongs to, if any.
    pub fn link(&self) -> Option<&LinkHandle> {
        match self {
            TransportEvent::Discovered { .. } | TransportEvent::ScanFinished => None,
            TransportEvent::Connected { link, .. }
            | TransportEvent::ServicesDiscovered { link, .. }
            | TransportEvent::CharacteristicsDiscovered { link, .. }
            | TransportEvent::ValueRead { link, .. }
            | TransportEvent::ValueWritten { link, .. }
            | TransportEvent::Disconnected { link } => Some(link),
        }
    }

    /// The operation this event completes. Scan and link-loss events are
    /// not completions.
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            TransportEvent::Connected { op, .. }
            | TransportEvent::ServicesDiscovered { op, .. }
            | TransportEvent::CharacteristicsDiscovered { op, .. }
            | TransportEvent::ValueRead { op, .. }
            | TransportEvent::ValueWritten { op, .. } => Some(*op),
            TransportEvent::Discovered { .. }
            | TransportEvent::ScanFinished
            | TransportEvent::Disconnected { .. } => None,
        }
    }
}

/// Sender for transport events.
pub type EventSender = broadcast::Sender<TransportEvent>;

/// Receiver for transport events.
pub type EventReceiver = broadcast::Receiver<TransportEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Event dispatcher shared by transport implementations.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: TransportEvent) {
        // No session listening is not an error
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
