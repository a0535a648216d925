//! Platform-agnostic types for smart-locker BLE handshakes.
//!
//! This crate holds the data model shared by the core orchestration crate
//! and any host application embedding it.
//!
//! # Features
//!
//! - Action kinds and their "already written" policies
//! - The per-attempt locker record and its protocol status
//! - Opaque link, service and characteristic handles
//! - Location and locker metadata values
//!
//! # Example
//!
//! ```
//! use locker_types::{ActionKind, LockerDevice, ProtocolStatus};
//!
//! let mut locker = LockerDevice::new("locker-001", None);
//! locker.mark_written();
//! assert_eq!(locker.status(), ProtocolStatus::WroteOnce);
//! assert!(ActionKind::Put.has_network_fallback());
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    ActionKind, CharacteristicHandle, Coordinates, LinkHandle, LockerDevice, LockerInfo,
    ProtocolStatus, RW_SUCCESS, ServiceHandle, USING, USING_OR_WRITTEN, W_SUCCESS,
    decode_payload,
};
