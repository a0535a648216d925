//! Connection orchestration for smart-locker peripherals.
//!
//! This crate drives a caller's action (deposit, collect, maintenance
//! open, or a plain read) against a locker identified by id. It scans for
//! the locker, runs the connect/discover/read/write handshake with a
//! timeout on every stage, retries failed attempts, and switches
//! network-capable lockers to a location-authenticated network request.
//!
//! # Features
//!
//! - **Handshake state machine**: per-stage timeouts, "already written"
//!   detection on retries, key issuing and saving through a [`KeyService`]
//! - **Retry policy**: bounded wireless attempts with optional paced delay
//! - **Network fallback**: location permission handling and network unlock
//!   for lockers whose metadata says so
//! - **One session at a time**: a second action while one is running fails
//!   with [`Error::Busy`]
//! - **Pluggable collaborators**: a `btleplug` transport, an HTTP API client
//!   (feature `service-client`) and scriptable mocks
//!
//! # Session flow
//!
//! | Phase | Ends with |
//! |-------|-----------|
//! | Scanning | Target discovered, or `DeviceNotFound` when the scan time box elapses |
//! | Handshaking | Unlocked or payload, or a stage error handed to the retry policy |
//! | Fallback | Network unlock result, for network-capable lockers after the first failure |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use locker_core::{BtleOptions, BtleTransport, LockerClient};
//! use locker_core::mock::MockKeyService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleTransport::new(BtleOptions::default()).await?;
//!     let client = LockerClient::builder(Arc::new(transport))
//!         .key_service(Arc::new(MockKeyService::new()))
//!         .build()?;
//!
//!     let path = client.put("user-token", "locker-001").await?;
//!     println!("Unlocked via {}", path);
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod client;
pub mod error;
pub mod events;
pub mod location;
pub mod mock;
pub mod protocol;
pub mod retry;
#[cfg(feature = "service-client")]
pub mod service_client;
pub mod session;
pub mod timeouts;
pub mod traits;
pub mod util;

// Core exports
pub use btle::{BtleOptions, BtleTransport};
pub use client::{ClientConfig, LockerClient, LockerClientBuilder};
pub use error::{DeviceNotFoundReason, Error, Result, StageFailure};
pub use retry::RetryPolicy;
pub use session::{RequestSession, SessionOutcome, UnlockPath};
pub use timeouts::{Stage, StageTimeouts};
pub use traits::{
    AuthorizationStatus, KeyService, LocationProvider, LockerDirectory, NetworkClient,
    RemediationPrompt, Transport,
};

pub use events::{
    DiscoveredLocker, EventDispatcher, EventReceiver, OperationId, OperationIds, TransportError,
    TransportEvent, TransportResult,
};
pub use protocol::{Handshake, HandshakeOutcome, HandshakeState};
pub use util::format_peripheral_id;

#[cfg(feature = "service-client")]
pub use service_client::{ApiClient, ApiConfig};

// Re-export from locker-types
pub use locker_types::{
    ActionKind, Coordinates, LinkHandle, LockerDevice, LockerInfo, ProtocolStatus,
};
