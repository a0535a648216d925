//! Trait abstractions for the collaborators a locker session drives.
//!
//! The session only talks to these traits, so real BLE/HTTP/location
//! implementations and the mocks in [`crate::mock`] are interchangeable.
//! All traits are object safe; [`crate::LockerClient`] stores them as
//! `Arc<dyn Trait>`.

use async_trait::async_trait;
use futures::stream::BoxStream;

use locker_types::{
    CharacteristicHandle, Coordinates, LinkHandle, LockerDevice, LockerInfo, ServiceHandle,
};

use crate::error::Result;
use crate::events::{EventReceiver, OperationId};

/// Low-level scanning and connection transport.
///
/// Every method only *starts* an operation. Completion is reported as a
/// [`crate::events::TransportEvent`] on the channel returned by
/// [`Transport::subscribe`], carrying the [`OperationId`] the method
/// returned. An `Err` return means the operation could not be started at
/// all.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to completion events.
    fn subscribe(&self) -> EventReceiver;

    /// Start scanning. The transport time-boxes the scan and reports
    /// `ScanFinished` when the time box elapses.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning. Must be idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Open the physical link. Connecting an already connected link reports
    /// `Connected` right away.
    async fn connect(&self, link: &LinkHandle) -> Result<OperationId>;

    /// Close the physical link.
    async fn disconnect(&self, link: &LinkHandle) -> Result<()>;

    /// Discover the services exposed on a connected link.
    async fn discover_services(&self, link: &LinkHandle) -> Result<OperationId>;

    /// Discover the handshake characteristic(s) of one service.
    async fn discover_characteristics(
        &self,
        link: &LinkHandle,
        service: &ServiceHandle,
    ) -> Result<OperationId>;

    /// Read the characteristic value.
    async fn read(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<OperationId>;

    /// Write a value to the characteristic, with response.
    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<OperationId>;
}

/// Business key capability: computes the key to write and persists a
/// successful unlock.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Compute the bytes to write for this locker, given its last read
    /// payload.
    async fn get_key(&self, locker: &LockerDevice) -> Result<Vec<u8>>;

    /// Validate and save a successful unlock.
    async fn save_key(&self, locker: &LockerDevice) -> Result<()>;
}

/// Locker metadata lookup.
#[async_trait]
pub trait LockerDirectory: Send + Sync {
    /// Fetch metadata for one locker.
    async fn get_locker(&self, token: &str, locker_id: &str) -> Result<LockerInfo>;
}

/// Network unlock path, authenticated by device location.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Deposit into the locker over the network.
    async fn put(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()>;

    /// Collect from the locker over the network.
    async fn take(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()>;

    /// Open the locker for maintenance over the network.
    async fn open_for_maintenance(
        &self,
        token: &str,
        locker_id: &str,
        location: Coordinates,
    ) -> Result<()>;
}

/// Location permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorizationStatus {
    /// The user has not been asked yet.
    NotDetermined,
    /// Access is restricted (e.g. parental controls).
    Restricted,
    /// The user denied access.
    Denied,
    /// Access granted while the app is in use or always.
    Authorized,
}

impl AuthorizationStatus {
    /// Whether a location fix may be requested.
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthorizationStatus::Authorized)
    }

    /// Whether only the user can change the state, outside this flow.
    pub fn needs_remediation(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Denied | AuthorizationStatus::Restricted
        )
    }
}

/// Device location provider.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current permission state.
    async fn authorization_status(&self) -> AuthorizationStatus;

    /// Ask the user for permission. Does not wait for the answer.
    async fn request_authorization(&self);

    /// Request a single location fix.
    async fn request_location(&self) -> Result<Coordinates>;

    /// Stream of permission changes made after this call.
    fn authorization_changes(&self) -> BoxStream<'static, AuthorizationStatus>;
}

/// User-facing remediation shown when location permission is denied.
pub trait RemediationPrompt: Send + Sync {
    /// Offer a shortcut to the location settings.
    fn show_location_settings(&self);
}
