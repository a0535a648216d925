//! Mock collaborators for testing.
//!
//! This module provides scriptable stand-ins for every trait a
//! [`crate::LockerClient`] drives, so sessions can be tested without BLE
//! hardware, a locker backend or a location service.
//!
//! # Features
//!
//! - **Scripted replies**: queue one reply per transport operation, including
//!   [`Reply::Silent`] to leave an operation unanswered and trip its timer
//! - **Call log**: every transport and network call is recorded in order
//! - **Failure injection**: key service, directory and network failures, and
//!   a key service that never answers

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use locker_types::{
    ActionKind, CharacteristicHandle, Coordinates, LinkHandle, LockerDevice, LockerInfo,
    ServiceHandle,
};

use crate::error::{Error, Result};
use crate::events::{
    DiscoveredLocker, EventDispatcher, EventReceiver, OperationId, OperationIds, TransportError,
    TransportEvent, TransportResult,
};
use crate::traits::{
    AuthorizationStatus, KeyService, LocationProvider, LockerDirectory, NetworkClient,
    RemediationPrompt, Transport,
};

/// Service UUID reported by [`MockTransport`] by default.
pub const MOCK_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic UUID reported by [`MockTransport`] by default.
pub const MOCK_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// The link handle [`MockTransport`] reports for a locker id.
pub fn mock_link(locker_id: &str) -> LinkHandle {
    LinkHandle::new(format!("MOCK-{}", locker_id))
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A scripted reply to one transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// The operation's default behavior.
    Default,
    /// Complete successfully with this value.
    Value(T),
    /// Complete with a transport error.
    Error(String),
    /// Never complete.
    Silent,
}

impl<T> Reply<T> {
    fn resolve(self, default: impl FnOnce() -> T) -> Option<TransportResult<T>> {
        match self {
            Reply::Default => Some(Ok(default())),
            Reply::Value(value) => Some(Ok(value)),
            Reply::Error(message) => Some(Err(TransportError::new(message))),
            Reply::Silent => None,
        }
    }
}

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect { link: LinkHandle },
    /// `disconnect`
    Disconnect { link: LinkHandle },
    /// `discover_services`
    DiscoverServices { link: LinkHandle },
    /// `discover_characteristics`
    DiscoverCharacteristics {
        link: LinkHandle,
        service: ServiceHandle,
    },
    /// `read`
    Read {
        link: LinkHandle,
        characteristic: CharacteristicHandle,
    },
    /// `write`
    Write {
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct Script {
    batches: VecDeque<Vec<DiscoveredLocker>>,
    connect: VecDeque<Reply<()>>,
    services: VecDeque<Reply<Vec<ServiceHandle>>>,
    characteristics: VecDeque<Reply<Vec<CharacteristicHandle>>>,
    reads: VecDeque<Reply<Vec<u8>>>,
    writes: VecDeque<Reply<()>>,
    default_read: Option<Reply<Vec<u8>>>,
}

/// A scriptable [`Transport`].
///
/// Operations complete synchronously: the completion event is broadcast
/// before the operation call returns. With nothing scripted, every
/// operation succeeds, services and characteristics are reported with
/// [`MOCK_SERVICE_UUID`] and [`MOCK_CHARACTERISTIC_UUID`], and reads
/// return `using`.
///
/// # Example
///
/// ```
/// use locker_core::mock::{MockTransport, Reply};
///
/// let transport = MockTransport::new()
///     .with_locker("locker-001")
///     .with_read(Reply::Value(b"using".to_vec()))
///     .with_write(Reply::Silent);
/// # let _ = transport;
/// ```
pub struct MockTransport {
    events: EventDispatcher,
    ops: OperationIds,
    script: Mutex<Script>,
    finish_scan: bool,
    scanning: AtomicBool,
    calls: Mutex<Vec<TransportCall>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("finish_scan", &self.finish_scan)
            .field("scanning", &self.scanning.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a transport that discovers nothing.
    pub fn new() -> Self {
        Self {
            events: EventDispatcher::default(),
            ops: OperationIds::new(),
            script: Mutex::new(Script::default()),
            finish_scan: true,
            scanning: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn script(&mut self) -> &mut Script {
        self.script.get_mut()
    }

    /// Report one discovery batch when scanning starts.
    #[must_use]
    pub fn with_batch(mut self, lockers: Vec<DiscoveredLocker>) -> Self {
        self.script().batches.push_back(lockers);
        self
    }

    /// Report a batch holding one locker, linked via [`mock_link`].
    #[must_use]
    pub fn with_locker(self, locker_id: &str) -> Self {
        self.with_batch(vec![DiscoveredLocker::new(locker_id, mock_link(locker_id))])
    }

    /// Do not report `ScanFinished` after the batches.
    #[must_use]
    pub fn without_scan_finish(mut self) -> Self {
        self.finish_scan = false;
        self
    }

    /// Queue a reply to `connect`.
    #[must_use]
    pub fn with_connect(mut self, reply: Reply<()>) -> Self {
        self.script().connect.push_back(reply);
        self
    }

    /// Queue a reply to `discover_services`.
    #[must_use]
    pub fn with_services(mut self, reply: Reply<Vec<ServiceHandle>>) -> Self {
        self.script().services.push_back(reply);
        self
    }

    /// Queue a reply to `discover_characteristics`.
    #[must_use]
    pub fn with_characteristics(mut self, reply: Reply<Vec<CharacteristicHandle>>) -> Self {
        self.script().characteristics.push_back(reply);
        self
    }

    /// Queue a reply to `read`.
    #[must_use]
    pub fn with_read(mut self, reply: Reply<Vec<u8>>) -> Self {
        self.script().reads.push_back(reply);
        self
    }

    /// Reply to every unscripted `read` with `reply`.
    #[must_use]
    pub fn with_default_read(mut self, reply: Reply<Vec<u8>>) -> Self {
        self.script().default_read = Some(reply);
        self
    }

    /// Queue a reply to `write`.
    #[must_use]
    pub fn with_write(mut self, reply: Reply<()>) -> Self {
        self.script().writes.push_back(reply);
        self
    }

    /// Inject an event as if the transport had reported it.
    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub async fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|c| predicate(c)).count()
    }

    /// Id of the most recently started operation.
    pub fn last_operation(&self) -> Option<OperationId> {
        self.ops.last()
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Relaxed)
    }

    async fn record(&self, call: TransportCall) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(TransportCall::StartScan).await;
        self.scanning.store(true, Ordering::Relaxed);

        let batches: Vec<_> = self.script.lock().await.batches.drain(..).collect();
        for lockers in batches {
            self.events.send(TransportEvent::Discovered { lockers });
        }
        if self.finish_scan {
            self.events.send(TransportEvent::ScanFinished);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan).await;
        self.scanning.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn connect(&self, link: &LinkHandle) -> Result<OperationId> {
        self.record(TransportCall::Connect { link: link.clone() }).await;
        let op = self.ops.next();
        let reply = self.script.lock().await.connect.pop_front();
        if let Some(result) = reply.unwrap_or(Reply::Default).resolve(|| ()) {
            self.events.send(TransportEvent::Connected {
                link: link.clone(),
                op,
                result,
            });
        }
        Ok(op)
    }

    async fn disconnect(&self, link: &LinkHandle) -> Result<()> {
        self.record(TransportCall::Disconnect { link: link.clone() }).await;
        self.events
            .send(TransportEvent::Disconnected { link: link.clone() });
        Ok(())
    }

    async fn discover_services(&self, link: &LinkHandle) -> Result<OperationId> {
        self.record(TransportCall::DiscoverServices { link: link.clone() })
            .await;
        let op = self.ops.next();
        let reply = self.script.lock().await.services.pop_front();
        let default = || vec![ServiceHandle::new(MOCK_SERVICE_UUID)];
        if let Some(result) = reply.unwrap_or(Reply::Default).resolve(default) {
            self.events.send(TransportEvent::ServicesDiscovered {
                link: link.clone(),
                op,
                result,
            });
        }
        Ok(op)
    }

    async fn discover_characteristics(
        &self,
        link: &LinkHandle,
        service: &ServiceHandle,
    ) -> Result<OperationId> {
        self.record(TransportCall::DiscoverCharacteristics {
            link: link.clone(),
            service: *service,
        })
        .await;
        let op = self.ops.next();
        let reply = self.script.lock().await.characteristics.pop_front();
        let default = || vec![CharacteristicHandle::new(*service, MOCK_CHARACTERISTIC_UUID)];
        if let Some(result) = reply.unwrap_or(Reply::Default).resolve(default) {
            self.events.send(TransportEvent::CharacteristicsDiscovered {
                link: link.clone(),
                op,
                service: *service,
                result,
            });
        }
        Ok(op)
    }

    async fn read(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<OperationId> {
        self.record(TransportCall::Read {
            link: link.clone(),
            characteristic: *characteristic,
        })
        .await;
        let op = self.ops.next();
        let reply = {
            let mut script = self.script.lock().await;
            match script.reads.pop_front() {
                Some(reply) => reply,
                None => script.default_read.clone().unwrap_or(Reply::Default),
            }
        };
        if let Some(result) = reply.resolve(|| locker_types::USING.as_bytes().to_vec()) {
            self.events.send(TransportEvent::ValueRead {
                link: link.clone(),
                op,
                characteristic: *characteristic,
                result,
            });
        }
        Ok(op)
    }

    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<OperationId> {
        self.record(TransportCall::Write {
            link: link.clone(),
            characteristic: *characteristic,
            data: data.to_vec(),
        })
        .await;
        let op = self.ops.next();
        let reply = self.script.lock().await.writes.pop_front();
        if let Some(result) = reply.unwrap_or(Reply::Default).resolve(|| ()) {
            self.events.send(TransportEvent::ValueWritten {
                link: link.clone(),
                op,
                characteristic: *characteristic,
                result,
            });
        }
        Ok(op)
    }
}

/// A [`KeyService`] returning a fixed key.
#[derive(Debug)]
pub struct MockKeyService {
    key: Vec<u8>,
    stalled: AtomicBool,
    get_key_error: RwLock<Option<String>>,
    save_key_error: RwLock<Option<String>>,
    get_key_count: AtomicU32,
    save_key_count: AtomicU32,
    saved: RwLock<Vec<LockerDevice>>,
}

impl Default for MockKeyService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKeyService {
    /// Create a key service that returns `MOCK-KEY`.
    pub fn new() -> Self {
        Self::with_key(b"MOCK-KEY".to_vec())
    }

    /// Create a key service that returns `key`.
    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key,
            stalled: AtomicBool::new(false),
            get_key_error: RwLock::new(None),
            save_key_error: RwLock::new(None),
            get_key_count: AtomicU32::new(0),
            save_key_count: AtomicU32::new(0),
            saved: RwLock::new(Vec::new()),
        }
    }

    /// Make every later call hang without answering.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::Relaxed);
    }

    async fn wait_if_stalled(&self) {
        if self.stalled.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
    }

    /// Make `get_key` fail with `message`.
    pub fn fail_get_key(&self, message: &str) {
        *write_lock(&self.get_key_error) = Some(message.to_string());
    }

    /// Make `save_key` fail with `message`.
    pub fn fail_save_key(&self, message: &str) {
        *write_lock(&self.save_key_error) = Some(message.to_string());
    }

    /// Number of `get_key` calls.
    pub fn get_key_count(&self) -> u32 {
        self.get_key_count.load(Ordering::Relaxed)
    }

    /// Number of `save_key` calls.
    pub fn save_key_count(&self) -> u32 {
        self.save_key_count.load(Ordering::Relaxed)
    }

    /// Locker records passed to successful `save_key` calls.
    pub fn saved(&self) -> Vec<LockerDevice> {
        read_lock(&self.saved).clone()
    }
}

#[async_trait]
impl KeyService for MockKeyService {
    async fn get_key(&self, _locker: &LockerDevice) -> Result<Vec<u8>> {
        self.get_key_count.fetch_add(1, Ordering::Relaxed);
        self.wait_if_stalled().await;
        if let Some(message) = read_lock(&self.get_key_error).clone() {
            return Err(Error::key_failed(message));
        }
        Ok(self.key.clone())
    }

    async fn save_key(&self, locker: &LockerDevice) -> Result<()> {
        self.save_key_count.fetch_add(1, Ordering::Relaxed);
        self.wait_if_stalled().await;
        if let Some(message) = read_lock(&self.save_key_error).clone() {
            return Err(Error::key_failed(message));
        }
        write_lock(&self.saved).push(locker.clone());
        Ok(())
    }
}

/// A [`LockerDirectory`] answering every lookup the same way.
#[derive(Debug, Default)]
pub struct MockLockerDirectory {
    network_capable: bool,
    error: RwLock<Option<String>>,
    lookups: AtomicU32,
}

impl MockLockerDirectory {
    /// Create a directory reporting lockers as wireless-only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every locker as network capable.
    #[must_use]
    pub fn network_capable(mut self) -> Self {
        self.network_capable = true;
        self
    }

    /// Make lookups fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *write_lock(&self.error) = Some(message.to_string());
    }

    /// Number of lookups made.
    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LockerDirectory for MockLockerDirectory {
    async fn get_locker(&self, _token: &str, locker_id: &str) -> Result<LockerInfo> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = read_lock(&self.error).clone() {
            return Err(Error::network_failed(message));
        }
        Ok(LockerInfo {
            id: locker_id.to_string(),
            network_capable: self.network_capable,
        })
    }
}

/// A recorded network unlock request.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkCall {
    /// Requested action.
    pub action: ActionKind,
    /// Authorization token.
    pub token: String,
    /// Target locker.
    pub locker_id: String,
    /// Location sent with the request.
    pub location: Coordinates,
}

/// A [`NetworkClient`] recording every request.
#[derive(Debug, Default)]
pub struct MockNetworkClient {
    error: RwLock<Option<String>>,
    calls: Mutex<Vec<NetworkCall>>,
}

impl MockNetworkClient {
    /// Create a client whose requests succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make requests fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *write_lock(&self.error) = Some(message.to_string());
    }

    /// Every request made so far.
    pub async fn calls(&self) -> Vec<NetworkCall> {
        self.calls.lock().await.clone()
    }

    async fn request(
        &self,
        action: ActionKind,
        token: &str,
        locker_id: &str,
        location: Coordinates,
    ) -> Result<()> {
        self.calls.lock().await.push(NetworkCall {
            action,
            token: token.to_string(),
            locker_id: locker_id.to_string(),
            location,
        });
        match read_lock(&self.error).clone() {
            Some(message) => Err(Error::network_failed(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NetworkClient for MockNetworkClient {
    async fn put(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()> {
        self.request(ActionKind::Put, token, locker_id, location)
            .await
    }

    async fn take(&self, token: &str, locker_id: &str, location: Coordinates) -> Result<()> {
        self.request(ActionKind::Take, token, locker_id, location)
            .await
    }

    async fn open_for_maintenance(
        &self,
        token: &str,
        locker_id: &str,
        location: Coordinates,
    ) -> Result<()> {
        self.request(ActionKind::OpenForMaintenance, token, locker_id, location)
            .await
    }
}

/// A [`LocationProvider`] with a fixed fix and a controllable permission.
#[derive(Debug)]
pub struct MockLocationProvider {
    status: RwLock<AuthorizationStatus>,
    fix: std::result::Result<Coordinates, String>,
    grant_on_request: bool,
    changes: RwLock<Option<broadcast::Sender<AuthorizationStatus>>>,
    authorization_requests: AtomicU32,
    location_requests: AtomicU32,
}

impl MockLocationProvider {
    /// Create an authorized provider reporting `lat`/`lng`.
    pub fn authorized(lat: f64, lng: f64) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            status: RwLock::new(AuthorizationStatus::Authorized),
            fix: Ok(Coordinates { lat, lng }),
            grant_on_request: false,
            changes: RwLock::new(Some(changes)),
            authorization_requests: AtomicU32::new(0),
            location_requests: AtomicU32::new(0),
        }
    }

    /// Start with `status` instead of authorized.
    #[must_use]
    pub fn with_status(self, status: AuthorizationStatus) -> Self {
        *write_lock(&self.status) = status;
        self
    }

    /// Grant access when permission is requested.
    #[must_use]
    pub fn grant_on_request(mut self) -> Self {
        self.grant_on_request = true;
        self
    }

    /// Make fix requests fail with `message`.
    #[must_use]
    pub fn fail_location(mut self, message: &str) -> Self {
        self.fix = Err(message.to_string());
        self
    }

    /// Change the permission, as the user would from the settings.
    pub fn set_authorization(&self, status: AuthorizationStatus) {
        *write_lock(&self.status) = status;
        if let Some(changes) = read_lock(&self.changes).as_ref() {
            let _ = changes.send(status);
        }
    }

    /// End every permission-change stream.
    pub fn close_changes(&self) {
        write_lock(&self.changes).take();
    }

    /// Number of permission requests.
    pub fn authorization_requests(&self) -> u32 {
        self.authorization_requests.load(Ordering::Relaxed)
    }

    /// Number of fix requests.
    pub fn location_requests(&self) -> u32 {
        self.location_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn authorization_status(&self) -> AuthorizationStatus {
        *read_lock(&self.status)
    }

    async fn request_authorization(&self) {
        self.authorization_requests.fetch_add(1, Ordering::Relaxed);
        if self.grant_on_request {
            self.set_authorization(AuthorizationStatus::Authorized);
        }
    }

    async fn request_location(&self) -> Result<Coordinates> {
        self.location_requests.fetch_add(1, Ordering::Relaxed);
        self.fix.clone().map_err(Error::LocationUnavailable)
    }

    fn authorization_changes(&self) -> BoxStream<'static, AuthorizationStatus> {
        let Some(receiver) = read_lock(&self.changes).as_ref().map(|c| c.subscribe()) else {
            return futures::stream::empty().boxed();
        };
        futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(status) => return Some((status, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// A [`RemediationPrompt`] counting how often it was shown.
#[derive(Debug, Default)]
pub struct MockPrompt {
    shown: AtomicU32,
}

impl MockPrompt {
    /// Create a prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the prompt was shown.
    pub fn shown_count(&self) -> u32 {
        self.shown.load(Ordering::Relaxed)
    }
}

impl RemediationPrompt for MockPrompt {
    fn show_location_settings(&self) {
        self.shown.fetch_add(1, Ordering::Relaxed);
    }
}
