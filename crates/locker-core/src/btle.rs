//! BLE transport backed by btleplug.
//!
//! [`BtleTransport`] implements [`Transport`] on the first available
//! adapter. Every operation is started on a spawned task and its
//! completion is published as a [`TransportEvent`]. Lockers are identified
//! by their advertised local name; the link handle is the formatted
//! peripheral id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use locker_types::{CharacteristicHandle, LinkHandle, ServiceHandle};

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::events::{
    DiscoveredLocker, EventDispatcher, EventReceiver, OperationId, OperationIds, TransportError,
    TransportEvent, TransportResult,
};
use crate::traits::Transport;
use crate::util::{format_peripheral_id, link_for_peripheral, locker_id_from_local_name};

/// Default scan time box.
const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Options for the BLE transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtleOptions {
    /// How long a scan runs before `ScanFinished` is reported.
    pub scan_duration: Duration,
    /// Only report peripherals advertising this service, and only use this
    /// service during discovery.
    pub service_uuid: Option<Uuid>,
    /// The handshake characteristic. When unset, the first characteristic
    /// of a service is used.
    pub characteristic_uuid: Option<Uuid>,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for BtleOptions {
    fn default() -> Self {
        Self {
            scan_duration: DEFAULT_SCAN_DURATION,
            service_uuid: None,
            characteristic_uuid: None,
            event_capacity: 100,
        }
    }
}

impl BtleOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan time box.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Restrict scanning and discovery to one service.
    #[must_use]
    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = Some(uuid);
        self
    }

    /// Use a specific characteristic for the handshake.
    #[must_use]
    pub fn characteristic_uuid(mut self, uuid: Uuid) -> Self {
        self.characteristic_uuid = Some(uuid);
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.scan_duration.is_zero() {
            return Err(Error::invalid_config("scan_duration must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

type PeripheralMap = Arc<RwLock<HashMap<LinkHandle, Peripheral>>>;

/// [`Transport`] over a btleplug adapter.
pub struct BtleTransport {
    adapter: Adapter,
    options: BtleOptions,
    events: EventDispatcher,
    ops: OperationIds,
    peripherals: PeripheralMap,
    scan: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleTransport")
            .field("options", &self.options)
            .finish()
    }
}

impl BtleTransport {
    /// Create a transport on the first available adapter.
    pub async fn new(options: BtleOptions) -> Result<Self> {
        let adapter = get_adapter().await?;
        Self::with_adapter(adapter, options).await
    }

    /// Create a transport on a specific adapter.
    pub async fn with_adapter(adapter: Adapter, options: BtleOptions) -> Result<Self> {
        options.validate()?;
        let transport = Self {
            adapter,
            events: EventDispatcher::new(options.event_capacity),
            options,
            ops: OperationIds::new(),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            scan: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };
        transport.watch_disconnects().await?;
        Ok(transport)
    }

    /// The transport options.
    pub fn options(&self) -> &BtleOptions {
        &self.options
    }

    /// Report `Disconnected` for known links that drop.
    async fn watch_disconnects(&self) -> Result<()> {
        let mut stream = self.adapter.events().await?;
        let peripherals = Arc::clone(&self.peripherals);
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) => {
                            let link = link_for_peripheral(&id);
                            if peripherals.read().await.contains_key(&link) {
                                debug!(%link, "Peripheral disconnected");
                                events.send(TransportEvent::Disconnected { link });
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    async fn peripheral(&self, link: &LinkHandle) -> Result<Peripheral> {
        self.peripherals
            .read()
            .await
            .get(link)
            .cloned()
            .ok_or(Error::LinkUnavailable)
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Build a discovery record for a peripheral advertising a local name.
async fn discovered_locker(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &PeripheralMap,
) -> Option<DiscoveredLocker> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;

    let link = link_for_peripheral(id);
    peripherals.write().await.insert(link.clone(), peripheral);

    Some(DiscoveredLocker {
        id: locker_id_from_local_name(&name).to_string(),
        link,
        rssi: properties.rssi,
    })
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> TransportResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
        .ok_or_else(|| TransportError::new(format!("characteristic {} not found", handle.uuid)))
}

#[async_trait]
impl Transport for BtleTransport {
    fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    #[tracing::instrument(skip(self))]
    async fn start_scan(&self) -> Result<()> {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.scan.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let mut stream = self.adapter.events().await?;
        let filter = ScanFilter {
            services: self.options.service_uuid.into_iter().collect(),
        };
        self.adapter.start_scan(filter).await?;
        info!(duration = ?self.options.scan_duration, "Scan started");

        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let events = self.events.clone();
        let duration = self.options.scan_duration;

        tokio::spawn(async move {
            let deadline = sleep(duration);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = &mut deadline => {
                        if let Err(e) = adapter.stop_scan().await {
                            warn!(error = %e, "Failed to stop scan");
                        }
                        info!(found = seen.len(), "Scan finished");
                        events.send(TransportEvent::ScanFinished);
                        break;
                    }
                    event = stream.next() => match event {
                        Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                            if seen.contains(&id) {
                                continue;
                            }
                            if let Some(locker) = discovered_locker(&adapter, &id, &peripherals).await {
                                debug!(locker = %locker.id, link = %locker.link, rssi = ?locker.rssi, "Locker discovered");
                                seen.insert(id);
                                events.send(TransportEvent::Discovered { lockers: vec![locker] });
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn stop_scan(&self) -> Result<()> {
        let Some(token) = self.scan.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        self.adapter.stop_scan().await?;
        debug!("Scan stopped");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn connect(&self, link: &LinkHandle) -> Result<OperationId> {
        let peripheral = self.peripheral(link).await?;
        let events = self.events.clone();
        let link = link.clone();
        let op = self.ops.next();

        tokio::spawn(async move {
            let result = if peripheral.is_connected().await.unwrap_or(false) {
                Ok(())
            } else {
                peripheral.connect().await.map_err(TransportError::from)
            };
            events.send(TransportEvent::Connected { link, op, result });
        });
        Ok(op)
    }

    #[tracing::instrument(skip(self))]
    async fn disconnect(&self, link: &LinkHandle) -> Result<()> {
        let peripheral = self.peripheral(link).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
            debug!(%link, "Disconnected");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn discover_services(&self, link: &LinkHandle) -> Result<OperationId> {
        let peripheral = self.peripheral(link).await?;
        let events = self.events.clone();
        let service_filter = self.options.service_uuid;
        let link = link.clone();
        let op = self.ops.next();

        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .filter(|s| service_filter.is_none_or(|uuid| s.uuid == uuid))
                    .map(|s| ServiceHandle::new(s.uuid))
                    .collect()),
                Err(e) => Err(TransportError::from(e)),
            };
            events.send(TransportEvent::ServicesDiscovered { link, op, result });
        });
        Ok(op)
    }

    #[tracing::instrument(skip(self))]
    async fn discover_characteristics(
        &self,
        link: &LinkHandle,
        service: &ServiceHandle,
    ) -> Result<OperationId> {
        let peripheral = self.peripheral(link).await?;
        let characteristic_filter = self.options.characteristic_uuid;
        let op = self.ops.next();

        // Characteristics are resolved along with services, so the answer
        // is already known.
        let characteristics = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .filter(|c| characteristic_filter.is_none_or(|uuid| c.uuid == uuid))
                    .map(|c| CharacteristicHandle::new(*service, c.uuid))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        debug!(
            peripheral = %format_peripheral_id(&peripheral.id()),
            service = %service.uuid,
            count = characteristics.len(),
            "Characteristics resolved"
        );
        self.events.send(TransportEvent::CharacteristicsDiscovered {
            link: link.clone(),
            op,
            service: *service,
            result: Ok(characteristics),
        });
        Ok(op)
    }

    #[tracing::instrument(skip(self))]
    async fn read(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<OperationId> {
        let peripheral = self.peripheral(link).await?;
        let events = self.events.clone();
        let link = link.clone();
        let handle = *characteristic;
        let op = self.ops.next();

        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, &handle) {
                Ok(c) => peripheral.read(&c).await.map_err(TransportError::from),
                Err(e) => Err(e),
            };
            events.send(TransportEvent::ValueRead {
                link,
                op,
                characteristic: handle,
                result,
            });
        });
        Ok(op)
    }

    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<OperationId> {
        let peripheral = self.peripheral(link).await?;
        let events = self.events.clone();
        let link = link.clone();
        let handle = *characteristic;
        let data = data.to_vec();
        let op = self.ops.next();

        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, &handle) {
                Ok(c) => peripheral
                    .write(&c, &data, WriteType::WithResponse)
                    .await
                    .map_err(TransportError::from),
                Err(e) => Err(e),
            };
            events.send(TransportEvent::ValueWritten {
                link,
                op,
                characteristic: handle,
                result,
            });
        });
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = BtleOptions::default();
        assert_eq!(options.scan_duration, Duration::from_secs(10));
        assert!(options.service_uuid.is_none());
        assert!(options.characteristic_uuid.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let service = Uuid::from_u128(1);
        let characteristic = Uuid::from_u128(2);
        let options = BtleOptions::new()
            .scan_duration(Duration::from_secs(3))
            .service_uuid(service)
            .characteristic_uuid(characteristic);
        assert_eq!(options.scan_duration, Duration::from_secs(3));
        assert_eq!(options.service_uuid, Some(service));
        assert_eq!(options.characteristic_uuid, Some(characteristic));
    }

    #[test]
    fn test_options_validate() {
        let options = BtleOptions::new().scan_duration(Duration::ZERO);
        assert!(matches!(options.validate(), Err(Error::InvalidConfig(_))));
    }
}
