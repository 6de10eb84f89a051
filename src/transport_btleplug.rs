use crate::transport::bgx_uuids::CCCD;
use crate::transport::{
    BondState, CharacteristicInfo, DiscoveredDevice, DiscoveredService, GattStatus, Link, LinkEvent, ScanFilter,
    Transport, TransportError, WriteType,
};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const GATT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => TransportError::Refused(e.to_string()),
            btleplug::Error::NotSupported(_) => TransportError::Unsupported("operation not supported by the platform"),
            other => {
                debug!("btleplug error: {}", other);
                TransportError::Status(GattStatus::FAILURE)
            }
        }
    }
}

async fn timeout<F, T>(future: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, btleplug::Error>>,
{
    match tokio::time::timeout(GATT_TIMEOUT, future).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TransportError::Status(GattStatus::FAILURE)),
    }
}

fn characteristic_info(chr: &Characteristic) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: chr.uuid,
        read: chr.properties.contains(CharPropFlags::READ),
        write: chr.properties.contains(CharPropFlags::WRITE),
        write_without_response: chr.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: chr.properties.contains(CharPropFlags::NOTIFY),
        indicate: chr.properties.contains(CharPropFlags::INDICATE),
    }
}

/// BGX transport over the first Bluetooth adapter btleplug reports
pub struct BtleplugTransport {
    central: Adapter,
}

impl BtleplugTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Refused("no Bluetooth adapter".into()))?;
        Ok(BtleplugTransport { central })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        for peripheral in self.central.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address)
                || peripheral.id().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(peripheral);
            }
        }
        Err(TransportError::Refused(format!("device {} not found", address)))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn scan(&self, filter: ScanFilter) -> Result<BoxStream<'static, DiscoveredDevice>, TransportError> {
        let events = self.central.events().await?;
        self.central
            .start_scan(btleplug::api::ScanFilter {
                services: filter.services,
            })
            .await?;
        let central = self.central.clone();
        let devices = events.filter_map(move |event| {
            let central = central.clone();
            async move {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    return None;
                };
                let peripheral = central.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok().flatten();
                Some(DiscoveredDevice {
                    address: peripheral.address().to_string(),
                    name: props.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: props.as_ref().and_then(|p| p.rssi),
                })
            }
        });
        Ok(devices.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(self.central.stop_scan().await?)
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn Link>, TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        Ok(Arc::new(BtleplugLink {
            central: self.central.clone(),
            peripheral,
        }))
    }
}

pub struct BtleplugLink {
    central: Adapter,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn find_characteristic_by_uuid(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|chr| chr.uuid == uuid)
            .ok_or_else(|| TransportError::Refused(format!("characteristic {} not found", uuid)))
    }
}

#[async_trait]
impl Link for BtleplugLink {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>, TransportError> {
        let notifications = self.peripheral.notifications().await?.map(|ntf| LinkEvent::Notification {
            characteristic: ntf.uuid,
            value: ntf.value,
        });
        let id: PeripheralId = self.peripheral.id();
        let disconnects = self.central.events().await?.filter_map(move |event| {
            let event = match event {
                CentralEvent::DeviceDisconnected(gone) if gone == id => Some(LinkEvent::Disconnected {
                    status: GattStatus::SUCCESS,
                }),
                _ => None,
            };
            async move { event }
        });
        Ok(stream::select(notifications, disconnects).boxed())
    }

    async fn connect(&self) -> Result<(), TransportError> {
        timeout(self.peripheral.connect()).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        timeout(self.peripheral.disconnect()).await
    }

    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        timeout(self.peripheral.discover_services()).await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(characteristic_info).collect(),
            })
            .collect())
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let chr = self.find_characteristic_by_uuid(characteristic)?;
        timeout(self.peripheral.read(&chr)).await
    }

    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let chr = self.find_characteristic_by_uuid(characteristic)?;
        let write_type = match write_type {
            WriteType::WithResponse => btleplug::api::WriteType::WithResponse,
            WriteType::WithoutResponse => btleplug::api::WriteType::WithoutResponse,
        };
        timeout(self.peripheral.write(&chr, value, write_type)).await
    }

    async fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<(), TransportError> {
        // btleplug writes the CCCD itself on subscribe
        if descriptor == CCCD {
            trace!(%characteristic, "CCCD write deferred to subscribe");
            return Ok(());
        }
        let chr = self.find_characteristic_by_uuid(characteristic)?;
        let desc = chr
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or_else(|| TransportError::Refused(format!("descriptor {} not found", descriptor)))?;
        timeout(self.peripheral.write_descriptor(&desc, value)).await
    }

    async fn set_notification(&self, characteristic: Uuid, enabled: bool) -> Result<(), TransportError> {
        let chr = self.find_characteristic_by_uuid(characteristic)?;
        if enabled {
            timeout(self.peripheral.subscribe(&chr)).await
        } else {
            timeout(self.peripheral.unsubscribe(&chr)).await
        }
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16, TransportError> {
        Err(TransportError::Unsupported("MTU exchange"))
    }

    async fn set_preferred_phy(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("PHY selection"))
    }

    async fn create_bond(&self) -> Result<(), TransportError> {
        // pairing is driven by the OS when an encrypted attribute is touched
        Ok(())
    }

    async fn bond_state(&self) -> Result<BondState, TransportError> {
        match self.peripheral.is_connected().await {
            Ok(true) => Ok(BondState::Bonded),
            Ok(false) => Err(TransportError::Refused("not connected".into())),
            Err(e) => {
                warn!("bond state query failed: {}", e);
                Err(e.into())
            }
        }
    }
}
