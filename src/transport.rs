use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// BGX service, characteristic & descriptor UUIDs
///
/// These are the de facto wire protocol of BGX firmware and must not change.
#[allow(dead_code)]
pub mod bgx_uuids {
    use uuid::Uuid;

    /// BGX Streaming Service (BGXSS)
    pub const STREAM_SERVICE: Uuid = Uuid::from_u128(0x331A36F5_2459_45EA_9D95_6142F0C4B307);
    /// Serial RX Characteristic (host writes, device may notify FastAck backchannel)
    pub const RX: Uuid = Uuid::from_u128(0xA9DA6040_0823_4995_94EC_9CE41CA28833);
    /// Serial TX Characteristic (device notifies serial data)
    pub const TX: Uuid = Uuid::from_u128(0xA73E9A10_628F_4494_A099_12EFAF72258F);
    /// Bus Mode Characteristic
    pub const MODE: Uuid = Uuid::from_u128(0x75A9F022_AF03_4E41_B4BC_9DE90A47D50B);

    /// OTA Service
    pub const OTA_SERVICE: Uuid = Uuid::from_u128(0x169B52A0_B7FD_40DA_998C_DD9238327E55);
    /// OTA Control Characteristic
    pub const OTA_CONTROL: Uuid = Uuid::from_u128(0x902EE692_6EF9_48A8_A430_5212EEB3E5A2);
    /// OTA Data Characteristic
    pub const OTA_DATA: Uuid = Uuid::from_u128(0x503A5D70_B443_466E_9AEB_C342802B184E);
    /// OTA Device ID Characteristic
    pub const OTA_DEVICE_ID: Uuid = Uuid::from_u128(0x12E868E7_C926_4906_96C8_A7EE81D4B1B3);

    /// Device Information Service (16 bit UUID 0x180A)
    pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180A_0000_1000_8000_00805F9B34FB);
    /// Firmware Revision String Characteristic (16 bit UUID 0x2A26)
    pub const FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002A26_0000_1000_8000_00805F9B34FB);

    /// Client Characteristic Configuration Descriptor (16 bit UUID 0x2902)
    pub const CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);
}

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Status code delivered with every transport completion
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x0000);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x0005);
    pub const FAILURE: GattStatus = GattStatus(0x0101);
    /// Used when a device cannot be located before connecting
    pub const DEVICE_NOT_FOUND: GattStatus = GattStatus(0xFFFF);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Bond state as reported by the radio stack
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Acknowledgement mode of a characteristic write
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport refused to start the call (e.g. handle invalidated).
    #[error("transport refused the request: {0}")]
    Refused(String),
    /// The call ran and completed with a bad status.
    #[error("transport completed with status {0}")]
    Status(GattStatus),
    /// The capability does not exist on this transport.
    #[error("not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Status to report to the host for this failure.
    pub fn status(&self) -> GattStatus {
        match self {
            TransportError::Status(status) => *status,
            _ => GattStatus::FAILURE,
        }
    }
}

/// Properties of a discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid) -> Self {
        CharacteristicInfo {
            uuid,
            read: false,
            write: false,
            write_without_response: false,
            notify: false,
            indicate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Advertisement seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

/// Unsolicited events from a connected device
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    Disconnected { status: GattStatus },
    BondStateChanged(BondState),
}

/// A single call against a device link
#[derive(Debug, Clone, PartialEq)]
pub enum GattRequest {
    Connect,
    Disconnect,
    DiscoverServices,
    BondState,
    CreateBond,
    Read { characteristic: Uuid },
    Write { characteristic: Uuid, value: Vec<u8>, write_type: WriteType },
    WriteDescriptor { characteristic: Uuid, descriptor: Uuid, value: Vec<u8> },
    SetNotification { characteristic: Uuid, enabled: bool },
    RequestMtu(u16),
    SetPreferredPhy,
}

/// Successful result of a [`GattRequest`]
#[derive(Debug, Clone, PartialEq)]
pub enum GattResponse {
    Done,
    Value(Vec<u8>),
    Services(Vec<DiscoveredService>),
    Bond(BondState),
    Mtu(u16),
}

/// BGX transport interface: scanning and opening links
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning and stream advertisements matching `filter`
    async fn scan(&self, filter: ScanFilter) -> Result<BoxStream<'static, DiscoveredDevice>, TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;
    /// Open a link handle for `address` without connecting
    async fn open(&self, address: &str) -> Result<Arc<dyn Link>, TransportError>;
}

/// Per-device transport handle
#[async_trait]
pub trait Link: Send + Sync {
    fn address(&self) -> String;
    /// Stream of notifications, disconnects and bond changes
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>, TransportError>;
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError>;
    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;
    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;
    async fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<(), TransportError>;
    async fn set_notification(&self, characteristic: Uuid, enabled: bool) -> Result<(), TransportError>;
    /// Exchange MTU, returning the negotiated value
    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError>;
    /// Ask for the 2M PHY; completes on the PHY update
    async fn set_preferred_phy(&self) -> Result<(), TransportError>;
    async fn create_bond(&self) -> Result<(), TransportError>;
    async fn bond_state(&self) -> Result<BondState, TransportError>;
}

/// Run one request against a link
pub async fn execute(link: &dyn Link, request: &GattRequest) -> Result<GattResponse, TransportError> {
    match request {
        GattRequest::Connect => link.connect().await.map(|_| GattResponse::Done),
        GattRequest::Disconnect => link.disconnect().await.map(|_| GattResponse::Done),
        GattRequest::DiscoverServices => link.discover_services().await.map(GattResponse::Services),
        GattRequest::BondState => link.bond_state().await.map(GattResponse::Bond),
        GattRequest::CreateBond => link.create_bond().await.map(|_| GattResponse::Done),
        GattRequest::Read { characteristic } => link.read_characteristic(*characteristic).await.map(GattResponse::Value),
        GattRequest::Write {
            characteristic,
            value,
            write_type,
        } => link
            .write_characteristic(*characteristic, value, *write_type)
            .await
            .map(|_| GattResponse::Done),
        GattRequest::WriteDescriptor {
            characteristic,
            descriptor,
            value,
        } => link
            .write_descriptor(*characteristic, *descriptor, value)
            .await
            .map(|_| GattResponse::Done),
        GattRequest::SetNotification { characteristic, enabled } => link
            .set_notification(*characteristic, *enabled)
            .await
            .map(|_| GattResponse::Done),
        GattRequest::RequestMtu(mtu) => link.request_mtu(*mtu).await.map(GattResponse::Mtu),
        GattRequest::SetPreferredPhy => link.set_preferred_phy().await.map(|_| GattResponse::Done),
    }
}
