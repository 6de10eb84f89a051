//! Events delivered to the host's event sink.

use crate::device_info::{BusMode, PartId};
use crate::ota::OtaStatus;
use crate::transport::{DiscoveredDevice, GattStatus};

/// Connection state of a device session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Bonding,
    Interrogating,
    Connected,
    Disconnecting,
}

/// Why a connection attempt or connection failed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionErrorKind {
    /// The transport could not find or open the device
    DeviceNotFound,
    /// Disconnected with a non-success status
    Gatt,
    /// A descriptor write failed while interrogating
    Setup,
    /// Bonding failed or was rejected
    BondingFailed,
    /// Bond polling gave up
    BondTimeout,
    /// The BGX streaming or OTA service is missing
    ServicesMissing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BgxEvent {
    ConnectionStateChanged {
        address: String,
        state: ConnectionState,
        bonded: bool,
        status: Option<GattStatus>,
    },
    ConnectionError {
        address: String,
        kind: ConnectionErrorKind,
        status: GattStatus,
    },
    BusModeChanged {
        address: String,
        mode: BusMode,
    },
    BusModePasswordRequired {
        address: String,
    },
    DataReceived {
        address: String,
        data: Vec<u8>,
    },
    ScanModeChanged {
        scanning: bool,
    },
    DeviceDiscovered(DiscoveredDevice),
    DeviceInfo {
        address: String,
        device_uuid: String,
        part_identifier: String,
        part_id: PartId,
        platform: Option<String>,
    },
    FirmwareRevision {
        address: String,
        platform: String,
        revision: String,
        bootloader_version: Option<u32>,
    },
    OtaStatus {
        address: String,
        status: OtaStatus,
        failed: bool,
    },
    OtaProgress {
        address: String,
        bytes_sent: usize,
    },
    MtuChanged {
        address: String,
        mtu: u16,
        status: GattStatus,
    },
    /// The firmware revision looked wrong; the OS probably cached GATT
    /// handles. The user has to forget and re-pair the device.
    InvalidGattHandles {
        address: String,
        name: Option<String>,
    },
    /// An operation was refused too many times and dropped
    OperationFailed {
        address: String,
        operation: &'static str,
        status: GattStatus,
    },
}

impl BgxEvent {
    pub fn address(&self) -> Option<&str> {
        match self {
            BgxEvent::ConnectionStateChanged { address, .. }
            | BgxEvent::ConnectionError { address, .. }
            | BgxEvent::BusModeChanged { address, .. }
            | BgxEvent::BusModePasswordRequired { address }
            | BgxEvent::DataReceived { address, .. }
            | BgxEvent::DeviceInfo { address, .. }
            | BgxEvent::FirmwareRevision { address, .. }
            | BgxEvent::OtaStatus { address, .. }
            | BgxEvent::OtaProgress { address, .. }
            | BgxEvent::MtuChanged { address, .. }
            | BgxEvent::InvalidGattHandles { address, .. }
            | BgxEvent::OperationFailed { address, .. } => Some(address),
            BgxEvent::DeviceDiscovered(device) => Some(&device.address),
            BgxEvent::ScanModeChanged { .. } => None,
        }
    }
}
