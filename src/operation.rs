use crate::device_info::BusMode;
use crate::fastack::CreditMessage;
use crate::ota::FirmwareImage;
use crate::transport::WriteType;

/// What a queued operation does once it reaches the head of the queue
#[derive(Debug)]
pub enum OpKind {
    // connection setup
    EnableModeNotification,
    EnableTxNotification,
    SetPreferredPhy,
    SetupFastAck,
    ReadFirmwareRevision,
    /// Report `Connected` once the setup ahead of it has run
    AnnounceConnected,
    PollBondState,

    RequestMtu(u16),
    ReturnRxCredit(CreditMessage),
    ReadBusMode,
    WriteBusMode {
        mode: BusMode,
        password: Option<String>,
    },
    WriteSerial(Vec<u8>),
    GetDeviceInfo,
    SetAcknowledgedWrites(bool),
    SetAcknowledgedReads(bool),
    StartOta {
        image: Option<FirmwareImage>,
        password: Option<String>,
        write_type: WriteType,
    },
}

#[derive(Debug)]
pub struct Operation {
    pub kind: OpKind,
    pub retries: u32,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Operation { kind, retries: 0 }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            OpKind::EnableModeNotification => "enable-mode-notification",
            OpKind::EnableTxNotification => "enable-tx-notification",
            OpKind::SetPreferredPhy => "set-preferred-phy",
            OpKind::SetupFastAck => "setup-fastack",
            OpKind::ReadFirmwareRevision => "read-firmware-revision",
            OpKind::AnnounceConnected => "announce-connected",
            OpKind::PollBondState => "poll-bond-state",
            OpKind::RequestMtu(_) => "request-mtu",
            OpKind::ReturnRxCredit(_) => "return-rx-credit",
            OpKind::ReadBusMode => "read-bus-mode",
            OpKind::WriteBusMode { .. } => "write-bus-mode",
            OpKind::WriteSerial(_) => "write-serial",
            OpKind::GetDeviceInfo => "get-device-info",
            OpKind::SetAcknowledgedWrites(_) => "set-acknowledged-writes",
            OpKind::SetAcknowledgedReads(_) => "set-acknowledged-reads",
            OpKind::StartOta { .. } => "start-ota",
        }
    }

    /// Part of the connection setup that must finish before `Connected`.
    pub fn is_setup(&self) -> bool {
        matches!(
            self.kind,
            OpKind::EnableModeNotification
                | OpKind::EnableTxNotification
                | OpKind::SetPreferredPhy
                | OpKind::SetupFastAck
                | OpKind::ReadFirmwareRevision
        )
    }

    pub fn is_ota(&self) -> bool {
        matches!(self.kind, OpKind::StartOta { .. })
    }
}
