//! Per-device session state machine.
//!
//! A [`DeviceSession`] performs no I/O. Host commands and transport inputs go
//! in, [`Effect`]s come out, and the actor in [`crate::actor`] carries them
//! out. Every queued operation runs to completion before the next one is
//! dispatched.

use crate::config::SessionConfig;
use crate::device_info::{BusMode, DeviceIdentity, FirmwareRevision};
use crate::error::Error;
use crate::events::{BgxEvent, ConnectionErrorKind, ConnectionState};
use crate::fastack::{CreditMessage, FlowControl};
use crate::operation::{OpKind, Operation};
use crate::ota::{FirmwareImage, OtaEngine, OtaState, OtaStatus, OtaStep};
use crate::queue::OperationQueue;
use crate::transport::{
    bgx_uuids, BondState, CharacteristicInfo, DiscoveredService, GattRequest, GattResponse, GattStatus, LinkEvent,
    TransportError, WriteType, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Host request against one device
#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect,
    CancelConnect,
    ReadBusMode,
    WriteBusMode {
        mode: BusMode,
        password: Option<String>,
    },
    WriteSerial(Vec<u8>),
    GetDeviceInfo,
    SetAcknowledgedWrites(bool),
    SetAcknowledgedReads(bool),
    RequestMtu(u16),
    StartOta {
        image: FirmwareImage,
        password: Option<String>,
        write_type: WriteType,
    },
    CancelOta,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TimerKind {
    BondPoll,
    DiscoverySettle,
    PhyTimeout,
    OtaFinish,
    FastAckWake,
    MtuRequest,
}

/// An armed timer. Only the most recently armed id of each kind is live.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Timer {
    pub kind: TimerKind,
    pub id: u64,
}

/// Something that happened outside the session
#[derive(Debug)]
pub enum Input {
    Gatt {
        request: GattRequest,
        result: Result<GattResponse, TransportError>,
    },
    Link(LinkEvent),
    Timer(Timer),
}

/// Something the session needs done
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Gatt(GattRequest),
    Emit(BgxEvent),
    Schedule { timer: Timer, delay: Duration },
}

#[derive(Debug, Default)]
struct Handles {
    rx: Option<CharacteristicInfo>,
    tx: Option<CharacteristicInfo>,
    mode: Option<CharacteristicInfo>,
    ota_control: Option<CharacteristicInfo>,
    ota_data: Option<CharacteristicInfo>,
    ota_device_id: Option<CharacteristicInfo>,
    firmware_revision: Option<CharacteristicInfo>,
}

impl Handles {
    fn resolve(services: &[DiscoveredService]) -> Handles {
        let mut handles = Handles::default();
        for service in services {
            for characteristic in &service.characteristics {
                let slot = match (service.uuid, characteristic.uuid) {
                    (bgx_uuids::STREAM_SERVICE, bgx_uuids::RX) => &mut handles.rx,
                    (bgx_uuids::STREAM_SERVICE, bgx_uuids::TX) => &mut handles.tx,
                    (bgx_uuids::STREAM_SERVICE, bgx_uuids::MODE) => &mut handles.mode,
                    (bgx_uuids::OTA_SERVICE, bgx_uuids::OTA_CONTROL) => &mut handles.ota_control,
                    (bgx_uuids::OTA_SERVICE, bgx_uuids::OTA_DATA) => &mut handles.ota_data,
                    (bgx_uuids::OTA_SERVICE, bgx_uuids::OTA_DEVICE_ID) => &mut handles.ota_device_id,
                    (bgx_uuids::DEVICE_INFO_SERVICE, bgx_uuids::FIRMWARE_REVISION) => &mut handles.firmware_revision,
                    _ => continue,
                };
                *slot = Some(characteristic.clone());
            }
        }
        handles
    }

    /// The streaming and OTA services are both mandatory.
    fn has_required(&self) -> bool {
        self.rx.is_some()
            && self.tx.is_some()
            && self.mode.is_some()
            && self.ota_control.is_some()
            && self.ota_data.is_some()
    }
}

/// Serial bytes accepted from the host but not yet acknowledged. At most one
/// chunk is in flight.
#[derive(Debug, Default)]
struct Outbound {
    data: Vec<u8>,
    cursor: usize,
    in_flight: usize,
}

impl Outbound {
    fn append(&mut self, bytes: Vec<u8>) {
        if self.data.is_empty() {
            self.data = bytes;
            self.cursor = 0;
        } else {
            self.data.extend_from_slice(&bytes);
        }
    }

    /// Bytes not yet handed to the transport
    fn remaining(&self) -> usize {
        self.data.len() - self.cursor - self.in_flight
    }

    /// Bytes not yet acknowledged
    fn len(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn take_chunk(&mut self, len: usize) -> Vec<u8> {
        self.in_flight = len;
        self.data[self.cursor..self.cursor + len].to_vec()
    }

    fn ack(&mut self) {
        self.cursor += self.in_flight;
        self.in_flight = 0;
        if self.cursor >= self.data.len() {
            self.clear();
        }
    }

    fn nack(&mut self) -> usize {
        std::mem::take(&mut self.in_flight)
    }

    fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.in_flight = 0;
    }
}

#[derive(Debug)]
pub struct DeviceSession {
    address: String,
    name: Option<String>,
    config: SessionConfig,
    state: ConnectionState,
    bonded: bool,
    cancel_requested: bool,
    bond_observed: Option<BondState>,
    bond_polls: u32,
    discovery_deferred: bool,
    handles: Handles,
    queue: OperationQueue<Operation>,
    ota: OtaEngine,
    flow: Option<FlowControl>,
    outbound: Outbound,
    write_chunk: usize,
    mtu: Option<u16>,
    acknowledged_writes: bool,
    acknowledged_reads: bool,
    firmware: Option<FirmwareRevision>,
    timers: HashMap<TimerKind, u64>,
    next_timer_id: u64,
}

impl DeviceSession {
    pub fn new(address: impl Into<String>, name: Option<String>, config: SessionConfig) -> Self {
        let write_chunk = config.default_write_chunk;
        DeviceSession {
            address: address.into(),
            name,
            config,
            state: ConnectionState::Disconnected,
            bonded: false,
            cancel_requested: false,
            bond_observed: None,
            bond_polls: 0,
            discovery_deferred: false,
            handles: Handles::default(),
            queue: OperationQueue::new(),
            ota: OtaEngine::new(),
            flow: None,
            outbound: Outbound::default(),
            write_chunk,
            mtu: None,
            acknowledged_writes: true,
            acknowledged_reads: false,
            firmware: None,
            timers: HashMap::new(),
            next_timer_id: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_bonded(&self) -> bool {
        self.bonded
    }

    pub fn ota_state(&self) -> OtaState {
        self.ota.state()
    }

    pub fn flow_control(&self) -> Option<&FlowControl> {
        self.flow.as_ref()
    }

    pub fn write_chunk_size(&self) -> usize {
        self.write_chunk
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn firmware_revision(&self) -> Option<&FirmwareRevision> {
        self.firmware.as_ref()
    }

    pub fn acknowledged_writes(&self) -> bool {
        self.acknowledged_writes
    }

    pub fn acknowledged_reads(&self) -> bool {
        self.acknowledged_reads
    }

    /// Serial bytes accepted but not yet acknowledged by the device
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn handle_command(&mut self, command: Command) -> Result<Vec<Effect>, Error> {
        let mut fx = Vec::new();
        match command {
            Command::Connect => self.connect(&mut fx)?,
            Command::Disconnect => self.disconnect(&mut fx),
            Command::CancelConnect => self.cancel_connect(&mut fx),
            Command::CancelOta => self.cancel_ota(&mut fx),
            Command::ReadBusMode => self.submit(OpKind::ReadBusMode)?,
            Command::WriteBusMode { mode, password } => self.submit(OpKind::WriteBusMode { mode, password })?,
            Command::WriteSerial(data) => {
                if !data.is_empty() {
                    self.submit(OpKind::WriteSerial(data))?;
                }
            }
            Command::GetDeviceInfo => self.submit(OpKind::GetDeviceInfo)?,
            Command::SetAcknowledgedWrites(enabled) => self.submit(OpKind::SetAcknowledgedWrites(enabled))?,
            Command::SetAcknowledgedReads(enabled) => self.submit(OpKind::SetAcknowledgedReads(enabled))?,
            Command::RequestMtu(mtu) => {
                if mtu < crate::MIN_MTU {
                    return Err(Error::InvalidMtu(mtu));
                }
                self.submit(OpKind::RequestMtu(mtu))?;
            }
            Command::StartOta {
                image,
                password,
                write_type,
            } => {
                self.require_connected()?;
                let queued = self.queue.any_pending(Operation::is_ota) || self.queue.current().map_or(false, Operation::is_ota);
                if self.ota.in_progress() || queued {
                    return Err(Error::OtaInProgress(self.address.clone()));
                }
                self.submit(OpKind::StartOta {
                    image: Some(image),
                    password,
                    write_type,
                })?;
            }
        }
        self.pump(&mut fx);
        Ok(fx)
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            Input::Gatt { request, result } => self.on_gatt(request, result, &mut fx),
            Input::Link(event) => self.on_link_event(event, &mut fx),
            Input::Timer(timer) => self.on_timer(timer, &mut fx),
        }
        self.pump(&mut fx);
        fx
    }

    fn require_connected(&self) -> Result<(), Error> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::NotConnected(self.address.clone()))
        }
    }

    fn submit(&mut self, kind: OpKind) -> Result<(), Error> {
        self.require_connected()?;
        self.queue.enqueue(Operation::new(kind));
        Ok(())
    }

    fn emit(&self, fx: &mut Vec<Effect>, event: BgxEvent) {
        fx.push(Effect::Emit(event));
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration, fx: &mut Vec<Effect>) {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(kind, id);
        fx.push(Effect::Schedule {
            timer: Timer { kind, id },
            delay,
        });
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.timers.remove(&kind);
    }

    fn set_state(&mut self, state: ConnectionState, status: Option<GattStatus>, fx: &mut Vec<Effect>) {
        let previous = std::mem::replace(&mut self.state, state);
        debug!(address = %self.address, ?previous, ?state, "connection state changed");
        let progress = matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Bonding | ConnectionState::Interrogating | ConnectionState::Connected
        );
        if progress && self.cancel_requested {
            return;
        }
        self.emit(
            fx,
            BgxEvent::ConnectionStateChanged {
                address: self.address.clone(),
                state,
                bonded: self.bonded,
                status,
            },
        );
    }

    fn connection_error(&self, kind: ConnectionErrorKind, status: GattStatus, fx: &mut Vec<Effect>) {
        self.emit(
            fx,
            BgxEvent::ConnectionError {
                address: self.address.clone(),
                kind,
                status,
            },
        );
    }

    // connection lifecycle

    fn connect(&mut self, fx: &mut Vec<Effect>) -> Result<(), Error> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::AlreadyConnected(self.address.clone()));
        }
        info!(address = %self.address, "connecting");
        self.cancel_requested = false;
        self.set_state(ConnectionState::Connecting, None, fx);
        fx.push(Effect::Gatt(GattRequest::Connect));
        Ok(())
    }

    fn disconnect(&mut self, fx: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                debug!(address = %self.address, "already disconnecting")
            }
            _ => self.begin_disconnect(fx),
        }
    }

    fn cancel_connect(&mut self, fx: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Bonding | ConnectionState::Interrogating => {
                info!(address = %self.address, state = ?self.state, "connection attempt canceled");
                self.cancel_requested = true;
                self.begin_disconnect(fx);
            }
            state => debug!(address = %self.address, ?state, "no connection attempt to cancel"),
        }
    }

    fn begin_disconnect(&mut self, fx: &mut Vec<Effect>) {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Disconnecting) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting, None, fx);
        fx.push(Effect::Gatt(GattRequest::Disconnect));
    }

    /// Return to `Disconnected`, dropping everything tied to the link.
    fn teardown(&mut self, status: GattStatus, fx: &mut Vec<Effect>) {
        if self.ota.reset() {
            warn!(address = %self.address, "link lost during OTA");
            self.emit(
                fx,
                BgxEvent::OtaStatus {
                    address: self.address.clone(),
                    status: OtaStatus::Failed,
                    failed: true,
                },
            );
        }
        self.queue.clear();
        self.timers.clear();
        self.handles = Handles::default();
        self.flow = None;
        self.outbound.clear();
        self.write_chunk = self.config.default_write_chunk;
        self.mtu = None;
        self.bond_observed = None;
        self.bond_polls = 0;
        self.discovery_deferred = false;
        self.bonded = false;
        self.firmware = None;
        self.set_state(ConnectionState::Disconnected, Some(status), fx);
    }

    fn on_connect_result(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        match (self.state, result) {
            (ConnectionState::Connecting, Ok(_)) => {
                info!(address = %self.address, "link established");
                self.set_state(ConnectionState::Bonding, None, fx);
                fx.push(Effect::Gatt(GattRequest::BondState));
            }
            (ConnectionState::Connecting, Err(e)) => {
                warn!(address = %self.address, "connect failed: {}", e);
                let (kind, status) = match e {
                    TransportError::Refused(_) => (ConnectionErrorKind::DeviceNotFound, GattStatus::DEVICE_NOT_FOUND),
                    other => (ConnectionErrorKind::Gatt, other.status()),
                };
                self.connection_error(kind, status, fx);
                self.teardown(status, fx);
            }
            (_, Ok(_)) if self.cancel_requested => {
                // the connect raced the cancel
                fx.push(Effect::Gatt(GattRequest::Disconnect));
            }
            (ConnectionState::Disconnected | ConnectionState::Disconnecting, Ok(_)) => {
                debug!(address = %self.address, "link came up after disconnect, closing it");
                fx.push(Effect::Gatt(GattRequest::Disconnect));
            }
            _ => {}
        }
    }

    fn on_disconnect_result(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        if let Err(e) = result {
            warn!(address = %self.address, "disconnect failed: {}", e);
        }
        if self.state != ConnectionState::Disconnected {
            self.teardown(GattStatus::SUCCESS, fx);
        }
    }

    fn on_link_lost(&mut self, status: GattStatus, fx: &mut Vec<Effect>) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if !status.is_success() && self.state != ConnectionState::Disconnecting {
            error!(address = %self.address, %status, "link lost");
            self.connection_error(ConnectionErrorKind::Gatt, status, fx);
        } else {
            info!(address = %self.address, %status, "disconnected");
        }
        self.teardown(status, fx);
    }

    // bonding

    fn on_bond_state_result(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        let polling = matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::PollBondState));
        if polling {
            self.finish_current();
            if std::mem::take(&mut self.discovery_deferred) {
                // bonded while the poll was in flight
                if self.state == ConnectionState::Interrogating && !self.cancel_requested {
                    fx.push(Effect::Gatt(GattRequest::DiscoverServices));
                }
                return;
            }
        }
        if self.state != ConnectionState::Bonding || self.cancel_requested {
            return;
        }
        let bond = match result {
            Ok(GattResponse::Bond(bond)) => Some(bond),
            Ok(other) => {
                warn!(address = %self.address, ?other, "unexpected bond state response");
                None
            }
            Err(e) => {
                warn!(address = %self.address, "bond state query failed: {}", e);
                None
            }
        };

        if polling {
            self.on_bond_polled(bond, fx);
            return;
        }
        match bond {
            Some(BondState::Bonded) => self.bonded_and_ready(false, fx),
            Some(BondState::Bonding) => {
                debug!(address = %self.address, "bonding already in progress");
                self.bond_observed = Some(BondState::Bonding);
                self.schedule_bond_poll(fx);
            }
            Some(BondState::None) => {
                info!(address = %self.address, "not bonded, requesting bond");
                fx.push(Effect::Gatt(GattRequest::CreateBond));
            }
            None => {
                self.queue.enqueue(Operation::new(OpKind::PollBondState));
            }
        }
    }

    fn on_create_bond_result(&mut self, result: Result<GattResponse, TransportError>) {
        if self.state != ConnectionState::Bonding || self.cancel_requested {
            return;
        }
        match result {
            Ok(_) => debug!(address = %self.address, "bond requested, waiting for pairing"),
            Err(e) => {
                warn!(address = %self.address, "bond request failed ({}), polling bond state", e);
                self.queue.enqueue(Operation::new(OpKind::PollBondState));
            }
        }
    }

    fn on_bond_polled(&mut self, bond: Option<BondState>, fx: &mut Vec<Effect>) {
        match bond {
            Some(BondState::Bonded) => self.bonded_and_ready(true, fx),
            Some(BondState::None) if self.bond_observed == Some(BondState::Bonding) => self.bond_failed(fx),
            other => {
                if let Some(bond) = other {
                    self.bond_observed = Some(bond);
                }
                self.schedule_bond_poll(fx);
            }
        }
    }

    fn on_bond_changed(&mut self, bond: BondState, fx: &mut Vec<Effect>) {
        if self.state != ConnectionState::Bonding || self.cancel_requested {
            return;
        }
        let previous = self.bond_observed.replace(bond);
        debug!(address = %self.address, ?previous, ?bond, "bond state changed");
        match bond {
            BondState::Bonded => self.bonded_and_ready(true, fx),
            BondState::None if previous == Some(BondState::Bonding) => self.bond_failed(fx),
            _ => {}
        }
    }

    fn schedule_bond_poll(&mut self, fx: &mut Vec<Effect>) {
        self.bond_polls += 1;
        if let Some(max) = self.config.bond_poll_max_attempts {
            if self.bond_polls > max {
                error!(address = %self.address, attempts = max, "gave up waiting for bond");
                self.connection_error(ConnectionErrorKind::BondTimeout, GattStatus::INSUFFICIENT_AUTHENTICATION, fx);
                self.begin_disconnect(fx);
                return;
            }
        }
        self.schedule(TimerKind::BondPoll, self.config.bond_poll_interval(), fx);
    }

    fn bond_failed(&mut self, fx: &mut Vec<Effect>) {
        error!(address = %self.address, "bonding failed");
        self.connection_error(ConnectionErrorKind::BondingFailed, GattStatus::INSUFFICIENT_AUTHENTICATION, fx);
        self.begin_disconnect(fx);
    }

    fn bonded_and_ready(&mut self, after_pairing: bool, fx: &mut Vec<Effect>) {
        info!(address = %self.address, "bonded");
        self.bonded = true;
        self.disarm(TimerKind::BondPoll);
        self.set_state(ConnectionState::Interrogating, None, fx);
        let settle = self.config.discovery_settle();
        if after_pairing && !settle.is_zero() {
            self.schedule(TimerKind::DiscoverySettle, settle, fx);
        } else {
            self.discover_services(fx);
        }
    }

    /// Discovery waits for an in-flight bond poll to complete.
    fn discover_services(&mut self, fx: &mut Vec<Effect>) {
        if matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::PollBondState)) {
            debug!(address = %self.address, "deferring discovery until bond poll completes");
            self.discovery_deferred = true;
        } else {
            fx.push(Effect::Gatt(GattRequest::DiscoverServices));
        }
    }

    // interrogation

    fn on_services_result(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        if self.state != ConnectionState::Interrogating || self.cancel_requested {
            return;
        }
        let services = match result {
            Ok(GattResponse::Services(services)) => services,
            Ok(other) => {
                error!(address = %self.address, ?other, "unexpected discovery response");
                self.connection_error(ConnectionErrorKind::Gatt, GattStatus::FAILURE, fx);
                self.begin_disconnect(fx);
                return;
            }
            Err(e) => {
                error!(address = %self.address, "service discovery failed: {}", e);
                self.connection_error(ConnectionErrorKind::Gatt, e.status(), fx);
                self.begin_disconnect(fx);
                return;
            }
        };

        self.handles = Handles::resolve(&services);
        if !self.handles.has_required() {
            error!(address = %self.address, services = services.len(), "BGX services missing");
            self.connection_error(ConnectionErrorKind::ServicesMissing, GattStatus::FAILURE, fx);
            self.begin_disconnect(fx);
            return;
        }
        debug!(address = %self.address, services = services.len(), "services discovered");

        let mut setup = vec![OpKind::EnableModeNotification, OpKind::EnableTxNotification];
        if self.config.prefer_2m_phy {
            setup.push(OpKind::SetPreferredPhy);
        }
        setup.push(OpKind::SetupFastAck);
        if self.handles.firmware_revision.is_some() {
            setup.push(OpKind::ReadFirmwareRevision);
        }
        setup.push(OpKind::AnnounceConnected);
        for kind in setup {
            self.queue.enqueue(Operation::new(kind));
        }
    }

    fn announce_connected(&mut self, fx: &mut Vec<Effect>) {
        if self.queue.any_pending(Operation::is_setup) {
            // setup requeued after a refusal still has to run
            self.queue.requeue_current();
            return;
        }
        self.finish_current();
        if self.cancel_requested {
            return;
        }
        info!(address = %self.address, write_chunk = self.write_chunk, fastack = self.flow.is_some(), "connected");
        self.set_state(ConnectionState::Connected, None, fx);
    }

    fn on_firmware_revision(&mut self, value: &[u8], fx: &mut Vec<Effect>) {
        let raw = String::from_utf8_lossy(value);
        match FirmwareRevision::parse(&raw, &self.config.revision_rules) {
            Ok(revision) => {
                info!(address = %self.address, platform = %revision.platform, revision = %revision.revision, "firmware");
                self.emit(
                    fx,
                    BgxEvent::FirmwareRevision {
                        address: self.address.clone(),
                        platform: revision.platform.clone(),
                        revision: revision.revision.clone(),
                        bootloader_version: revision.bootloader_version,
                    },
                );
                self.firmware = Some(revision);
                if self.mtu.is_none() {
                    self.schedule(TimerKind::MtuRequest, self.config.mtu_request_delay(), fx);
                }
            }
            Err(e) => {
                error!(address = %self.address, "{}; GATT handles are probably stale, re-pair the device", e);
                self.emit(
                    fx,
                    BgxEvent::InvalidGattHandles {
                        address: self.address.clone(),
                        name: self.name.clone(),
                    },
                );
            }
        }
    }

    // queue dispatch

    fn pump(&mut self, fx: &mut Vec<Effect>) {
        while !self.queue.is_busy() && self.queue.start_next().is_some() {
            self.dispatch(fx);
        }
    }

    fn finish_current(&mut self) {
        if let Some(op) = self.queue.complete_current() {
            trace!(address = %self.address, op = op.name(), "operation complete");
        }
    }

    fn dispatch(&mut self, fx: &mut Vec<Effect>) {
        let Some(op) = self.queue.current_mut() else {
            return;
        };
        trace!(address = %self.address, op = op.name(), retries = op.retries, "dispatching");
        match &mut op.kind {
            OpKind::EnableModeNotification => write_cccd(bgx_uuids::MODE, &ENABLE_NOTIFICATION_VALUE, fx),
            OpKind::EnableTxNotification => write_cccd(bgx_uuids::TX, &ENABLE_NOTIFICATION_VALUE, fx),
            OpKind::SetPreferredPhy => {
                fx.push(Effect::Gatt(GattRequest::SetPreferredPhy));
                self.schedule(TimerKind::PhyTimeout, self.config.phy_timeout(), fx);
            }
            OpKind::SetupFastAck => {
                if self.handles.rx.as_ref().map_or(false, |rx| rx.notify) {
                    write_cccd(bgx_uuids::RX, &ENABLE_NOTIFICATION_VALUE, fx);
                } else {
                    info!(address = %self.address, "fastack not supported by device");
                    self.flow = None;
                    self.finish_current();
                }
            }
            OpKind::ReadFirmwareRevision => read(bgx_uuids::FIRMWARE_REVISION, fx),
            OpKind::AnnounceConnected => self.announce_connected(fx),
            OpKind::PollBondState => fx.push(Effect::Gatt(GattRequest::BondState)),
            OpKind::RequestMtu(mtu) => fx.push(Effect::Gatt(GattRequest::RequestMtu(*mtu))),
            OpKind::ReturnRxCredit(msg) => {
                let value = msg.encode().to_vec();
                write(bgx_uuids::TX, value, WriteType::WithResponse, fx);
            }
            OpKind::ReadBusMode => read(bgx_uuids::MODE, fx),
            OpKind::WriteBusMode { mode, password } => {
                let value = mode.write_payload(password.as_deref());
                write(bgx_uuids::MODE, value, WriteType::WithResponse, fx);
            }
            OpKind::WriteSerial(data) => {
                let data = std::mem::take(data);
                self.outbound.append(data);
                self.write_next_chunk(fx);
            }
            OpKind::GetDeviceInfo => {
                if self.handles.ota_device_id.is_some() {
                    read(bgx_uuids::OTA_DEVICE_ID, fx);
                } else {
                    warn!(address = %self.address, "device has no device id characteristic");
                    self.finish_current();
                }
            }
            OpKind::SetAcknowledgedWrites(enabled) => {
                self.acknowledged_writes = *enabled;
                self.finish_current();
            }
            OpKind::SetAcknowledgedReads(enabled) => {
                let enabled = *enabled;
                self.acknowledged_reads = enabled;
                // indications only make sense without fastack
                let value = if enabled && self.flow.is_none() {
                    ENABLE_INDICATION_VALUE
                } else {
                    ENABLE_NOTIFICATION_VALUE
                };
                write_cccd(bgx_uuids::TX, &value, fx);
            }
            OpKind::StartOta {
                image,
                password,
                write_type,
            } => {
                let image = image.take();
                let password = password.take();
                let write_type = *write_type;
                match image {
                    Some(image) => {
                        self.queue.hold();
                        self.emit(
                            fx,
                            BgxEvent::OtaStatus {
                                address: self.address.clone(),
                                status: OtaStatus::Installing,
                                failed: false,
                            },
                        );
                        let steps = self.ota.start(image, password.as_deref(), write_type);
                        self.run_ota(steps, fx);
                    }
                    None => self.finish_current(),
                }
            }
        }
    }

    /// Put the current operation back at the tail, or drop it once it has
    /// been refused too often.
    fn retry_current(&mut self, status: GattStatus, fx: &mut Vec<Effect>) {
        let max = self.config.max_dispatch_retries;
        let Some(op) = self.queue.current_mut() else {
            return;
        };
        op.retries += 1;
        if op.retries <= max {
            debug!(address = %self.address, op = op.name(), retries = op.retries, "requeueing operation");
            self.queue.requeue_current();
            return;
        }
        let operation = op.name();
        let serial = matches!(op.kind, OpKind::WriteSerial(_));
        error!(address = %self.address, op = operation, %status, "operation failed, giving up");
        self.queue.complete_current();
        if serial {
            self.outbound.clear();
        }
        self.emit(
            fx,
            BgxEvent::OperationFailed {
                address: self.address.clone(),
                operation,
                status,
            },
        );
    }

    // serial

    fn serial_write_type(&self) -> WriteType {
        let unacknowledged = self.flow.is_some() || !self.acknowledged_writes;
        let supported = self.handles.rx.as_ref().map_or(true, |rx| rx.write_without_response);
        if unacknowledged && supported {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }

    fn write_next_chunk(&mut self, fx: &mut Vec<Effect>) {
        if self.outbound.in_flight > 0 {
            return;
        }
        let remaining = self.outbound.remaining();
        if remaining == 0 {
            self.outbound.clear();
            self.finish_current();
            return;
        }
        let mut len = remaining.min(self.write_chunk);
        if let Some(flow) = self.flow.as_mut() {
            len = flow.chunk_len(len);
            if len == 0 {
                debug!(address = %self.address, pending = remaining, "out of transmit credit");
                return;
            }
            flow.consume(len);
        }
        let value = self.outbound.take_chunk(len);
        write(bgx_uuids::RX, value, self.serial_write_type(), fx);
    }

    fn serial_waiting(&self) -> bool {
        matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::WriteSerial(_)))
            && self.outbound.in_flight == 0
            && self.outbound.remaining() > 0
    }

    fn resume_serial(&mut self, fx: &mut Vec<Effect>) {
        if self.serial_waiting() {
            self.write_next_chunk(fx);
        }
    }

    fn on_serial_written(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        match result {
            Ok(_) => {
                self.outbound.ack();
                self.write_next_chunk(fx);
            }
            Err(e) => {
                let len = self.outbound.nack();
                if let Some(flow) = self.flow.as_mut() {
                    flow.refund(len);
                }
                warn!(address = %self.address, chunk = len, "serial write failed: {}", e);
                self.retry_current(e.status(), fx);
            }
        }
    }

    fn on_serial_data(&mut self, value: Vec<u8>, fx: &mut Vec<Effect>) {
        if let Some(flow) = self.flow.as_mut() {
            if let Some(grant) = flow.data_received(value.len()) {
                self.queue.enqueue(Operation::new(OpKind::ReturnRxCredit(grant)));
            }
        }
        self.emit(
            fx,
            BgxEvent::DataReceived {
                address: self.address.clone(),
                data: value,
            },
        );
    }

    fn on_backchannel(&mut self, value: &[u8], fx: &mut Vec<Effect>) {
        let Some(flow) = self.flow.as_mut() else {
            trace!(address = %self.address, "RX notification without fastack");
            return;
        };
        match CreditMessage::decode(value) {
            Ok(msg) => {
                let wake = flow.backchannel(msg);
                let has_credit = !flow.is_stalled();
                if wake || (has_credit && self.serial_waiting()) {
                    self.schedule(TimerKind::FastAckWake, self.config.fastack_wake_delay(), fx);
                }
            }
            Err(e) => {
                warn!(address = %self.address, "bad fastack message ({}), disabling flow control", e);
                self.flow = None;
                self.resume_serial(fx);
            }
        }
    }

    fn on_credit_written(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        let (initial, msg) = match self.queue.current().map(|op| &op.kind) {
            Some(OpKind::SetupFastAck) => (true, self.flow.as_ref().map(FlowControl::initial_grant)),
            Some(OpKind::ReturnRxCredit(msg)) => (false, Some(*msg)),
            _ => (false, None),
        };
        match result {
            Ok(_) => {
                if let (Some(flow), Some(msg)) = (self.flow.as_mut(), msg) {
                    flow.grant_sent(msg);
                }
                self.finish_current();
            }
            Err(e) if initial => {
                warn!(address = %self.address, "initial fastack grant failed ({}), disabling flow control", e);
                self.flow = None;
                self.finish_current();
            }
            Err(e) => self.retry_current(e.status(), fx),
        }
    }

    // characteristic completions

    fn on_gatt(&mut self, request: GattRequest, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        match request {
            GattRequest::Connect => self.on_connect_result(result, fx),
            GattRequest::Disconnect => self.on_disconnect_result(result, fx),
            _ if self.state == ConnectionState::Disconnected => {
                trace!(address = %self.address, ?request, "completion after disconnect");
            }
            GattRequest::BondState => self.on_bond_state_result(result, fx),
            GattRequest::CreateBond => self.on_create_bond_result(result),
            GattRequest::DiscoverServices => self.on_services_result(result, fx),
            GattRequest::Read { characteristic } => self.on_read(characteristic, result, fx),
            GattRequest::Write { characteristic, .. } => self.on_write(characteristic, result, fx),
            GattRequest::WriteDescriptor { characteristic, .. } => self.on_descriptor_written(characteristic, result, fx),
            GattRequest::SetNotification { characteristic, .. } => self.on_notification_set(characteristic, result, fx),
            GattRequest::RequestMtu(_) => self.on_mtu(result, fx),
            GattRequest::SetPreferredPhy => self.on_phy(result),
        }
    }

    fn on_read(&mut self, characteristic: Uuid, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        let value = match result {
            Ok(GattResponse::Value(value)) => value,
            Ok(other) => {
                warn!(address = %self.address, %characteristic, ?other, "unexpected read response");
                self.finish_current();
                return;
            }
            Err(e) => {
                warn!(address = %self.address, %characteristic, "read failed: {}", e);
                self.retry_current(e.status(), fx);
                return;
            }
        };

        match characteristic {
            bgx_uuids::MODE => {
                let mode = BusMode::from_value(&value);
                debug!(address = %self.address, ?mode, "bus mode read");
                self.emit(
                    fx,
                    BgxEvent::BusModeChanged {
                        address: self.address.clone(),
                        mode,
                    },
                );
            }
            bgx_uuids::FIRMWARE_REVISION => self.on_firmware_revision(&value, fx),
            bgx_uuids::OTA_DEVICE_ID => {
                let identity = DeviceIdentity::from_value(&value);
                self.emit(
                    fx,
                    BgxEvent::DeviceInfo {
                        address: self.address.clone(),
                        device_uuid: identity.device_uuid,
                        part_identifier: identity.part_identifier,
                        part_id: identity.part_id,
                        platform: self.firmware.as_ref().map(|f| f.platform.clone()),
                    },
                );
            }
            other => debug!(address = %self.address, characteristic = %other, "unexpected read completion"),
        }
        self.finish_current();
    }

    fn on_write(&mut self, characteristic: Uuid, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        match characteristic {
            bgx_uuids::RX => self.on_serial_written(result, fx),
            bgx_uuids::TX => self.on_credit_written(result, fx),
            bgx_uuids::MODE => match result {
                Ok(_) => self.finish_current(),
                Err(TransportError::Refused(_)) => self.retry_current(GattStatus::FAILURE, fx),
                Err(e) => {
                    warn!(address = %self.address, "bus mode write failed: {}", e);
                    self.emit(
                        fx,
                        BgxEvent::BusModePasswordRequired {
                            address: self.address.clone(),
                        },
                    );
                    self.finish_current();
                }
            },
            bgx_uuids::OTA_CONTROL | bgx_uuids::OTA_DATA => self.on_ota_written(characteristic, result, fx),
            other => debug!(address = %self.address, characteristic = %other, "unexpected write completion"),
        }
    }

    fn on_descriptor_written(
        &mut self,
        characteristic: Uuid,
        result: Result<GattResponse, TransportError>,
        fx: &mut Vec<Effect>,
    ) {
        let fastack = matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::SetupFastAck));
        match result {
            Ok(_) => fx.push(Effect::Gatt(GattRequest::SetNotification {
                characteristic,
                enabled: true,
            })),
            Err(TransportError::Refused(_)) => self.retry_current(GattStatus::FAILURE, fx),
            Err(e) if fastack => {
                info!(address = %self.address, "fastack unavailable ({})", e);
                self.flow = None;
                self.finish_current();
            }
            Err(e) => {
                warn!(address = %self.address, %characteristic, "descriptor write failed: {}", e);
                if self.state == ConnectionState::Interrogating {
                    self.connection_error(ConnectionErrorKind::Setup, e.status(), fx);
                }
                self.finish_current();
            }
        }
    }

    fn on_notification_set(
        &mut self,
        characteristic: Uuid,
        result: Result<GattResponse, TransportError>,
        fx: &mut Vec<Effect>,
    ) {
        let fastack = matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::SetupFastAck));
        match result {
            Ok(_) if fastack => {
                let flow = FlowControl::new();
                let grant = flow.initial_grant();
                self.flow = Some(flow);
                info!(address = %self.address, "fastack enabled");
                write(bgx_uuids::TX, grant.encode().to_vec(), WriteType::WithResponse, fx);
            }
            Ok(_) => {
                trace!(address = %self.address, %characteristic, "notifications enabled");
                self.finish_current();
            }
            Err(TransportError::Refused(_)) => self.retry_current(GattStatus::FAILURE, fx),
            Err(e) => {
                warn!(address = %self.address, %characteristic, "subscribe failed: {}", e);
                if fastack {
                    self.flow = None;
                }
                self.finish_current();
            }
        }
    }

    fn on_mtu(&mut self, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        let status = match result {
            Ok(GattResponse::Mtu(mtu)) => {
                let mtu = mtu.max(crate::MIN_MTU);
                self.mtu = Some(mtu);
                self.write_chunk = usize::from(mtu - 3);
                info!(address = %self.address, mtu, write_chunk = self.write_chunk, "MTU negotiated");
                GattStatus::SUCCESS
            }
            Ok(other) => {
                warn!(address = %self.address, ?other, "unexpected MTU response");
                GattStatus::FAILURE
            }
            Err(TransportError::Refused(_)) => {
                self.retry_current(GattStatus::FAILURE, fx);
                return;
            }
            Err(e) => {
                warn!(address = %self.address, "MTU request failed: {}", e);
                e.status()
            }
        };
        self.emit(
            fx,
            BgxEvent::MtuChanged {
                address: self.address.clone(),
                mtu: self.mtu.unwrap_or(crate::MIN_MTU),
                status,
            },
        );
        self.finish_current();
    }

    fn on_phy(&mut self, result: Result<GattResponse, TransportError>) {
        if !matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::SetPreferredPhy)) {
            trace!(address = %self.address, "PHY update after timeout");
            return;
        }
        match result {
            Ok(_) => debug!(address = %self.address, "2M PHY requested"),
            Err(e) => debug!(address = %self.address, "PHY not changed: {}", e),
        }
        self.disarm(TimerKind::PhyTimeout);
        self.finish_current();
    }

    // OTA

    fn cancel_ota(&mut self, fx: &mut Vec<Effect>) {
        if self.ota.in_progress() {
            info!(address = %self.address, "OTA cancel requested");
            self.ota.cancel();
        } else if self.queue.remove_pending(Operation::is_ota).is_some() {
            info!(address = %self.address, "queued OTA canceled");
            self.emit(
                fx,
                BgxEvent::OtaStatus {
                    address: self.address.clone(),
                    status: OtaStatus::UserCanceled,
                    failed: false,
                },
            );
        }
    }

    fn on_ota_written(&mut self, characteristic: Uuid, result: Result<GattResponse, TransportError>, fx: &mut Vec<Effect>) {
        if !self.ota.in_progress() {
            debug!(address = %self.address, "OTA write completion with no update running");
            return;
        }
        let steps = match result {
            Err(TransportError::Refused(reason)) => {
                error!(address = %self.address, "OTA write refused: {}", reason);
                self.ota.on_refused()
            }
            other => {
                let status = match other {
                    Ok(_) => GattStatus::SUCCESS,
                    Err(e) => e.status(),
                };
                if characteristic == bgx_uuids::OTA_CONTROL {
                    self.ota.on_control_written(status)
                } else {
                    self.ota.on_data_written(status)
                }
            }
        };
        self.run_ota(steps, fx);
    }

    fn run_ota(&mut self, steps: Vec<OtaStep>, fx: &mut Vec<Effect>) {
        for step in steps {
            match step {
                OtaStep::WriteControl(value) => write(bgx_uuids::OTA_CONTROL, value, WriteType::WithResponse, fx),
                OtaStep::WriteData { value, write_type } => write(bgx_uuids::OTA_DATA, value, write_type, fx),
                OtaStep::Progress { bytes_sent } => self.emit(
                    fx,
                    BgxEvent::OtaProgress {
                        address: self.address.clone(),
                        bytes_sent,
                    },
                ),
                OtaStep::Status(status) => self.emit(
                    fx,
                    BgxEvent::OtaStatus {
                        address: self.address.clone(),
                        status,
                        failed: false,
                    },
                ),
                OtaStep::ScheduleFinish => self.schedule(TimerKind::OtaFinish, self.config.ota_finish_delay(), fx),
                OtaStep::Terminal(status) => {
                    info!(address = %self.address, ?status, "OTA ended");
                    self.disarm(TimerKind::OtaFinish);
                    self.queue.release();
                    self.emit(
                        fx,
                        BgxEvent::OtaStatus {
                            address: self.address.clone(),
                            status,
                            failed: status == OtaStatus::Failed,
                        },
                    );
                }
            }
        }
    }

    // unsolicited input

    fn on_link_event(&mut self, event: LinkEvent, fx: &mut Vec<Effect>) {
        match event {
            LinkEvent::Notification { characteristic, value } => {
                if !matches!(self.state, ConnectionState::Interrogating | ConnectionState::Connected) {
                    trace!(address = %self.address, %characteristic, "notification while not connected");
                    return;
                }
                match characteristic {
                    bgx_uuids::TX => self.on_serial_data(value, fx),
                    bgx_uuids::RX => self.on_backchannel(&value, fx),
                    bgx_uuids::MODE => {
                        let mode = BusMode::from_value(&value);
                        debug!(address = %self.address, ?mode, "bus mode changed");
                        self.emit(
                            fx,
                            BgxEvent::BusModeChanged {
                                address: self.address.clone(),
                                mode,
                            },
                        );
                    }
                    other => trace!(address = %self.address, characteristic = %other, "ignored notification"),
                }
            }
            LinkEvent::Disconnected { status } => self.on_link_lost(status, fx),
            LinkEvent::BondStateChanged(bond) => self.on_bond_changed(bond, fx),
        }
    }

    fn on_timer(&mut self, timer: Timer, fx: &mut Vec<Effect>) {
        if self.timers.get(&timer.kind) != Some(&timer.id) {
            trace!(address = %self.address, ?timer, "stale timer");
            return;
        }
        self.timers.remove(&timer.kind);

        match timer.kind {
            TimerKind::BondPoll => {
                if self.state == ConnectionState::Bonding && !self.cancel_requested {
                    self.queue.enqueue(Operation::new(OpKind::PollBondState));
                }
            }
            TimerKind::DiscoverySettle => {
                if self.state == ConnectionState::Interrogating && !self.cancel_requested {
                    self.discover_services(fx);
                }
            }
            TimerKind::PhyTimeout => {
                if matches!(self.queue.current().map(|op| &op.kind), Some(OpKind::SetPreferredPhy)) {
                    debug!(address = %self.address, "PHY update timed out");
                    self.finish_current();
                }
            }
            TimerKind::OtaFinish => {
                let steps = self.ota.finish_elapsed();
                self.run_ota(steps, fx);
            }
            TimerKind::FastAckWake => self.resume_serial(fx),
            TimerKind::MtuRequest => {
                let linked = matches!(self.state, ConnectionState::Interrogating | ConnectionState::Connected);
                if linked && self.mtu.is_none() {
                    self.queue.enqueue(Operation::new(OpKind::RequestMtu(self.config.requested_mtu)));
                }
            }
        }
    }
}

fn read(characteristic: Uuid, fx: &mut Vec<Effect>) {
    fx.push(Effect::Gatt(GattRequest::Read { characteristic }));
}

fn write(characteristic: Uuid, value: Vec<u8>, write_type: WriteType, fx: &mut Vec<Effect>) {
    fx.push(Effect::Gatt(GattRequest::Write {
        characteristic,
        value,
        write_type,
    }));
}

fn write_cccd(characteristic: Uuid, value: &[u8], fx: &mut Vec<Effect>) {
    fx.push(Effect::Gatt(GattRequest::WriteDescriptor {
        characteristic,
        descriptor: bgx_uuids::CCCD,
        value: value.to_vec(),
    }));
}

#[cfg(test)]
mod tests;
