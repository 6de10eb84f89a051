use super::*;
use crate::device_info::PartId;
use std::collections::VecDeque;

const ADDR: &str = "00:0B:57:1A:2B:3C";
const REVISION: &[u8] = b"BGX13P.1.2.2738.2-1524-2738";

fn characteristic(uuid: Uuid, f: impl FnOnce(&mut CharacteristicInfo)) -> CharacteristicInfo {
    let mut c = CharacteristicInfo::new(uuid);
    f(&mut c);
    c
}

fn bgx_services(fastack: bool) -> Vec<DiscoveredService> {
    vec![
        DiscoveredService {
            uuid: bgx_uuids::STREAM_SERVICE,
            characteristics: vec![
                characteristic(bgx_uuids::RX, |c| {
                    c.write = true;
                    c.write_without_response = true;
                    c.notify = fastack;
                }),
                characteristic(bgx_uuids::TX, |c| {
                    c.write = true;
                    c.notify = true;
                    c.indicate = true;
                }),
                characteristic(bgx_uuids::MODE, |c| {
                    c.read = true;
                    c.write = true;
                    c.notify = true;
                }),
            ],
        },
        DiscoveredService {
            uuid: bgx_uuids::OTA_SERVICE,
            characteristics: vec![
                characteristic(bgx_uuids::OTA_CONTROL, |c| c.write = true),
                characteristic(bgx_uuids::OTA_DATA, |c| {
                    c.write = true;
                    c.write_without_response = true;
                }),
                characteristic(bgx_uuids::OTA_DEVICE_ID, |c| c.read = true),
            ],
        },
        DiscoveredService {
            uuid: bgx_uuids::DEVICE_INFO_SERVICE,
            characteristics: vec![characteristic(bgx_uuids::FIRMWARE_REVISION, |c| c.read = true)],
        },
    ]
}

/// Plays the transport: keeps outstanding requests in FIFO order and
/// answers them on demand.
struct Harness {
    session: DeviceSession,
    log: Vec<Effect>,
    outstanding: VecDeque<GattRequest>,
    services: Vec<DiscoveredService>,
    firmware: Vec<u8>,
    max_in_flight: usize,
}

impl Harness {
    fn new(config: SessionConfig, fastack: bool) -> Self {
        Harness {
            session: DeviceSession::new(ADDR, Some("bgx-test".into()), config),
            log: Vec::new(),
            outstanding: VecDeque::new(),
            services: bgx_services(fastack),
            firmware: REVISION.to_vec(),
            max_in_flight: 0,
        }
    }

    /// Connected with every setup step succeeding; the log starts empty.
    fn connected(config: SessionConfig, fastack: bool) -> Self {
        let mut h = Harness::new(config, fastack);
        h.command(Command::Connect);
        h.settle();
        assert_eq!(h.session.state(), ConnectionState::Connected);
        h.log.clear();
        h
    }

    fn absorb(&mut self, fx: Vec<Effect>) {
        for effect in fx {
            if let Effect::Gatt(request) = &effect {
                self.outstanding.push_back(request.clone());
            }
            self.log.push(effect);
        }
        let in_flight = self
            .outstanding
            .iter()
            .filter(|r| !matches!(r, GattRequest::Disconnect))
            .count();
        self.max_in_flight = self.max_in_flight.max(in_flight);
    }

    fn command(&mut self, command: Command) {
        let fx = self.session.handle_command(command).unwrap();
        self.absorb(fx);
    }

    fn response_for(&self, request: &GattRequest) -> GattResponse {
        match request {
            GattRequest::DiscoverServices => GattResponse::Services(self.services.clone()),
            GattRequest::BondState => GattResponse::Bond(BondState::Bonded),
            GattRequest::Read { characteristic } => match *characteristic {
                bgx_uuids::FIRMWARE_REVISION => GattResponse::Value(self.firmware.clone()),
                bgx_uuids::MODE => GattResponse::Value(vec![1]),
                bgx_uuids::OTA_DEVICE_ID => GattResponse::Value(vec![0x4C, 0x89, 0x2A, 0x6A, 0x01, 0x02, 0x03, 0x04]),
                _ => GattResponse::Value(Vec::new()),
            },
            GattRequest::RequestMtu(mtu) => GattResponse::Mtu(*mtu),
            _ => GattResponse::Done,
        }
    }

    fn reply(&mut self, result: Result<GattResponse, TransportError>) -> GattRequest {
        let request = self.outstanding.pop_front().expect("no outstanding request");
        let fx = self.session.apply(Input::Gatt {
            request: request.clone(),
            result,
        });
        self.absorb(fx);
        request
    }

    fn reply_ok(&mut self) -> GattRequest {
        let response = self.response_for(self.outstanding.front().expect("no outstanding request"));
        self.reply(Ok(response))
    }

    fn settle(&mut self) {
        for _ in 0..10_000 {
            if self.outstanding.is_empty() {
                return;
            }
            self.reply_ok();
        }
        panic!("session never settled");
    }

    fn link(&mut self, event: LinkEvent) {
        let fx = self.session.apply(Input::Link(event));
        self.absorb(fx);
    }

    fn last_timer(&self, kind: TimerKind) -> Option<(Timer, Duration)> {
        self.log.iter().rev().find_map(|e| match e {
            Effect::Schedule { timer, delay } if timer.kind == kind => Some((*timer, *delay)),
            _ => None,
        })
    }

    fn fire(&mut self, kind: TimerKind) {
        let (timer, _) = self.last_timer(kind).expect("timer never scheduled");
        let fx = self.session.apply(Input::Timer(timer));
        self.absorb(fx);
    }

    fn requests(&self) -> Vec<GattRequest> {
        self.log
            .iter()
            .filter_map(|e| match e {
                Effect::Gatt(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(&self) -> Vec<BgxEvent> {
        self.log
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(&self) -> Vec<ConnectionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BgxEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    fn ota_statuses(&self) -> Vec<OtaStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BgxEvent::OtaStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn position(&self, pred: impl Fn(&Effect) -> bool) -> usize {
        self.log.iter().position(pred).expect("effect not found")
    }
}

fn serial_writes(requests: &[GattRequest]) -> Vec<(Vec<u8>, WriteType)> {
    requests
        .iter()
        .filter_map(|r| match r {
            GattRequest::Write {
                characteristic: bgx_uuids::RX,
                value,
                write_type,
            } => Some((value.clone(), *write_type)),
            _ => None,
        })
        .collect()
}

fn ota_data_lengths(requests: &[GattRequest]) -> Vec<usize> {
    requests
        .iter()
        .filter_map(|r| match r {
            GattRequest::Write {
                characteristic: bgx_uuids::OTA_DATA,
                value,
                ..
            } => Some(value.len()),
            _ => None,
        })
        .collect()
}

fn cccd(characteristic: Uuid, value: [u8; 2]) -> GattRequest {
    GattRequest::WriteDescriptor {
        characteristic,
        descriptor: bgx_uuids::CCCD,
        value: value.to_vec(),
    }
}

fn subscribe(characteristic: Uuid) -> GattRequest {
    GattRequest::SetNotification {
        characteristic,
        enabled: true,
    }
}

#[test]
fn connect_runs_setup_before_announcing_connected() {
    let mut h = Harness::new(SessionConfig::default(), true);
    h.command(Command::Connect);
    h.settle();

    assert_eq!(
        h.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Bonding,
            ConnectionState::Interrogating,
            ConnectionState::Connected
        ]
    );
    assert_eq!(
        h.requests(),
        vec![
            GattRequest::Connect,
            GattRequest::BondState,
            GattRequest::DiscoverServices,
            cccd(bgx_uuids::MODE, ENABLE_NOTIFICATION_VALUE),
            subscribe(bgx_uuids::MODE),
            cccd(bgx_uuids::TX, ENABLE_NOTIFICATION_VALUE),
            subscribe(bgx_uuids::TX),
            GattRequest::SetPreferredPhy,
            cccd(bgx_uuids::RX, ENABLE_NOTIFICATION_VALUE),
            subscribe(bgx_uuids::RX),
            GattRequest::Write {
                characteristic: bgx_uuids::TX,
                value: vec![0x00, 0xFF, 0x7F],
                write_type: WriteType::WithResponse,
            },
            GattRequest::Read {
                characteristic: bgx_uuids::FIRMWARE_REVISION
            },
        ]
    );

    let connected = h.position(|e| {
        matches!(
            e,
            Effect::Emit(BgxEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            })
        )
    });
    let last_setup = h.position(|e| {
        matches!(
            e,
            Effect::Gatt(GattRequest::Read {
                characteristic: bgx_uuids::FIRMWARE_REVISION
            })
        )
    });
    assert!(connected > last_setup);
    assert_eq!(h.max_in_flight, 1);
    assert!(h.session.is_bonded());
    assert_eq!(h.session.flow_control().map(FlowControl::rx_credit), Some(0x7FFF));
    assert_eq!(h.session.firmware_revision().map(|f| f.platform.as_str()), Some("bgx13"));
    assert!(h.events().contains(&BgxEvent::FirmwareRevision {
        address: ADDR.into(),
        platform: "bgx13".into(),
        revision: "1.2.2738.2".into(),
        bootloader_version: Some(1524),
    }));
    assert_eq!(h.last_timer(TimerKind::MtuRequest).map(|(_, d)| d), Some(Duration::from_secs(1)));
}

#[test]
fn commands_require_a_connection() {
    let mut session = DeviceSession::new(ADDR, None, SessionConfig::default());
    assert!(matches!(
        session.handle_command(Command::WriteSerial(b"hi".to_vec())),
        Err(Error::NotConnected(_))
    ));
    session.handle_command(Command::Connect).unwrap();
    assert!(matches!(session.handle_command(Command::Connect), Err(Error::AlreadyConnected(_))));
    assert!(matches!(session.handle_command(Command::ReadBusMode), Err(Error::NotConnected(_))));
}

#[test]
fn serial_data_is_chunked_and_cleared_when_acknowledged() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    let data: Vec<u8> = (0..50).collect();
    h.command(Command::WriteSerial(data.clone()));
    assert_eq!(h.session.pending_outbound(), 50);
    h.settle();

    let writes = serial_writes(&h.requests());
    let lengths: Vec<usize> = writes.iter().map(|(v, _)| v.len()).collect();
    assert_eq!(lengths, vec![20, 20, 10]);
    assert!(writes.iter().all(|(_, wt)| *wt == WriteType::WithResponse));
    let sent: Vec<u8> = writes.iter().flat_map(|(v, _)| v.iter().copied()).collect();
    assert_eq!(sent, data);
    assert_eq!(h.session.pending_outbound(), 0);
    assert!(h.session.is_idle());
}

#[test]
fn unacknowledged_writes_use_write_without_response() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::SetAcknowledgedWrites(false));
    h.command(Command::WriteSerial(b"hello".to_vec()));
    h.settle();
    assert_eq!(serial_writes(&h.requests()), vec![(b"hello".to_vec(), WriteType::WithoutResponse)]);
}

#[test]
fn acknowledged_reads_switch_tx_to_indications() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::SetAcknowledgedReads(true));
    h.settle();
    assert_eq!(
        h.requests(),
        vec![cccd(bgx_uuids::TX, ENABLE_INDICATION_VALUE), subscribe(bgx_uuids::TX)]
    );
    assert!(h.session.acknowledged_reads());
}

#[test]
fn mtu_request_follows_firmware_read_and_grows_chunks() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    let mut connect = Harness::new(SessionConfig::default(), false);
    connect.command(Command::Connect);
    connect.settle();
    connect.fire(TimerKind::MtuRequest);
    assert_eq!(connect.outstanding.front(), Some(&GattRequest::RequestMtu(247)));
    connect.settle();
    assert_eq!(connect.session.write_chunk_size(), 244);
    assert!(connect.events().contains(&BgxEvent::MtuChanged {
        address: ADDR.into(),
        mtu: 247,
        status: GattStatus::SUCCESS,
    }));

    assert!(matches!(
        h.session.handle_command(Command::RequestMtu(20)),
        Err(Error::InvalidMtu(20))
    ));
}

#[test]
fn unsupported_mtu_exchange_reports_failure() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::RequestMtu(185));
    h.reply(Err(TransportError::Unsupported("mtu")));
    assert_eq!(
        h.events(),
        vec![BgxEvent::MtuChanged {
            address: ADDR.into(),
            mtu: crate::MIN_MTU,
            status: GattStatus::FAILURE,
        }]
    );
    assert_eq!(h.session.write_chunk_size(), 20);
}

#[test]
fn fastack_stalls_until_credit_arrives() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.command(Command::WriteSerial(vec![7; 30]));
    assert!(h.requests().is_empty(), "no credit yet");

    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::RX,
        value: vec![0x01, 0x10, 0x00],
    });
    let (_, delay) = h.last_timer(TimerKind::FastAckWake).unwrap();
    assert_eq!(delay, Duration::from_millis(10));
    h.fire(TimerKind::FastAckWake);
    h.settle();
    assert_eq!(serial_writes(&h.requests()), vec![(vec![7; 16], WriteType::WithoutResponse)]);
    assert_eq!(h.session.pending_outbound(), 14);
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(0));

    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::RX,
        value: vec![0x01, 100, 0x00],
    });
    h.fire(TimerKind::FastAckWake);
    h.settle();
    let lengths: Vec<usize> = serial_writes(&h.requests()).iter().map(|(v, _)| v.len()).collect();
    assert_eq!(lengths, vec![16, 14]);
    assert_eq!(h.session.pending_outbound(), 0);
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(86));
}

#[test]
fn assigned_credit_wakes_a_stalled_writer() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.command(Command::WriteSerial(vec![1; 5]));
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::RX,
        value: vec![0x00, 0x00, 0x01],
    });
    h.fire(TimerKind::FastAckWake);
    h.settle();
    assert_eq!(serial_writes(&h.requests()).len(), 1);
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(251));
}

#[test]
fn failed_chunk_refunds_credit_and_is_resent() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::RX,
        value: vec![0x00, 40, 0x00],
    });
    h.command(Command::WriteSerial(vec![3; 10]));
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(30));
    h.reply(Err(TransportError::Status(GattStatus::FAILURE)));
    // refunded, then spent again by the resend in the same step
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(30));
    assert_eq!(
        serial_writes(&h.requests()),
        vec![(vec![3; 10], WriteType::WithoutResponse), (vec![3; 10], WriteType::WithoutResponse)]
    );
    h.settle();
    assert_eq!(serial_writes(&h.requests()).len(), 2);
    assert_eq!(h.session.pending_outbound(), 0);
    assert_eq!(h.session.flow_control().map(FlowControl::tx_credit), Some(30));
}

#[test]
fn received_data_returns_credit_past_threshold() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::TX,
        value: vec![0x41; 0x800],
    });
    assert!(h.requests().is_empty());
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::TX,
        value: vec![0x42; 0x801],
    });
    assert_eq!(
        h.requests(),
        vec![GattRequest::Write {
            characteristic: bgx_uuids::TX,
            value: vec![0x01, 0x01, 0x10],
            write_type: WriteType::WithResponse,
        }]
    );
    h.settle();
    assert_eq!(h.session.flow_control().map(FlowControl::rx_credit), Some(0x7FFF));

    let received: usize = h
        .events()
        .iter()
        .map(|e| match e {
            BgxEvent::DataReceived { data, .. } => data.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(received, 0x1001);
}

#[test]
fn malformed_backchannel_disables_flow_control() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.command(Command::WriteSerial(vec![9; 25]));
    assert!(h.requests().is_empty());
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::RX,
        value: vec![0x09, 0x09],
    });
    assert!(h.session.flow_control().is_none());
    h.settle();
    let lengths: Vec<usize> = serial_writes(&h.requests()).iter().map(|(v, _)| v.len()).collect();
    assert_eq!(lengths, vec![20, 5]);
}

#[test]
fn ota_streams_image_and_holds_the_queue() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0xEE; 1000]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.command(Command::WriteSerial(b"after".to_vec()));
    assert_eq!(
        h.outstanding.iter().cloned().collect::<Vec<_>>(),
        vec![GattRequest::Write {
            characteristic: bgx_uuids::OTA_CONTROL,
            value: vec![0x00],
            write_type: WriteType::WithResponse,
        }]
    );

    while h.last_timer(TimerKind::OtaFinish).is_none() {
        h.reply_ok();
        assert!(serial_writes(&h.requests()).is_empty(), "serial write interleaved with OTA");
    }
    let requests = h.requests();
    assert_eq!(ota_data_lengths(&requests), vec![244, 244, 244, 244, 24]);
    assert_eq!(
        requests.last(),
        Some(&GattRequest::Write {
            characteristic: bgx_uuids::OTA_CONTROL,
            value: vec![0x03],
            write_type: WriteType::WithResponse,
        })
    );
    assert_eq!(h.last_timer(TimerKind::OtaFinish).map(|(_, d)| d), Some(Duration::from_secs(15)));

    h.fire(TimerKind::OtaFinish);
    assert_eq!(
        h.ota_statuses(),
        vec![OtaStatus::Installing, OtaStatus::Finishing, OtaStatus::Finished]
    );
    let progress: Vec<usize> = h
        .events()
        .iter()
        .filter_map(|e| match e {
            BgxEvent::OtaProgress { bytes_sent, .. } => Some(*bytes_sent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![244, 488, 732, 976, 1000]);
    assert_eq!(h.session.ota_state(), OtaState::Idle);

    h.settle();
    assert_eq!(serial_writes(&h.requests()), vec![(b"after".to_vec(), WriteType::WithResponse)]);
    assert_eq!(h.max_in_flight, 1);
}

#[test]
fn ota_password_is_sent_with_start() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 8]),
        password: Some("pw".into()),
        write_type: WriteType::WithoutResponse,
    });
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Write {
            characteristic: bgx_uuids::OTA_CONTROL,
            value: vec![0x00, b'p', b'w', 0x00],
            write_type: WriteType::WithResponse,
        })
    );
    h.reply_ok();
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Write {
            characteristic: bgx_uuids::OTA_DATA,
            value: vec![0; 8],
            write_type: WriteType::WithoutResponse,
        })
    );
}

#[test]
fn rejected_ota_start_requires_password_and_frees_queue() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 500]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.command(Command::ReadBusMode);
    h.reply(Err(TransportError::Status(GattStatus::INSUFFICIENT_AUTHENTICATION)));

    assert_eq!(h.ota_statuses(), vec![OtaStatus::Installing, OtaStatus::PasswordRequired]);
    assert!(ota_data_lengths(&h.requests()).is_empty());
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Read {
            characteristic: bgx_uuids::MODE
        })
    );
}

#[test]
fn ota_cancel_stops_before_next_chunk() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 1000]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.reply_ok(); // control
    h.reply_ok(); // chunk 1
    h.command(Command::CancelOta);
    h.reply_ok(); // chunk 2

    assert_eq!(ota_data_lengths(&h.requests()), vec![244, 244]);
    assert_eq!(h.ota_statuses().last(), Some(&OtaStatus::UserCanceled));
    assert!(h.outstanding.is_empty());
    assert!(h.session.is_idle());
    assert_eq!(h.session.ota_state(), OtaState::Idle);
}

#[test]
fn ota_cancel_before_start_is_acknowledged_sends_no_data() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 1000]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.command(Command::CancelOta);
    h.reply_ok(); // control

    assert!(ota_data_lengths(&h.requests()).is_empty());
    assert_eq!(h.ota_statuses(), vec![OtaStatus::Installing, OtaStatus::UserCanceled]);
    assert!(h.outstanding.is_empty());
    assert!(h.session.is_idle());
    assert_eq!(h.session.ota_state(), OtaState::Idle);
}

#[test]
fn ota_cancel_during_final_chunk_skips_finish_command() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 8]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.reply_ok(); // control
    assert_eq!(h.session.ota_state(), OtaState::WroteThreeToControl);
    h.command(Command::CancelOta);
    h.reply_ok(); // final chunk

    assert_eq!(ota_data_lengths(&h.requests()), vec![8]);
    assert!(!h.requests().contains(&GattRequest::Write {
        characteristic: bgx_uuids::OTA_CONTROL,
        value: vec![0x03],
        write_type: WriteType::WithResponse,
    }));
    assert_eq!(h.ota_statuses(), vec![OtaStatus::Installing, OtaStatus::UserCanceled]);
    assert!(h.last_timer(TimerKind::OtaFinish).is_none());
    assert!(h.session.is_idle());
}

#[test]
fn ota_cancel_after_finish_command_still_finishes() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 8]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.reply_ok(); // control
    h.reply_ok(); // final chunk
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Write {
            characteristic: bgx_uuids::OTA_CONTROL,
            value: vec![0x03],
            write_type: WriteType::WithResponse,
        })
    );
    h.command(Command::CancelOta);
    h.reply_ok(); // finish command
    h.fire(TimerKind::OtaFinish);

    assert_eq!(
        h.ota_statuses(),
        vec![OtaStatus::Installing, OtaStatus::Finishing, OtaStatus::Finished]
    );
    assert!(h.session.is_idle());
    assert_eq!(h.session.ota_state(), OtaState::Idle);
}

#[test]
fn cancel_removes_queued_ota() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::ReadBusMode);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 100]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.command(Command::CancelOta);
    assert_eq!(h.ota_statuses(), vec![OtaStatus::UserCanceled]);
    h.settle();
    assert!(ota_data_lengths(&h.requests()).is_empty());
    assert!(!h
        .requests()
        .iter()
        .any(|r| matches!(r, GattRequest::Write { characteristic: bgx_uuids::OTA_CONTROL, .. })));
}

#[test]
fn second_ota_is_rejected() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 10]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    let second = h.session.handle_command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 10]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    assert!(matches!(second, Err(Error::OtaInProgress(_))));
}

#[test]
fn link_loss_mid_ota_resets_the_session() {
    let mut h = Harness::connected(SessionConfig::default(), true);
    h.command(Command::StartOta {
        image: FirmwareImage::from_bytes(vec![0; 1000]),
        password: None,
        write_type: WriteType::WithResponse,
    });
    h.command(Command::ReadBusMode);
    h.reply_ok();
    h.link(LinkEvent::Disconnected {
        status: GattStatus(0x0008),
    });

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.session.ota_state(), OtaState::Idle);
    assert!(h.session.is_idle());
    assert!(h.session.flow_control().is_none());
    let events = h.events();
    assert!(events.contains(&BgxEvent::OtaStatus {
        address: ADDR.into(),
        status: OtaStatus::Failed,
        failed: true,
    }));
    assert!(events.contains(&BgxEvent::ConnectionError {
        address: ADDR.into(),
        kind: ConnectionErrorKind::Gatt,
        status: GattStatus(0x0008),
    }));
    assert_eq!(
        events.last(),
        Some(&BgxEvent::ConnectionStateChanged {
            address: ADDR.into(),
            state: ConnectionState::Disconnected,
            bonded: false,
            status: Some(GattStatus(0x0008)),
        })
    );

    // the in-flight chunk completes after the link is gone
    let before = h.log.len();
    h.reply_ok();
    assert_eq!(h.log.len(), before);

    h.command(Command::Connect);
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[test]
fn user_disconnect_reports_success() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::Disconnect);
    h.settle();
    h.link(LinkEvent::Disconnected {
        status: GattStatus::SUCCESS,
    });
    assert_eq!(
        h.states(),
        vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
    );
    assert!(!h
        .events()
        .iter()
        .any(|e| matches!(e, BgxEvent::ConnectionError { .. })));
}

#[test]
fn stale_timers_are_ignored_after_disconnect() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.settle();
    h.link(LinkEvent::Disconnected {
        status: GattStatus::SUCCESS,
    });
    let before = h.log.len();
    h.fire(TimerKind::MtuRequest);
    assert_eq!(h.log.len(), before);
}

#[test]
fn refused_operation_is_requeued_at_the_tail() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::ReadBusMode);
    h.command(Command::GetDeviceInfo);
    h.reply(Err(TransportError::Refused("busy".into())));
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Read {
            characteristic: bgx_uuids::OTA_DEVICE_ID
        })
    );
    h.settle();

    let events = h.events();
    assert_eq!(
        events[0],
        BgxEvent::DeviceInfo {
            address: ADDR.into(),
            device_uuid: "4C892A6A01020304".into(),
            part_identifier: "4C892A6A".into(),
            part_id: PartId::Bgx13P,
            platform: Some("bgx13".into()),
        }
    );
    assert_eq!(
        events[1],
        BgxEvent::BusModeChanged {
            address: ADDR.into(),
            mode: BusMode::Stream,
        }
    );
}

#[test]
fn repeatedly_refused_operation_is_dropped() {
    let config = SessionConfig {
        max_dispatch_retries: 1,
        ..SessionConfig::default()
    };
    let mut h = Harness::connected(config, false);
    h.command(Command::ReadBusMode);
    h.reply(Err(TransportError::Refused("busy".into())));
    h.reply(Err(TransportError::Refused("busy".into())));
    assert!(h.outstanding.is_empty());
    assert_eq!(
        h.events(),
        vec![BgxEvent::OperationFailed {
            address: ADDR.into(),
            operation: "read-bus-mode",
            status: GattStatus::FAILURE,
        }]
    );
}

#[test]
fn failed_bus_mode_write_asks_for_password() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.command(Command::WriteBusMode {
        mode: BusMode::RemoteCommand,
        password: Some("secret".into()),
    });
    assert_eq!(
        h.outstanding.front(),
        Some(&GattRequest::Write {
            characteristic: bgx_uuids::MODE,
            value: b"\x03secret\x00".to_vec(),
            write_type: WriteType::WithResponse,
        })
    );
    h.reply(Err(TransportError::Status(GattStatus::INSUFFICIENT_AUTHENTICATION)));
    assert_eq!(
        h.events(),
        vec![BgxEvent::BusModePasswordRequired { address: ADDR.into() }]
    );
}

#[test]
fn mode_notifications_report_bus_mode() {
    let mut h = Harness::connected(SessionConfig::default(), false);
    h.link(LinkEvent::Notification {
        characteristic: bgx_uuids::MODE,
        value: vec![2],
    });
    assert_eq!(
        h.events(),
        vec![BgxEvent::BusModeChanged {
            address: ADDR.into(),
            mode: BusMode::LocalCommand,
        }]
    );
}

#[test]
fn stale_firmware_revision_flags_invalid_handles() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.firmware = b"garbage".to_vec();
    h.command(Command::Connect);
    h.settle();
    assert!(h.events().contains(&BgxEvent::InvalidGattHandles {
        address: ADDR.into(),
        name: Some("bgx-test".into()),
    }));
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert!(h.last_timer(TimerKind::MtuRequest).is_none());
}

#[test]
fn missing_ota_service_disconnects() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.services.retain(|s| s.uuid != bgx_uuids::OTA_SERVICE);
    h.command(Command::Connect);
    h.settle();
    assert!(h.events().contains(&BgxEvent::ConnectionError {
        address: ADDR.into(),
        kind: ConnectionErrorKind::ServicesMissing,
        status: GattStatus::FAILURE,
    }));
    assert_eq!(h.requests().last(), Some(&GattRequest::Disconnect));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
}

#[test]
fn descriptor_failure_during_setup_is_reported() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply_ok(); // connect
    h.reply_ok(); // bond state
    h.reply_ok(); // discovery
    h.reply(Err(TransportError::Status(GattStatus::FAILURE)));
    h.settle();
    assert!(h.events().contains(&BgxEvent::ConnectionError {
        address: ADDR.into(),
        kind: ConnectionErrorKind::Setup,
        status: GattStatus::FAILURE,
    }));
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[test]
fn connect_to_missing_device_fails() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply(Err(TransportError::Refused("no such peripheral".into())));
    assert_eq!(
        h.events()[1],
        BgxEvent::ConnectionError {
            address: ADDR.into(),
            kind: ConnectionErrorKind::DeviceNotFound,
            status: GattStatus::DEVICE_NOT_FOUND,
        }
    );
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
}

#[test]
fn unbonded_device_is_paired_then_polled() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply_ok(); // connect
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    assert_eq!(h.outstanding.front(), Some(&GattRequest::CreateBond));
    h.reply(Err(TransportError::Refused("pairing busy".into())));
    assert_eq!(h.outstanding.front(), Some(&GattRequest::BondState));
    h.reply(Ok(GattResponse::Bond(BondState::Bonding)));
    assert_eq!(h.last_timer(TimerKind::BondPoll).map(|(_, d)| d), Some(Duration::from_millis(500)));
    assert!(h.outstanding.is_empty());

    h.fire(TimerKind::BondPoll);
    h.reply(Ok(GattResponse::Bond(BondState::Bonded)));
    assert_eq!(h.session.state(), ConnectionState::Interrogating);
    assert_eq!(h.outstanding.front(), Some(&GattRequest::DiscoverServices));
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[test]
fn bond_polling_gives_up() {
    let config = SessionConfig {
        bond_poll_max_attempts: Some(2),
        ..SessionConfig::default()
    };
    let mut h = Harness::new(config, false);
    h.command(Command::Connect);
    h.reply_ok();
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.reply(Err(TransportError::Status(GattStatus::FAILURE)));
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.fire(TimerKind::BondPoll);
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.fire(TimerKind::BondPoll);
    h.reply(Ok(GattResponse::Bond(BondState::None)));

    assert!(h.events().contains(&BgxEvent::ConnectionError {
        address: ADDR.into(),
        kind: ConnectionErrorKind::BondTimeout,
        status: GattStatus::INSUFFICIENT_AUTHENTICATION,
    }));
    assert_eq!(h.outstanding.front(), Some(&GattRequest::Disconnect));
}

#[test]
fn rejected_pairing_is_a_bonding_failure() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply_ok();
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.reply_ok(); // create bond
    h.link(LinkEvent::BondStateChanged(BondState::Bonding));
    h.link(LinkEvent::BondStateChanged(BondState::None));

    assert!(h.events().contains(&BgxEvent::ConnectionError {
        address: ADDR.into(),
        kind: ConnectionErrorKind::BondingFailed,
        status: GattStatus::INSUFFICIENT_AUTHENTICATION,
    }));
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
}

#[test]
fn discovery_waits_for_settle_delay_after_pairing() {
    let config = SessionConfig {
        discovery_settle_ms: 200,
        ..SessionConfig::default()
    };
    let mut h = Harness::new(config, false);
    h.command(Command::Connect);
    h.reply_ok();
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.reply_ok();
    h.link(LinkEvent::BondStateChanged(BondState::Bonded));
    assert!(h.outstanding.is_empty());
    assert_eq!(
        h.last_timer(TimerKind::DiscoverySettle).map(|(_, d)| d),
        Some(Duration::from_millis(200))
    );
    h.fire(TimerKind::DiscoverySettle);
    assert_eq!(h.outstanding.front(), Some(&GattRequest::DiscoverServices));
}

#[test]
fn bond_change_during_poll_waits_for_the_poll() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply_ok(); // connect
    h.reply(Ok(GattResponse::Bond(BondState::None)));
    h.reply(Err(TransportError::Status(GattStatus::FAILURE))); // create bond
    assert_eq!(h.outstanding.front(), Some(&GattRequest::BondState));

    h.link(LinkEvent::BondStateChanged(BondState::Bonded));
    assert_eq!(h.session.state(), ConnectionState::Interrogating);
    assert_eq!(h.outstanding.iter().cloned().collect::<Vec<_>>(), vec![GattRequest::BondState]);

    h.reply(Ok(GattResponse::Bond(BondState::Bonded)));
    assert_eq!(h.outstanding.iter().cloned().collect::<Vec<_>>(), vec![GattRequest::DiscoverServices]);
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.max_in_flight, 1);
    let discoveries = h
        .requests()
        .iter()
        .filter(|r| matches!(r, GattRequest::DiscoverServices))
        .count();
    assert_eq!(discoveries, 1);
}

#[test]
fn disconnect_while_connecting_closes_a_late_link() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.command(Command::Disconnect);
    assert_eq!(
        h.outstanding.iter().cloned().collect::<Vec<_>>(),
        vec![GattRequest::Connect, GattRequest::Disconnect]
    );

    // no link is open yet, so the disconnect is refused at once
    let request = h.outstanding.pop_back().unwrap();
    let fx = h.session.apply(Input::Gatt {
        request,
        result: Err(TransportError::Refused("no link to device".into())),
    });
    h.absorb(fx);
    assert_eq!(h.session.state(), ConnectionState::Disconnected);

    h.reply_ok(); // the connect lands anyway
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.outstanding.iter().cloned().collect::<Vec<_>>(), vec![GattRequest::Disconnect]);
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert!(!h.requests().contains(&GattRequest::BondState));
    assert_eq!(
        h.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected
        ]
    );
}

#[test]
fn cancel_during_bonding_suppresses_progress() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    h.reply_ok();
    h.command(Command::CancelConnect);
    h.settle();

    assert_eq!(
        h.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Bonding,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected
        ]
    );
    assert!(!h.requests().contains(&GattRequest::DiscoverServices));
}

#[test]
fn phy_update_that_never_completes_times_out() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    while h.outstanding.front() != Some(&GattRequest::SetPreferredPhy) {
        h.reply_ok();
    }
    h.fire(TimerKind::PhyTimeout);
    // setup carries on; the late PHY completion is ignored
    assert_eq!(h.outstanding.len(), 2);
    h.settle();
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[test]
fn setup_refused_during_interrogation_still_precedes_connected() {
    let mut h = Harness::new(SessionConfig::default(), false);
    h.command(Command::Connect);
    while !matches!(h.outstanding.front(), Some(GattRequest::Read { .. })) {
        h.reply_ok();
    }
    h.reply(Err(TransportError::Refused("busy".into())));
    h.settle();

    let reads = h
        .requests()
        .iter()
        .filter(|r| {
            matches!(
                r,
                GattRequest::Read {
                    characteristic: bgx_uuids::FIRMWARE_REVISION
                }
            )
        })
        .count();
    assert_eq!(reads, 2);
    let firmware = h.position(|e| matches!(e, Effect::Emit(BgxEvent::FirmwareRevision { .. })));
    let connected = h.position(|e| {
        matches!(
            e,
            Effect::Emit(BgxEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            })
        )
    });
    assert!(firmware < connected);
}
