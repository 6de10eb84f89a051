//! One tokio task per device.
//!
//! The task owns the [`DeviceSession`] and is the only place it is mutated.
//! Transport calls run on spawned tasks and report back through a channel,
//! so completions, notifications and timers are applied one at a time.

use crate::config::SessionConfig;
use crate::device_info::BusMode;
use crate::error::Error;
use crate::events::{BgxEvent, ConnectionState};
use crate::ota::FirmwareImage;
use crate::session::{Command, DeviceSession, Effect, Input};
use crate::transport::{self, GattRequest, Link, Transport, TransportError, WriteType};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const COMMAND_BUFFER: usize = 64;

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<(), Error>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("command", &self.command).finish()
    }
}

enum Internal {
    Input(Input),
    Linked {
        link: Arc<dyn Link>,
        forwarder: JoinHandle<()>,
    },
}

/// Cloneable handle to a running device session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    address: String,
    commands: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    idle: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection state satisfies `target`.
    pub async fn wait_for_state(&self, target: impl Fn(ConnectionState) -> bool) -> Result<ConnectionState, Error> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if target(current) {
                return Ok(current);
            }
            state
                .changed()
                .await
                .map_err(|_| Error::SessionClosed(self.address.clone()))?;
        }
    }

    /// Wait until no operation is queued or in flight.
    pub async fn wait_until_idle(&self) -> Result<(), Error> {
        let mut idle = self.idle.clone();
        while !*idle.borrow_and_update() {
            idle.changed()
                .await
                .map_err(|_| Error::SessionClosed(self.address.clone()))?;
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| Error::SessionClosed(self.address.clone()))?;
        response.await.map_err(|_| Error::SessionClosed(self.address.clone()))?
    }

    pub async fn connect(&self) -> Result<(), Error> {
        self.send(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.send(Command::Disconnect).await
    }

    pub async fn cancel_connect(&self) -> Result<(), Error> {
        self.send(Command::CancelConnect).await
    }

    pub async fn read_bus_mode(&self) -> Result<(), Error> {
        self.send(Command::ReadBusMode).await
    }

    pub async fn write_bus_mode(&self, mode: BusMode, password: Option<String>) -> Result<(), Error> {
        self.send(Command::WriteBusMode { mode, password }).await
    }

    pub async fn write_serial(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(Command::WriteSerial(data.into())).await
    }

    pub async fn get_device_info(&self) -> Result<(), Error> {
        self.send(Command::GetDeviceInfo).await
    }

    pub async fn set_acknowledged_writes(&self, enabled: bool) -> Result<(), Error> {
        self.send(Command::SetAcknowledgedWrites(enabled)).await
    }

    pub async fn set_acknowledged_reads(&self, enabled: bool) -> Result<(), Error> {
        self.send(Command::SetAcknowledgedReads(enabled)).await
    }

    pub async fn request_mtu(&self, mtu: u16) -> Result<(), Error> {
        self.send(Command::RequestMtu(mtu)).await
    }

    pub async fn start_ota(
        &self,
        image: FirmwareImage,
        password: Option<String>,
        write_type: WriteType,
    ) -> Result<(), Error> {
        self.send(Command::StartOta {
            image,
            password,
            write_type,
        })
        .await
    }

    pub async fn cancel_ota(&self) -> Result<(), Error> {
        self.send(Command::CancelOta).await
    }
}

struct SessionActor {
    session: DeviceSession,
    transport: Arc<dyn Transport>,
    link: Option<Arc<dyn Link>>,
    forwarder: Option<JoinHandle<()>>,
    inputs: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<BgxEvent>,
    state: watch::Sender<ConnectionState>,
    idle: watch::Sender<bool>,
}

/// Start the task for `address` and return its handle. The task ends, and
/// the link is dropped, once every handle is gone.
pub fn spawn(
    address: impl Into<String>,
    name: Option<String>,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<BgxEvent>,
) -> SessionHandle {
    let address = address.into();
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (inputs, input_rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (idle, idle_rx) = watch::channel(true);

    let actor = SessionActor {
        session: DeviceSession::new(address.clone(), name, config),
        transport,
        link: None,
        forwarder: None,
        inputs,
        events,
        state,
        idle,
    };
    tokio::spawn(actor.run(command_rx, input_rx));

    SessionHandle {
        address,
        commands,
        state: state_rx,
        idle: idle_rx,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Request>, mut inputs: mpsc::UnboundedReceiver<Internal>) {
        debug!(address = %self.session.address(), "session task started");
        loop {
            tokio::select! {
                request = commands.recv() => match request {
                    Some(Request { command, reply }) => {
                        let result = self.session.handle_command(command).map(|fx| self.perform(fx));
                        self.publish();
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                Some(internal) = inputs.recv() => match internal {
                    Internal::Input(input) => {
                        let fx = self.session.apply(input);
                        self.perform(fx);
                    }
                    Internal::Linked { link, forwarder } => {
                        if let Some(old) = self.forwarder.replace(forwarder) {
                            old.abort();
                        }
                        self.link = Some(link);
                    }
                },
            }
            self.publish();
        }

        debug!(address = %self.session.address(), "session task stopping");
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(link) = self.link.take() {
            if self.session.state() != ConnectionState::Disconnected {
                if let Err(e) = link.disconnect().await {
                    warn!(address = %self.session.address(), "disconnect on shutdown failed: {}", e);
                }
            }
        }
    }

    fn publish(&self) {
        publish(&self.state, self.session.state());
        publish(&self.idle, self.session.is_idle());
    }

    fn perform(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Gatt(request) => self.execute(request),
                Effect::Emit(event) => {
                    if self.events.send(event).is_err() {
                        trace!(address = %self.session.address(), "event sink closed");
                    }
                }
                Effect::Schedule { timer, delay } => {
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inputs.send(Internal::Input(Input::Timer(timer)));
                    });
                }
            }
        }
    }

    fn execute(&mut self, request: GattRequest) {
        let inputs = self.inputs.clone();
        match self.link.clone() {
            Some(link) => {
                tokio::spawn(async move {
                    let result = transport::execute(link.as_ref(), &request).await;
                    let _ = inputs.send(Internal::Input(Input::Gatt { request, result }));
                });
            }
            None if matches!(request, GattRequest::Connect) => {
                let transport = self.transport.clone();
                let address = self.session.address().to_string();
                tokio::spawn(async move {
                    let result = match open_link(transport.as_ref(), &address, &inputs).await {
                        Ok(link) => transport::execute(link.as_ref(), &request).await,
                        Err(e) => Err(e),
                    };
                    let _ = inputs.send(Internal::Input(Input::Gatt { request, result }));
                });
            }
            None => {
                let result = Err(TransportError::Refused("no link to device".into()));
                let _ = inputs.send(Internal::Input(Input::Gatt { request, result }));
            }
        }
    }
}

/// Open a link and start forwarding its events to the session.
async fn open_link(
    transport: &dyn Transport,
    address: &str,
    inputs: &mpsc::UnboundedSender<Internal>,
) -> Result<Arc<dyn Link>, TransportError> {
    let link = transport.open(address).await?;
    let mut events = link.events().await?;
    let forward = inputs.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if forward.send(Internal::Input(Input::Link(event))).is_err() {
                break;
            }
        }
    });
    let _ = inputs.send(Internal::Linked {
        link: link.clone(),
        forwarder,
    });
    Ok(link)
}

fn publish<T: PartialEq>(sender: &watch::Sender<T>, current: T) {
    sender.send_if_modified(|value| {
        if *value == current {
            false
        } else {
            *value = current;
            true
        }
    });
}
