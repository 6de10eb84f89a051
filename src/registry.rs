//! Address-keyed table of device sessions.

use crate::actor::{self, SessionHandle};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::events::BgxEvent;
use crate::transport::{bgx_uuids, DiscoveredDevice, ScanFilter, Transport};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<BgxEvent>,
    sessions: HashMap<String, SessionHandle>,
    names: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig, events: mpsc::UnboundedSender<BgxEvent>) -> Self {
        SessionRegistry {
            transport,
            config,
            events,
            sessions: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Scan for BGX devices for `duration`, or until the transport stops
    /// reporting. Each device is reported once per scan.
    pub async fn scan(&mut self, duration: Duration) -> Result<Vec<DiscoveredDevice>, Error> {
        self.scan_until(duration, |_| false).await
    }

    /// Scan until a device satisfying `matches` is seen.
    pub async fn find(
        &mut self,
        timeout: Duration,
        matches: impl Fn(&DiscoveredDevice) -> bool,
    ) -> Result<Option<DiscoveredDevice>, Error> {
        let found = self.scan_until(timeout, &matches).await?;
        Ok(found.into_iter().find(|device| matches(device)))
    }

    async fn scan_until(
        &mut self,
        duration: Duration,
        stop: impl Fn(&DiscoveredDevice) -> bool,
    ) -> Result<Vec<DiscoveredDevice>, Error> {
        let filter = ScanFilter {
            services: vec![bgx_uuids::STREAM_SERVICE],
        };
        let mut stream = self.transport.scan(filter).await?;
        self.emit(BgxEvent::ScanModeChanged { scanning: true });
        info!("scanning for BGX devices");

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let mut found: Vec<DiscoveredDevice> = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = stream.next() => match next {
                    Some(device) => {
                        if found.iter().any(|seen| seen.address == device.address) {
                            continue;
                        }
                        debug!(address = %device.address, name = ?device.name, rssi = ?device.rssi, "discovered");
                        if let Some(name) = &device.name {
                            self.names.insert(device.address.clone(), name.clone());
                        }
                        self.emit(BgxEvent::DeviceDiscovered(device.clone()));
                        let done = stop(&device);
                        found.push(device);
                        if done {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        drop(stream);
        if let Err(e) = self.transport.stop_scan().await {
            warn!("stopping scan failed: {}", e);
        }
        self.emit(BgxEvent::ScanModeChanged { scanning: false });
        Ok(found)
    }

    /// Session for `address`, started on first use.
    pub fn session(&mut self, address: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.get(address) {
            return handle.clone();
        }
        let handle = actor::spawn(
            address,
            self.names.get(address).cloned(),
            self.config.clone(),
            self.transport.clone(),
            self.events.clone(),
        );
        self.sessions.insert(address.to_string(), handle.clone());
        handle
    }

    pub fn get(&self, address: &str) -> Result<&SessionHandle, Error> {
        self.sessions
            .get(address)
            .ok_or_else(|| Error::UnknownDevice(address.to_string()))
    }

    /// Start (or reuse) the session for `address` and ask it to connect.
    pub async fn connect(&mut self, address: &str) -> Result<SessionHandle, Error> {
        let handle = self.session(address);
        handle.connect().await?;
        Ok(handle)
    }

    pub async fn disconnect(&self, address: &str) -> Result<(), Error> {
        self.get(address)?.disconnect().await
    }

    /// Drop the registry's handle. The session task ends when the last
    /// handle is gone.
    pub fn remove(&mut self, address: &str) -> Result<SessionHandle, Error> {
        self.sessions
            .remove(address)
            .ok_or_else(|| Error::UnknownDevice(address.to_string()))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn device_name(&self, address: &str) -> Option<&str> {
        self.names.get(address).map(String::as_str)
    }

    fn emit(&self, event: BgxEvent) {
        let _ = self.events.send(event);
    }
}
