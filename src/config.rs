use crate::device_info::RevisionRules;
use crate::error::Error;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Timing and policy knobs of a device session.
///
/// Protocol constants shared with BGX firmware (OTA chunk size, FastAck
/// thresholds, control values) are not configurable.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub bond_poll_interval_ms: u64,
    /// `None` polls until bonded or canceled
    pub bond_poll_max_attempts: Option<u32>,
    /// Wait between bonding and service discovery; zero discovers at once
    pub discovery_settle_ms: u64,
    pub prefer_2m_phy: bool,
    pub phy_timeout_ms: u64,
    pub ota_finish_delay_ms: u64,
    pub fastack_wake_delay_ms: u64,
    pub mtu_request_delay_ms: u64,
    pub requested_mtu: u16,
    pub default_write_chunk: usize,
    pub max_dispatch_retries: u32,
    pub revision_rules: RevisionRules,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            bond_poll_interval_ms: 500,
            bond_poll_max_attempts: Some(120),
            discovery_settle_ms: 0,
            prefer_2m_phy: true,
            phy_timeout_ms: 500,
            ota_finish_delay_ms: 15_000,
            fastack_wake_delay_ms: 10,
            mtu_request_delay_ms: 1_000,
            requested_mtu: 247,
            default_write_chunk: 20,
            max_dispatch_retries: 5,
            revision_rules: RevisionRules::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let config: SessionConfig = serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.default_write_chunk == 0 {
            return Err(Error::Config("default_write_chunk must be positive".into()));
        }
        if self.requested_mtu < crate::MIN_MTU {
            return Err(Error::Config(format!("requested_mtu must be at least {}", crate::MIN_MTU)));
        }
        if self.bond_poll_interval_ms == 0 {
            return Err(Error::Config("bond_poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn bond_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bond_poll_interval_ms)
    }

    pub fn discovery_settle(&self) -> Duration {
        Duration::from_millis(self.discovery_settle_ms)
    }

    pub fn phy_timeout(&self) -> Duration {
        Duration::from_millis(self.phy_timeout_ms)
    }

    pub fn ota_finish_delay(&self) -> Duration {
        Duration::from_millis(self.ota_finish_delay_ms)
    }

    pub fn fastack_wake_delay(&self) -> Duration {
        Duration::from_millis(self.fastack_wake_delay_ms)
    }

    pub fn mtu_request_delay(&self) -> Duration {
        Duration::from_millis(self.mtu_request_delay_ms)
    }
}
