//! Host-side engine for Silicon Labs BGX BLE-to-serial bridges.
//!
//! Each device gets a [`DeviceSession`], a synchronous state machine that
//! turns host commands and transport completions into transport requests,
//! timers and [`BgxEvent`]s. [`actor::spawn`] runs one session per tokio
//! task against a [`transport::Transport`], and [`SessionRegistry`] keeps
//! the sessions by device address.

pub mod actor;
pub mod config;
pub mod device_info;
pub mod error;
pub mod events;
pub mod fastack;
pub mod operation;
pub mod ota;
pub mod queue;
pub mod registry;
pub mod session;
pub mod transport;
pub mod transport_btleplug;

pub use actor::SessionHandle;
pub use config::SessionConfig;
pub use device_info::{BusMode, PartId};
pub use error::Error;
pub use events::{BgxEvent, ConnectionErrorKind, ConnectionState};
pub use ota::{FirmwareImage, OtaStatus};
pub use registry::SessionRegistry;
pub use session::{Command, DeviceSession, Effect, Input};

/// Smallest ATT MTU a host may request
pub const MIN_MTU: u16 = 23;
