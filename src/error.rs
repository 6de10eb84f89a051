use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no session for device {0}")]
    UnknownDevice(String),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("device {0} is already connecting or connected")]
    AlreadyConnected(String),

    #[error("an OTA update is already in progress on {0}")]
    OtaInProgress(String),

    #[error("invalid MTU {0}: must be at least {}", crate::MIN_MTU)]
    InvalidMtu(u16),

    #[error("session for {0} has shut down")]
    SessionClosed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
