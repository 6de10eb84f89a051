//! BGX over-the-air firmware update.
//!
//! The host writes `0` (optionally followed by a NUL terminated password) to
//! the OTA control characteristic, streams the image to the OTA data
//! characteristic in fixed chunks, then writes `3` to the control
//! characteristic so the device applies the image.

use crate::transport::{GattStatus, WriteType};
use num_enum::IntoPrimitive;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Image bytes per data write. Some firmware rejects a final chunk that is
/// not 4 byte aligned, so this must stay divisible by four.
pub const OTA_CHUNK_SIZE: usize = 244;

const _: () = assert!(OTA_CHUNK_SIZE % 4 == 0);

/// OTA control point values
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum OtaControl {
    Start = 0x00,
    Finish = 0x03,
}

/// Firmware image: a byte stream with a declared total length
pub struct FirmwareImage {
    reader: Box<dyn Read + Send>,
    len: usize,
}

impl FirmwareImage {
    pub fn new(reader: impl Read + Send + 'static, len: usize) -> Self {
        FirmwareImage {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        FirmwareImage::new(io::Cursor::new(bytes), len)
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let len = usize::try_from(file.metadata()?.len()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(FirmwareImage::new(io::BufReader::new(file), len))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buf` unless the stream ends first.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage").field("len", &self.len).finish_non_exhaustive()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OtaState {
    Idle,
    WroteZeroToControl,
    WritingImage,
    WroteThreeToControl,
}

/// Status reported to the host
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OtaStatus {
    PasswordRequired,
    Installing,
    Finishing,
    Finished,
    Failed,
    UserCanceled,
}

impl OtaStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OtaStatus::PasswordRequired | OtaStatus::Finished | OtaStatus::Failed | OtaStatus::UserCanceled
        )
    }
}

/// What the session has to do next on behalf of the update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaStep {
    WriteControl(Vec<u8>),
    WriteData { value: Vec<u8>, write_type: WriteType },
    Progress { bytes_sent: usize },
    Status(OtaStatus),
    /// Wait for the firmware to apply the image, then call `finish_elapsed`
    ScheduleFinish,
    /// The update is over; release the queue
    Terminal(OtaStatus),
}

fn start_payload(password: Option<&str>) -> Vec<u8> {
    let mut payload: Vec<u8> = vec![OtaControl::Start.into()];
    if let Some(pw) = password.filter(|pw| !pw.is_empty()) {
        payload.extend_from_slice(pw.as_bytes());
        payload.push(0);
    }
    payload
}

#[derive(Debug)]
pub struct OtaEngine {
    state: OtaState,
    image: Option<FirmwareImage>,
    image_size: usize,
    bytes_sent: usize,
    cancel_requested: bool,
    data_write_type: WriteType,
    finish_status: Option<GattStatus>,
}

impl Default for OtaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaEngine {
    pub fn new() -> Self {
        OtaEngine {
            state: OtaState::Idle,
            image: None,
            image_size: 0,
            bytes_sent: 0,
            cancel_requested: false,
            data_write_type: WriteType::WithResponse,
            finish_status: None,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn in_progress(&self) -> bool {
        self.state != OtaState::Idle
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn start(&mut self, image: FirmwareImage, password: Option<&str>, data_write_type: WriteType) -> Vec<OtaStep> {
        info!(image_size = image.len(), "starting OTA");
        self.image_size = image.len();
        self.image = Some(image);
        self.bytes_sent = 0;
        self.cancel_requested = false;
        self.finish_status = None;
        self.data_write_type = data_write_type;
        self.state = OtaState::WroteZeroToControl;
        vec![OtaStep::WriteControl(start_payload(password))]
    }

    /// Request cancellation. Takes effect before the next chunk write.
    pub fn cancel(&mut self) -> bool {
        if self.in_progress() {
            self.cancel_requested = true;
        }
        self.cancel_requested
    }

    pub fn on_control_written(&mut self, status: GattStatus) -> Vec<OtaStep> {
        match self.state {
            OtaState::WroteZeroToControl if status.is_success() => {
                self.state = OtaState::WritingImage;
                self.next_chunk()
            }
            OtaState::WroteZeroToControl => {
                warn!(%status, "OTA start rejected, password required");
                self.terminal(OtaStatus::PasswordRequired)
            }
            OtaState::WroteThreeToControl => {
                self.finish_status = Some(status);
                vec![OtaStep::ScheduleFinish]
            }
            state => {
                warn!(?state, "unexpected OTA control write completion");
                Vec::new()
            }
        }
    }

    pub fn on_data_written(&mut self, status: GattStatus) -> Vec<OtaStep> {
        if !status.is_success() {
            error!(%status, bytes_sent = self.bytes_sent, "OTA data write failed");
            return self.terminal(OtaStatus::Failed);
        }
        match self.state {
            OtaState::WritingImage => self.next_chunk(),
            OtaState::WroteThreeToControl => {
                if self.cancel_requested {
                    return self.terminal(OtaStatus::UserCanceled);
                }
                debug!("final OTA chunk acknowledged, writing finish command");
                vec![
                    OtaStep::Status(OtaStatus::Finishing),
                    OtaStep::WriteControl(vec![OtaControl::Finish.into()]),
                ]
            }
            state => {
                warn!(?state, "unexpected OTA data write completion");
                Vec::new()
            }
        }
    }

    /// The settle delay after the finish command has passed.
    pub fn finish_elapsed(&mut self) -> Vec<OtaStep> {
        match self.finish_status.take() {
            Some(status) if status.is_success() => self.terminal(OtaStatus::Finished),
            Some(status) => {
                error!(%status, "OTA finish command failed");
                self.terminal(OtaStatus::Failed)
            }
            None => Vec::new(),
        }
    }

    /// A write was refused by the transport. OTA writes are never retried.
    pub fn on_refused(&mut self) -> Vec<OtaStep> {
        if self.in_progress() {
            self.terminal(OtaStatus::Failed)
        } else {
            Vec::new()
        }
    }

    /// Drop any update in progress. Returns true if one was running.
    pub fn reset(&mut self) -> bool {
        let was_active = self.in_progress();
        self.state = OtaState::Idle;
        self.image = None;
        self.cancel_requested = false;
        self.finish_status = None;
        was_active
    }

    fn terminal(&mut self, status: OtaStatus) -> Vec<OtaStep> {
        self.reset();
        vec![OtaStep::Terminal(status)]
    }

    fn next_chunk(&mut self) -> Vec<OtaStep> {
        if self.cancel_requested {
            info!(bytes_sent = self.bytes_sent, "OTA canceled by user");
            return self.terminal(OtaStatus::UserCanceled);
        }

        let want = OTA_CHUNK_SIZE.min(self.image_size.saturating_sub(self.bytes_sent));
        let mut buffer = vec![0u8; want];
        let read = match self.image.as_mut() {
            Some(image) if want > 0 => image.read_chunk(&mut buffer),
            _ => Ok(0),
        };
        let read = match read {
            Ok(0) => {
                error!(bytes_sent = self.bytes_sent, "OTA image ended early");
                return self.terminal(OtaStatus::Failed);
            }
            Ok(n) => n,
            Err(e) => {
                error!(bytes_sent = self.bytes_sent, "error reading OTA image: {}", e);
                return self.terminal(OtaStatus::Failed);
            }
        };
        buffer.truncate(read);
        self.bytes_sent += read;

        if read < OTA_CHUNK_SIZE || self.bytes_sent == self.image_size {
            debug!(chunk = read, bytes_sent = self.bytes_sent, "writing final OTA chunk");
            self.state = OtaState::WroteThreeToControl;
        }

        vec![
            OtaStep::Progress {
                bytes_sent: self.bytes_sent,
            },
            OtaStep::WriteData {
                value: buffer,
                write_type: self.data_write_type,
            },
        ]
    }
}
