use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;
use std::fmt::Write as _;

/// BGX bus mode, as stored in the mode characteristic
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BusMode {
    Unknown = 0,
    Stream = 1,
    LocalCommand = 2,
    RemoteCommand = 3,
}

impl BusMode {
    pub fn from_value(value: &[u8]) -> BusMode {
        value
            .first()
            .and_then(|b| BusMode::try_from(*b).ok())
            .unwrap_or(BusMode::Unknown)
    }

    /// Mode characteristic payload. The password is only sent with remote
    /// command mode because firmware older than 1.2 rejects longer writes.
    pub fn write_payload(self, password: Option<&str>) -> Vec<u8> {
        let mut payload = vec![u8::from(self)];
        if self == BusMode::RemoteCommand {
            if let Some(pw) = password.filter(|pw| !pw.is_empty()) {
                payload.extend_from_slice(pw.as_bytes());
                payload.push(0);
            }
        }
        payload
    }
}

/// Part identified by the leading 8 hex digits of the device UUID
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PartId {
    Bgx13S,
    Bgx13P,
    BgxV3S,
    BgxV3P,
    Bgx220P,
    Bgx220S,
    Invalid,
    Unknown,
}

const PART_PREFIXES: [(&str, PartId); 7] = [
    ("080447D0", PartId::Bgx13S),
    ("4C892A6A", PartId::Bgx13P),
    ("F65FD7F0", PartId::BgxV3S),
    ("76786556", PartId::BgxV3P),
    ("CF07449C", PartId::Bgx220P),
    ("9C1F257E", PartId::Bgx220S),
    ("BAD1DEAD", PartId::Invalid),
];

impl PartId {
    pub fn from_device_uuid(device_uuid: &str) -> PartId {
        PART_PREFIXES
            .iter()
            .find(|(prefix, _)| device_uuid.starts_with(prefix))
            .map(|(_, part)| *part)
            .unwrap_or(PartId::Unknown)
    }
}

/// Identity read from the OTA device-id characteristic
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceIdentity {
    pub device_uuid: String,
    pub part_identifier: String,
    pub part_id: PartId,
}

impl DeviceIdentity {
    pub fn from_value(value: &[u8]) -> DeviceIdentity {
        let device_uuid = value.iter().fold(String::with_capacity(value.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02X}", b);
            s
        });
        let part_identifier = device_uuid.chars().take(8).collect();
        let part_id = PartId::from_device_uuid(&device_uuid);
        DeviceIdentity {
            device_uuid,
            part_identifier,
            part_id,
        }
    }
}

/// Validation applied to the firmware revision string. A revision that
/// fails it usually means the OS cached GATT handles from another firmware.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RevisionRules {
    pub required_prefix: String,
}

impl Default for RevisionRules {
    fn default() -> Self {
        RevisionRules {
            required_prefix: "BGX".to_string(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unexpected firmware revision string {0:?}")]
pub struct InvalidRevision(pub String);

/// Parsed `BGX13P.1.2.2738.2-1524-2738` style firmware revision
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FirmwareRevision {
    /// e.g. `bgx13`
    pub platform: String,
    /// e.g. `1.2.2738.2`
    pub revision: String,
    pub bootloader_version: Option<u32>,
}

impl FirmwareRevision {
    pub fn parse(raw: &str, rules: &RevisionRules) -> Result<FirmwareRevision, InvalidRevision> {
        let raw = raw.trim_end_matches('\0').trim();
        let pieces: Vec<&str> = raw.split('-').collect();
        let bootloader_version = match pieces.as_slice() {
            [_, bootloader, _] => bootloader.parse().ok(),
            _ => None,
        };

        let firmware = pieces[0];
        if !firmware.starts_with(rules.required_prefix.as_str()) {
            return Err(InvalidRevision(raw.to_string()));
        }
        let dot = match firmware.find('.') {
            Some(dot) if dot > 0 && firmware.is_char_boundary(dot - 1) => dot,
            _ => return Err(InvalidRevision(raw.to_string())),
        };
        // drop the S/P package suffix from the part name
        let platform = firmware[..dot - 1].to_lowercase();
        let revision = firmware[dot + 1..].to_string();

        Ok(FirmwareRevision {
            platform,
            revision,
            bootloader_version,
        })
    }
}
