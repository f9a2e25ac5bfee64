//! Sender addresses for commanding actuators.
//!
//! An FSB61NP obeys any telegram whose sender ID it was taught, whatever the destination. Every
//! shutter therefore needs its own sender ID, `base ID + offset`, and the offset must not change
//! once the actuator has been taught.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use enocean::DeviceId;

use crate::config::{ConfigError, ShutterConfig};

/// The transceiver owns 128 IDs starting at its base ID.
pub const MAX_SENDER_OFFSET: u8 = 127;

/// The offset a shutter sends from: its manual override, or the last byte of its device ID
/// modulo 128.
pub fn offset_for(device_id: DeviceId, manual: Option<u8>) -> u8 {
    manual.unwrap_or(device_id.last_byte() % (MAX_SENDER_OFFSET + 1))
}

/// Checks that every shutter resolves to its own offset, returning the offsets in config order.
pub fn validate_all(shutters: &[ShutterConfig]) -> Result<Vec<u8>, ConfigError> {
    let mut taken: BTreeMap<u8, &ShutterConfig> = BTreeMap::new();
    let mut offsets = Vec::with_capacity(shutters.len());

    for shutter in shutters {
        if let Some(manual) = shutter.sender_offset {
            if manual > MAX_SENDER_OFFSET {
                return Err(ConfigError::SenderOffsetOutOfRange {
                    shutter: shutter.name.clone(),
                    offset: i64::from(manual),
                });
            }
        }

        let offset = offset_for(shutter.device_id, shutter.sender_offset);
        if let Some(first) = taken.insert(offset, shutter) {
            return Err(ConfigError::SenderOffsetCollision {
                first: first.name.clone(),
                second: shutter.name.clone(),
                offset,
            });
        }
        offsets.push(offset);
    }

    Ok(offsets)
}

/// Sender ID allocated to one shutter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SenderAddress {
    pub base: DeviceId,
    pub offset: u8,
}

impl SenderAddress {
    pub fn new(base: DeviceId, offset: u8) -> Self {
        Self { base, offset }
    }

    pub fn id(self) -> DeviceId {
        self.base.offset(self.offset)
    }
}

impl Display for SenderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (offset {})", self.id(), self.offset)
    }
}
