use std::fmt::{self, Debug, Display};
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::time::Duration;

use crate::{ReadWire, ReadWireExt, WriteWire, WriteWireExt};

/// A 4-byte EnOcean chip or sender ID, written `05:12:34:56`.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const BROADCAST: DeviceId = DeviceId(0xFFFF_FFFF);

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        DeviceId(u32::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn last_byte(self) -> u8 {
        self.to_bytes()[3]
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Sender addresses are allocated as `base + offset` inside the transceiver's ID range.
    pub fn offset(self, offset: u8) -> Self {
        DeviceId(self.0.wrapping_add(u32::from(offset)))
    }

    /// Lower-case hex without separators, e.g. `05123456`.
    pub fn compact(self) -> String {
        format!("{:08x}", self.0)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.to_bytes();
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d)
    }
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDeviceIdError(String);

impl Display for ParseDeviceIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid device ID {:?}, expected four hex bytes like 05:12:34:56",
            self.0
        )
    }
}

impl std::error::Error for ParseDeviceIdError {}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let error = || ParseDeviceIdError(s.to_string());

        let parts = s.trim().split(':').collect::<Vec<_>>();
        if parts.len() != 4 {
            return Err(error());
        }

        let mut bytes = [0; 4];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(error());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| error())?;
        }

        Ok(DeviceId::from_bytes(bytes))
    }
}

impl ReadWire for DeviceId {
    fn read_wire<R>(r: &mut R) -> io::Result<Self>
    where
        R: Read,
    {
        Ok(DeviceId(r.read_wire()?))
    }
}

impl WriteWire for DeviceId {
    fn wire_len(&self) -> u16 {
        4
    }

    fn write_wire<W>(self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_wire(self.0)
    }
}

/// Direction of travel. `Open` is "up" as the actuator is wired.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Open,
    Close,
}

impl Direction {
    pub fn inverted(self) -> Self {
        match self {
            Direction::Open => Direction::Close,
            Direction::Close => Direction::Open,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Open => write!(f, "open"),
            Direction::Close => write!(f, "close"),
        }
    }
}

/// The three commands an FSB61NP understands. Moving to a percentage is an `Open`/`Close`
/// followed by a timed `Stop`.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum CommandKind {
    Open,
    Close,
    Stop,
}

impl CommandKind {
    pub fn direction(self) -> Option<Direction> {
        match self {
            CommandKind::Open => Some(Direction::Open),
            CommandKind::Close => Some(Direction::Close),
            CommandKind::Stop => None,
        }
    }

    pub fn inverted(self) -> Self {
        match self {
            CommandKind::Open => CommandKind::Close,
            CommandKind::Close => CommandKind::Open,
            CommandKind::Stop => CommandKind::Stop,
        }
    }
}

impl From<Direction> for CommandKind {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Open => CommandKind::Open,
            Direction::Close => CommandKind::Close,
        }
    }
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Open => write!(f, "OPEN"),
            CommandKind::Close => write!(f, "CLOSE"),
            CommandKind::Stop => write!(f, "STOP"),
        }
    }
}

/// What an actuator reported about its motor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatusIndication {
    /// The motor started running.
    Started(Direction),
    /// The actuator reached an end stop.
    EndPosition(Direction),
    /// The motor stopped. 4BS stop reports carry how long and which way it ran.
    Stopped {
        run_time: Option<Duration>,
        direction: Option<Direction>,
    },
}

impl StatusIndication {
    pub fn inverted(self) -> Self {
        match self {
            StatusIndication::Started(direction) => StatusIndication::Started(direction.inverted()),
            StatusIndication::EndPosition(direction) => {
                StatusIndication::EndPosition(direction.inverted())
            }
            StatusIndication::Stopped {
                run_time,
                direction,
            } => StatusIndication::Stopped {
                run_time,
                direction: direction.map(Direction::inverted),
            },
        }
    }

    /// Whether the motor is known to be at rest after this report.
    pub fn is_stop(&self) -> bool {
        !matches!(self, StatusIndication::Started(_))
    }
}
