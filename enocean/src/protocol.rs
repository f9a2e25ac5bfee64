use std::convert::TryFrom;
use std::fmt::{self, Display};

use crate::{DecodeError, DeviceId, Packet};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PacketType {
    RadioErp1,
    Response,
    RadioSubTel,
    Event,
    CommonCommand,
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> u8 {
        match packet_type {
            PacketType::RadioErp1 => 0x01,
            PacketType::Response => 0x02,
            PacketType::RadioSubTel => 0x03,
            PacketType::Event => 0x04,
            PacketType::CommonCommand => 0x05,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0x01 => Ok(PacketType::RadioErp1),
            0x02 => Ok(PacketType::Response),
            0x03 => Ok(PacketType::RadioSubTel),
            0x04 => Ok(PacketType::Event),
            0x05 => Ok(PacketType::CommonCommand),
            _ => Err(DecodeError::UnknownPacketType(byte)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommonCommand {
    ReadIdBase,
}

impl From<CommonCommand> for u8 {
    fn from(command: CommonCommand) -> u8 {
        match command {
            CommonCommand::ReadIdBase => 0x08,
        }
    }
}

impl CommonCommand {
    pub fn into_packet(self) -> Packet {
        Packet::new(
            PacketType::CommonCommand.into(),
            vec![u8::from(self)],
            vec![],
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnCode {
    Ok,
    Error,
    NotSupported,
    WrongParam,
    OperationDenied,
    Other(u8),
}

impl From<u8> for ReturnCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => ReturnCode::Ok,
            0x01 => ReturnCode::Error,
            0x02 => ReturnCode::NotSupported,
            0x03 => ReturnCode::WrongParam,
            0x04 => ReturnCode::OperationDenied,
            other => ReturnCode::Other(other),
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Ok => write!(f, "RET_OK"),
            ReturnCode::Error => write!(f, "RET_ERROR"),
            ReturnCode::NotSupported => write!(f, "RET_NOT_SUPPORTED"),
            ReturnCode::WrongParam => write!(f, "RET_WRONG_PARAM"),
            ReturnCode::OperationDenied => write!(f, "RET_OPERATION_DENIED"),
            ReturnCode::Other(code) => write!(f, "return code {:#04x}", code),
        }
    }
}

/// The transceiver's answer to a packet we sent it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub code: ReturnCode,
    pub data: Vec<u8>,
}

impl Response {
    pub fn from_packet(packet: &Packet) -> Result<Self, DecodeError> {
        if PacketType::try_from(packet.packet_type)? != PacketType::Response {
            return Err(DecodeError::UnknownPacketType(packet.packet_type));
        }

        let (code, data) = packet
            .data
            .split_first()
            .ok_or(DecodeError::MalformedFrame)?;

        Ok(Self {
            code: ReturnCode::from(*code),
            data: data.to_vec(),
        })
    }

    /// Base ID from the answer to `CO_RD_IDBASE`.
    pub fn id_base(&self) -> Result<DeviceId, DecodeError> {
        match self.data.get(..4) {
            Some(&[a, b, c, d]) => Ok(DeviceId::from_bytes([a, b, c, d])),
            _ => Err(DecodeError::MalformedFrame),
        }
    }
}
