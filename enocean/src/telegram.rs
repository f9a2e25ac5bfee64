//! Radio telegrams for Eltako FSB61NP shutter actuators.
//!
//! The FSB61NP does not use a standard EEP. Commands are 4BS telegrams whose data bytes are:
//!
//! - DB3/DB2: run time in 100 ms steps (big-endian), 0 for stop
//! - DB1: 0x00 stop, 0x01 up, 0x02 down
//! - DB0: 0x0A (data telegram, run time in 100 ms)
//!
//! The actuator reports with RPS telegrams when the motor starts or reaches an end stop, and with
//! a 4BS telegram carrying the run time when it stops.

use std::convert::TryFrom;
use std::io::Cursor;
use std::time::Duration;

use crate::{
    CommandKind, DecodeError, DeviceId, Direction, Packet, PacketType, ReadWireExt,
    StatusIndication, WriteWireExt,
};

const RORG_RPS: u8 = 0xF6;
const RORG_4BS: u8 = 0xA5;

/// T21 and NU set, as for every telegram we send.
const STATUS_SENT: u8 = 0x30;
const STATUS_NU: u8 = 0x10;

const DB0_DATA: u8 = 0x08;
const DB0_TIME_IN_100MS: u8 = 0x02;

const SUB_TEL_SEND: u8 = 0x03;
const DBM_MAX: u8 = 0xFF;
const SECURITY_NONE: u8 = 0x00;

const RPS_STARTED_UP: u8 = 0x01;
const RPS_STARTED_DOWN: u8 = 0x02;
const RPS_END_TOP: u8 = 0x70;
const RPS_END_BOTTOM: u8 = 0x50;

const TEACH_IN_DATA: [u8; 4] = [0xFF, 0xF8, 0x0D, 0x80];

/// Longest run time the actuator accepts in a single command.
pub const MAX_RUN_TIME: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, PartialEq)]
pub enum TelegramKind {
    Status(StatusIndication),
    Command {
        kind: CommandKind,
        run_time: Duration,
    },
    TeachIn,
}

/// A decoded radio telegram.
#[derive(Clone, Debug, PartialEq)]
pub struct Telegram {
    pub kind: TelegramKind,
    pub sender: DeviceId,
    /// `DeviceId::BROADCAST` unless the telegram was addressed.
    pub destination: DeviceId,
    pub payload: Vec<u8>,
}

pub fn command_packet(
    sender: DeviceId,
    destination: DeviceId,
    kind: CommandKind,
    run_time: Duration,
) -> Packet {
    let tenths = match kind {
        CommandKind::Stop => 0,
        _ => (run_time.min(MAX_RUN_TIME).as_millis() / 100) as u16,
    };
    let db1 = match kind {
        CommandKind::Stop => 0x00,
        CommandKind::Open => 0x01,
        CommandKind::Close => 0x02,
    };

    let [db3, db2] = tenths.to_be_bytes();
    radio_packet(
        RORG_4BS,
        &[db3, db2, db1, DB0_DATA | DB0_TIME_IN_100MS],
        sender,
        destination,
    )
}

pub fn teach_in_packet(sender: DeviceId, destination: DeviceId) -> Packet {
    radio_packet(RORG_4BS, &TEACH_IN_DATA, sender, destination)
}

/// Builds a complete ESP3 frame for a command telegram.
pub fn encode_command(
    sender: DeviceId,
    destination: DeviceId,
    kind: CommandKind,
    run_time: Duration,
) -> Vec<u8> {
    command_packet(sender, destination, kind, run_time).to_frame()
}

/// Builds a complete ESP3 frame for a teach-in telegram.
pub fn encode_teach_in(sender: DeviceId, destination: DeviceId) -> Vec<u8> {
    teach_in_packet(sender, destination).to_frame()
}

fn radio_packet(rorg: u8, payload: &[u8], sender: DeviceId, destination: DeviceId) -> Packet {
    let mut data = Vec::with_capacity(payload.len() + 6);
    data.push(rorg);
    data.extend_from_slice(payload);
    // Writing to a Vec cannot fail.
    let _ = data.write_wire(sender);
    data.push(STATUS_SENT);

    let mut optional = Vec::with_capacity(7);
    optional.push(SUB_TEL_SEND);
    let _ = optional.write_wire(destination);
    optional.push(DBM_MAX);
    optional.push(SECURITY_NONE);

    Packet::new(PacketType::RadioErp1.into(), data, optional)
}

/// Decodes one complete ESP3 frame carrying a radio telegram.
pub fn decode(frame: &[u8]) -> Result<Telegram, DecodeError> {
    decode_packet(&Packet::from_frame(frame)?)
}

pub fn decode_packet(packet: &Packet) -> Result<Telegram, DecodeError> {
    if PacketType::try_from(packet.packet_type)? != PacketType::RadioErp1 {
        return Err(DecodeError::UnknownPacketType(packet.packet_type));
    }

    let rorg = *packet.data.first().ok_or(DecodeError::MalformedFrame)?;
    let payload_len = match rorg {
        RORG_RPS => 1,
        RORG_4BS => 4,
        _ => return Err(DecodeError::UnknownTelegramType(rorg)),
    };

    // RORG, payload, sender, status.
    if packet.data.len() != 1 + payload_len + 4 + 1 {
        return Err(DecodeError::MalformedFrame);
    }

    let payload = packet.data[1..1 + payload_len].to_vec();
    let mut cursor = Cursor::new(&packet.data[1 + payload_len..]);
    let sender: DeviceId = cursor.read_wire()?;
    let status: u8 = cursor.read_wire()?;
    let destination = read_destination(&packet.optional)?;

    let kind = match rorg {
        RORG_RPS => TelegramKind::Status(decode_rps(payload[0], status, rorg)?),
        _ => decode_4bs(&payload, destination)?,
    };

    Ok(Telegram {
        kind,
        sender,
        destination,
        payload,
    })
}

fn read_destination(optional: &[u8]) -> Result<DeviceId, DecodeError> {
    if optional.is_empty() {
        return Ok(DeviceId::BROADCAST);
    }

    let mut cursor = Cursor::new(optional);
    let _sub_tel: u8 = cursor.read_wire()?;
    Ok(cursor.read_wire()?)
}

fn decode_rps(db0: u8, status: u8, rorg: u8) -> Result<StatusIndication, DecodeError> {
    let indication = match db0 {
        RPS_STARTED_UP => StatusIndication::Started(Direction::Open),
        RPS_STARTED_DOWN => StatusIndication::Started(Direction::Close),
        RPS_END_TOP => StatusIndication::EndPosition(Direction::Open),
        RPS_END_BOTTOM => StatusIndication::EndPosition(Direction::Close),
        // A released rocker: the motor is no longer driven.
        _ if status & STATUS_NU == 0 => StatusIndication::Stopped {
            run_time: None,
            direction: None,
        },
        // Some other rocker press, e.g. a wall switch we do not model.
        _ => return Err(DecodeError::UnknownTelegramType(rorg)),
    };

    Ok(indication)
}

fn decode_4bs(payload: &[u8], destination: DeviceId) -> Result<TelegramKind, DecodeError> {
    let (db3, db2, db1, db0) = (payload[0], payload[1], payload[2], payload[3]);

    if db0 & DB0_DATA == 0 {
        return Ok(TelegramKind::TeachIn);
    }

    let tenths = u64::from(u16::from_be_bytes([db3, db2]));
    let run_time = Duration::from_millis(tenths * 100);

    if !destination.is_broadcast() {
        let kind = match db1 {
            0x00 => CommandKind::Stop,
            0x01 => CommandKind::Open,
            0x02 => CommandKind::Close,
            _ => return Err(DecodeError::MalformedFrame),
        };
        return Ok(TelegramKind::Command { kind, run_time });
    }

    let direction = match db1 {
        0x01 => Some(Direction::Open),
        0x02 => Some(Direction::Close),
        _ => None,
    };

    Ok(TelegramKind::Status(StatusIndication::Stopped {
        run_time: if tenths > 0 { Some(run_time) } else { None },
        direction,
    }))
}
