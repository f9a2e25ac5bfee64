mod errors;
mod esp3;
mod gateway;
mod protocol;
mod radio;
mod telegram;
mod types;

#[macro_use]
extern crate log;

use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use tokio_serial::SerialPortBuilderExt;

pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::esp3::{crc8, split_frame, DecodeError, Packet};
pub use crate::gateway::Gateway;
pub use crate::protocol::{CommonCommand, PacketType, Response, ReturnCode};
pub use crate::radio::TelegramReader;
pub use crate::telegram::{
    command_packet, decode, decode_packet, encode_command, encode_teach_in, teach_in_packet,
    Telegram, TelegramKind, MAX_RUN_TIME,
};
pub use crate::types::{
    CommandKind, DeviceId, Direction, ParseDeviceIdError, StatusIndication,
};

/// ESP3 runs at a fixed rate on every USB300-style transceiver.
const BAUD: u32 = 57600;

pub fn open_tty<P>(path: P) -> Result<(Gateway, TelegramReader)>
where
    P: AsRef<Path>,
{
    let tty = tokio_serial::new(path.as_ref().to_string_lossy(), BAUD).open_native_async()?;

    let (reader, writer) = tokio::io::split(tty);
    Ok(Gateway::new(reader, writer))
}

pub trait ReadWire: Sized {
    fn read_wire<R>(r: &mut R) -> io::Result<Self>
    where
        R: Read;
}

pub trait WriteWire {
    fn wire_len(&self) -> u16;

    fn write_wire<W>(self, w: &mut W) -> io::Result<()>
    where
        W: Write;
}

impl ReadWire for u8 {
    fn read_wire<R>(r: &mut R) -> io::Result<Self>
    where
        R: Read,
    {
        r.read_u8()
    }
}

impl WriteWire for u8 {
    fn wire_len(&self) -> u16 {
        1
    }

    fn write_wire<W>(self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u8(self)
    }
}

impl ReadWire for u16 {
    fn read_wire<R>(r: &mut R) -> io::Result<Self>
    where
        R: Read,
    {
        r.read_u16::<BigEndian>()
    }
}

impl WriteWire for u16 {
    fn wire_len(&self) -> u16 {
        2
    }

    fn write_wire<W>(self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u16::<BigEndian>(self)
    }
}

impl ReadWire for u32 {
    fn read_wire<R>(r: &mut R) -> io::Result<Self>
    where
        R: Read,
    {
        r.read_u32::<BigEndian>()
    }
}

impl WriteWire for u32 {
    fn wire_len(&self) -> u16 {
        4
    }

    fn write_wire<W>(self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u32::<BigEndian>(self)
    }
}

pub trait ReadWireExt {
    fn read_wire<T>(&mut self) -> io::Result<T>
    where
        T: ReadWire;
}

impl<R> ReadWireExt for R
where
    R: Read,
{
    fn read_wire<T>(&mut self) -> io::Result<T>
    where
        T: ReadWire,
    {
        T::read_wire(self)
    }
}

pub trait WriteWireExt {
    fn write_wire<T>(&mut self, value: T) -> io::Result<()>
    where
        T: WriteWire;
}

impl<W> WriteWireExt for W
where
    W: Write,
{
    fn write_wire<T>(&mut self, value: T) -> io::Result<()>
    where
        T: WriteWire,
    {
        value.write_wire(self)
    }
}
