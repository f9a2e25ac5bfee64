use std::fmt::{self, Display};
use std::io::{self, Cursor};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::{ReadWireExt, Result, WriteWireExt};

const SYNC: u8 = 0x55;
const HEADER_LEN: usize = 4;
/// Sync byte, header and header CRC.
const PREAMBLE_LEN: usize = 1 + HEADER_LEN + 1;
/// No ESP3 packet a transceiver emits comes close to this. A larger length in a header that
/// passed its CRC is noise, not a frame worth waiting for.
const MAX_DATA_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    MalformedFrame,
    ChecksumMismatch,
    UnknownPacketType(u8),
    UnknownTelegramType(u8),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MalformedFrame => write!(f, "malformed frame"),
            DecodeError::ChecksumMismatch => write!(f, "checksum mismatch"),
            DecodeError::UnknownPacketType(packet_type) => {
                write!(f, "unknown packet type: {:#04x}", packet_type)
            }
            DecodeError::UnknownTelegramType(rorg) => {
                write!(f, "unknown telegram type (RORG {:#04x})", rorg)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        // Reads only ever come from in-memory frames, so any IO error means we ran off the end.
        DecodeError::MalformedFrame
    }
}

/// A single ESP3 packet: type, data and optional data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub packet_type: u8,
    pub data: Vec<u8>,
    pub optional: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: u8, data: Vec<u8>, optional: Vec<u8>) -> Self {
        Self {
            packet_type,
            data,
            optional,
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        // Writing to a Vec cannot fail.
        let _ = header.write_wire(self.data.len() as u16);
        let _ = header.write_wire(self.optional.len() as u8);
        let _ = header.write_wire(self.packet_type);

        let mut frame =
            Vec::with_capacity(PREAMBLE_LEN + self.data.len() + self.optional.len() + 1);
        frame.push(SYNC);
        frame.extend(&header);
        frame.push(crc8(&header));
        frame.extend(&self.data);
        frame.extend(&self.optional);
        frame.push(crc8(&frame[PREAMBLE_LEN..]));
        frame
    }

    /// Parses exactly one complete frame, validating both checksums.
    pub fn from_frame(frame: &[u8]) -> std::result::Result<Self, DecodeError> {
        if frame.len() < PREAMBLE_LEN + 1 || frame[0] != SYNC {
            return Err(DecodeError::MalformedFrame);
        }

        let header = &frame[1..1 + HEADER_LEN];
        if crc8(header) != frame[1 + HEADER_LEN] {
            return Err(DecodeError::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(header);
        let data_len: u16 = cursor.read_wire()?;
        let optional_len: u8 = cursor.read_wire()?;
        let packet_type: u8 = cursor.read_wire()?;

        let data_end = PREAMBLE_LEN + usize::from(data_len);
        let optional_end = data_end + usize::from(optional_len);
        if frame.len() != optional_end + 1 {
            return Err(DecodeError::MalformedFrame);
        }

        if crc8(&frame[PREAMBLE_LEN..optional_end]) != frame[optional_end] {
            return Err(DecodeError::ChecksumMismatch);
        }

        Ok(Self {
            packet_type,
            data: frame[PREAMBLE_LEN..data_end].to_vec(),
            optional: frame[data_end..optional_end].to_vec(),
        })
    }
}

/// Pulls the next frame off the front of `buffer`.
///
/// Returns `None` when more bytes are needed. Garbage before a sync byte is discarded. A header
/// that fails its CRC costs only its sync byte, so the next call resynchronises on whatever sync
/// byte follows; a frame whose data fails its CRC is dropped whole.
pub fn split_frame(buffer: &mut Vec<u8>) -> Option<std::result::Result<Vec<u8>, DecodeError>> {
    match buffer.iter().position(|byte| *byte == SYNC) {
        Some(start) => {
            buffer.drain(..start);
        }
        None => {
            buffer.clear();
            return None;
        }
    }

    if buffer.len() < PREAMBLE_LEN {
        return None;
    }

    let header = &buffer[1..1 + HEADER_LEN];
    if crc8(header) != buffer[1 + HEADER_LEN] {
        buffer.drain(..1);
        return Some(Err(DecodeError::ChecksumMismatch));
    }

    let data_len = usize::from(u16::from_be_bytes([header[0], header[1]]));
    let optional_len = usize::from(header[2]);
    if data_len > MAX_DATA_LEN {
        buffer.drain(..1);
        return Some(Err(DecodeError::MalformedFrame));
    }

    let frame_len = PREAMBLE_LEN + data_len + optional_len + 1;
    if buffer.len() < frame_len {
        return None;
    }

    let frame = buffer.drain(..frame_len).collect::<Vec<_>>();
    if crc8(&frame[PREAMBLE_LEN..frame_len - 1]) != frame[frame_len - 1] {
        return Some(Err(DecodeError::ChecksumMismatch));
    }

    Some(Ok(frame))
}

/// CRC-8 with polynomial 0x07, as used for both ESP3 checksums.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= *byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub struct Reader<R>
where
    R: AsyncRead + Unpin,
{
    inner: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(read: R) -> Self {
        Self {
            inner: BufReader::new(read),
            buffer: Vec::new(),
        }
    }

    /// Reads the next frame.
    ///
    /// The outer `Result` carries IO failures, which end the stream. The inner one carries
    /// recoverable framing errors; the reader has already resynchronised when it returns one.
    pub async fn read_frame(&mut self) -> Result<std::result::Result<Vec<u8>, DecodeError>> {
        loop {
            if let Some(frame) = split_frame(&mut self.buffer) {
                return Ok(frame);
            }

            let mut chunk = [0; 64];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

pub struct Writer<W>
where
    W: AsyncWrite + Unpin,
{
    inner: BufWriter<W>,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(write: W) -> Self {
        Self {
            inner: BufWriter::new(write),
        }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.inner.write_all(&packet.to_frame()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_id_base() -> Packet {
        Packet::new(0x05, vec![0x08], vec![])
    }

    #[test]
    fn crc8_matches_reference_values() {
        // CO_RD_IDBASE, as sent by the vendor tools.
        assert_eq!(
            read_id_base().to_frame(),
            vec![0x55, 0x00, 0x01, 0x00, 0x05, 0x70, 0x08, 0x38]
        );
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn frames_parse_back_into_packets() {
        let packet = Packet::new(0x01, vec![0xF6, 0x70, 1, 2, 3, 4, 0x30], vec![0x01, 0xFF]);
        assert_eq!(Packet::from_frame(&packet.to_frame()), Ok(packet));
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        let mut frame = read_id_base().to_frame();
        frame[6] ^= 0xFF;
        assert_eq!(
            Packet::from_frame(&frame),
            Err(DecodeError::ChecksumMismatch)
        );

        let frame = read_id_base().to_frame();
        assert_eq!(
            Packet::from_frame(&frame[..frame.len() - 1]),
            Err(DecodeError::MalformedFrame)
        );
        assert_eq!(Packet::from_frame(&[0x55]), Err(DecodeError::MalformedFrame));
    }

    #[test]
    fn split_frame_waits_for_complete_frames() {
        let frame = read_id_base().to_frame();
        let mut buffer = frame[..4].to_vec();
        assert_eq!(split_frame(&mut buffer), None);

        buffer.extend_from_slice(&frame[4..]);
        assert_eq!(split_frame(&mut buffer), Some(Ok(frame)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn split_frame_skips_noise_and_resynchronises() {
        let frame = read_id_base().to_frame();

        // Leading garbage, then a sync byte with a broken header, then a real frame.
        let mut buffer = vec![0x00, 0x12, 0x55, 0x00, 0x07, 0x00, 0x01, 0x00];
        buffer.extend_from_slice(&frame);

        assert_eq!(
            split_frame(&mut buffer),
            Some(Err(DecodeError::ChecksumMismatch))
        );
        assert_eq!(split_frame(&mut buffer), Some(Ok(frame)));
        assert_eq!(split_frame(&mut buffer), None);
    }

    #[test]
    fn split_frame_drops_frames_with_bad_data_crc() {
        let good = read_id_base().to_frame();
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;

        let mut buffer = bad;
        buffer.extend_from_slice(&good);

        assert_eq!(
            split_frame(&mut buffer),
            Some(Err(DecodeError::ChecksumMismatch))
        );
        assert_eq!(split_frame(&mut buffer), Some(Ok(good)));
    }

    #[tokio::test]
    async fn reader_recovers_from_corruption_mid_stream() {
        let good = read_id_base().to_frame();
        let mut stream = vec![0x55, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        stream.extend_from_slice(&good);

        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&stream).await.unwrap();
        drop(tx);

        let mut reader = Reader::new(rx);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Err(DecodeError::ChecksumMismatch)
        );
        assert_eq!(reader.read_frame().await.unwrap(), Ok(good));
        assert!(reader.read_frame().await.is_err());
    }
}
