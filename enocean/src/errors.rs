use std::fmt::{self, Display};

use crate::{DecodeError, ReturnCode};

#[derive(Debug)]
pub enum ErrorKind {
    Decode(DecodeError),
    UnexpectedResponse,
    ResponseTimeout,
    Rejected(ReturnCode),
    Offline,
    SerialPort(tokio_serial::Error),
    Io(std::io::Error),
    ChannelError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Decode(error) => write!(f, "decode error: {}", error),
            ErrorKind::UnexpectedResponse => write!(f, "unexpected response"),
            ErrorKind::ResponseTimeout => write!(f, "no response from transceiver"),
            ErrorKind::Rejected(code) => write!(f, "transceiver rejected packet: {}", code),
            ErrorKind::Offline => write!(f, "gateway offline"),
            ErrorKind::SerialPort(error) => write!(f, "serial port error: {}", error),
            ErrorKind::Io(error) => write!(f, "IO error: {}", error),
            ErrorKind::ChannelError => write!(f, "channel error"),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enocean error: {}", self.kind)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(other: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io(other),
        }
    }
}

impl From<tokio_serial::Error> for Error {
    fn from(other: tokio_serial::Error) -> Self {
        Error {
            kind: ErrorKind::SerialPort(other),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(other: DecodeError) -> Self {
        Error {
            kind: ErrorKind::Decode(other),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
