use std::fmt::{self, Display};
use std::io;

use enocean::DeviceId;
use tokio::sync::oneshot;

use crate::config::ConfigError;

#[derive(Debug)]
pub enum ErrorKind {
    EnOcean(enocean::Error),
    Config(ConfigError),
    Mqtt(rumqttc::ClientError),
    Json(serde_json::Error),
    Io(io::Error),
    UnknownShutter(DeviceId),
    ChannelError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::EnOcean(error) => write!(f, "{}", error),
            ErrorKind::Config(error) => write!(f, "{}", error),
            ErrorKind::Mqtt(error) => write!(f, "mqtt: {}", error),
            ErrorKind::Json(error) => write!(f, "json: {}", error),
            ErrorKind::Io(error) => write!(f, "io: {}", error),
            ErrorKind::UnknownShutter(id) => write!(f, "no shutter configured with ID {}", id),
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
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

impl From<enocean::Error> for Error {
    fn from(other: enocean::Error) -> Self {
        Error {
            kind: ErrorKind::EnOcean(other),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(other: ConfigError) -> Self {
        Error {
            kind: ErrorKind::Config(other),
        }
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(other: rumqttc::ClientError) -> Self {
        Error {
            kind: ErrorKind::Mqtt(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(other: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Json(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Error {
            kind: ErrorKind::Io(other),
        }
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Error {
        Error {
            kind: ErrorKind::ChannelError,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
