//! Routes MQTT commands and radio telegrams to the dispatcher.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use enocean::{DeviceId, Telegram, TelegramKind, TelegramReader};
use futures::StreamExt;

use crate::config::ShutterConfig;
use crate::dispatcher::{Command, Dispatcher};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

const DISCOVERY_PREFIX: &str = "homeassistant";

/// Topic layout under the configured prefix. Shutters are identified by their compact device ID.
#[derive(Clone, Debug)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new<S>(prefix: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn cover(&self, id: DeviceId, leaf: &str) -> String {
        format!("{}/cover/{}/{}", self.prefix, id.compact(), leaf)
    }

    pub fn set(&self, id: DeviceId) -> String {
        self.cover(id, "set")
    }

    pub fn set_position(&self, id: DeviceId) -> String {
        self.cover(id, "set_position")
    }

    pub fn teach_in(&self, id: DeviceId) -> String {
        self.cover(id, "teach_in")
    }

    pub fn state(&self, id: DeviceId) -> String {
        self.cover(id, "state")
    }

    pub fn position(&self, id: DeviceId) -> String {
        self.cover(id, "position")
    }

    pub fn available(&self, id: DeviceId) -> String {
        self.cover(id, "available")
    }

    /// Carries the MQTT last will.
    pub fn bridge_available(&self) -> String {
        format!("{}/bridge/available", self.prefix)
    }

    pub fn discovery(&self, id: DeviceId) -> String {
        format!("{}/cover/{}/config", DISCOVERY_PREFIX, id.compact())
    }

    /// The command topics of one shutter.
    pub fn commands(&self, id: DeviceId) -> [String; 3] {
        [self.set(id), self.set_position(id), self.teach_in(id)]
    }

    /// Splits `<prefix>/cover/<id>/<action>` into its ID and action.
    pub fn parse<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = topic.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix("/cover/")?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(action), None) if !id.is_empty() => Some((id, action)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParseCommandError {
    UnknownAction(String),
    InvalidPayload { action: String, payload: String },
}

impl Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCommandError::UnknownAction(action) => write!(f, "unknown action {:?}", action),
            ParseCommandError::InvalidPayload { action, payload } => {
                write!(f, "invalid payload {:?} for {}", payload, action)
            }
        }
    }
}

impl std::error::Error for ParseCommandError {}

pub fn parse_command(action: &str, payload: &[u8]) -> Result<Command, ParseCommandError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    let invalid = || ParseCommandError::InvalidPayload {
        action: action.to_string(),
        payload: text.to_string(),
    };

    match action {
        "set" => match text.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Command::Open),
            "CLOSE" => Ok(Command::Close),
            "STOP" => Ok(Command::Stop),
            _ => Err(invalid()),
        },
        "set_position" => match text.parse::<f64>() {
            Ok(target) if target.is_finite() => Ok(Command::SetPosition(target.clamp(0.0, 100.0))),
            _ => Err(invalid()),
        },
        "teach_in" => Ok(Command::TeachIn),
        _ => Err(ParseCommandError::UnknownAction(action.to_string())),
    }
}

pub struct Bridge {
    topics: Topics,
    dispatcher: Dispatcher,
    /// Compact ID to device ID and name.
    shutters: HashMap<String, (DeviceId, String)>,
}

impl Bridge {
    pub fn new(topics: Topics, dispatcher: Dispatcher, shutters: &[ShutterConfig]) -> Self {
        let shutters = shutters
            .iter()
            .map(|shutter| {
                (
                    shutter.topic_id(),
                    (shutter.device_id, shutter.name.clone()),
                )
            })
            .collect();

        Self {
            topics,
            dispatcher,
            shutters,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handles one inbound MQTT message. Bad messages are logged and dropped.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        debug!("mqtt: {} = {:?}", topic, String::from_utf8_lossy(payload));

        let (id, action) = match self.topics.parse(topic) {
            Some(parsed) => parsed,
            None => return,
        };
        let (device_id, name) = match self.shutters.get(&id.to_ascii_lowercase()) {
            Some(shutter) => shutter,
            None => {
                warn!("mqtt: {} is not a configured shutter", id);
                return;
            }
        };

        let command = match parse_command(action, payload) {
            Ok(command) => command,
            Err(ParseCommandError::UnknownAction(_)) => return,
            Err(error) => {
                warn!("{}: {}", name, error);
                return;
            }
        };

        if let Err(error) = self.dispatcher.submit(*device_id, command).await {
            error!("{}: could not submit {}: {}", name, command, error);
        }
    }

    /// Handles one telegram from the radio.
    pub async fn handle_telegram(&self, telegram: Telegram) {
        let configured = self.dispatcher.contains(telegram.sender);

        match telegram.kind {
            TelegramKind::Status(status) if configured => {
                if let Err(error) = self.dispatcher.status(telegram.sender, status).await {
                    error!("status from {}: {}", telegram.sender, error);
                }
            }
            TelegramKind::Status(status) => {
                info!(
                    "discovered device {} (status {:?}). Add it to the config to control it",
                    telegram.sender, status
                );
            }
            TelegramKind::TeachIn if configured => {
                debug!("teach-in telegram from configured shutter {}", telegram.sender);
            }
            TelegramKind::TeachIn => {
                info!("discovered device {} (teach-in request)", telegram.sender);
            }
            TelegramKind::Command { kind, run_time } => {
                debug!(
                    "{} for {:?} from {} to {}, not ours",
                    kind, run_time, telegram.sender, telegram.destination
                );
            }
        }
    }
}

/// Feeds every received telegram to the bridge, until the gateway goes away.
pub async fn route_telegrams(bridge: Arc<Bridge>, mut telegrams: TelegramReader) {
    while let Some(telegram) = telegrams.next().await {
        bridge.handle_telegram(telegram).await;
    }
    debug!("telegram stream ended");
}
