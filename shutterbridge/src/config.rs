use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use enocean::{DeviceId, ParseDeviceIdError};
use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, error: io::Error },
    Yaml(serde_yaml::Error),
    NoShutters,
    InvalidDeviceId {
        shutter: String,
        error: ParseDeviceIdError,
    },
    DuplicateDeviceId {
        first: String,
        second: String,
        id: DeviceId,
    },
    InvalidTravelTime {
        shutter: String,
        field: &'static str,
        value: f64,
    },
    SenderOffsetOutOfRange {
        shutter: String,
        offset: i64,
    },
    SenderOffsetCollision {
        first: String,
        second: String,
        offset: u8,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, error } => {
                write!(f, "cannot read config file {}: {}", path.display(), error)
            }
            ConfigError::Yaml(error) => write!(f, "invalid config: {}", error),
            ConfigError::NoShutters => write!(f, "no shutters defined in config"),
            ConfigError::InvalidDeviceId { shutter, error } => {
                write!(f, "shutter {:?}: {}", shutter, error)
            }
            ConfigError::DuplicateDeviceId { first, second, id } => write!(
                f,
                "shutters {:?} and {:?} both have device ID {}",
                first, second, id
            ),
            ConfigError::InvalidTravelTime {
                shutter,
                field,
                value,
            } => write!(
                f,
                "shutter {:?}: {} must be a positive number of seconds, got {}",
                shutter, field, value
            ),
            ConfigError::SenderOffsetOutOfRange { shutter, offset } => write!(
                f,
                "shutter {:?}: sender_offset {} is out of range, it must be between 0 and {}",
                shutter,
                offset,
                crate::sender::MAX_SENDER_OFFSET
            ),
            ConfigError::SenderOffsetCollision {
                first,
                second,
                offset,
            } => write!(
                f,
                "sender offset collision: shutters {:?} and {:?} both use offset {}. \
                 Set sender_offset on one of them to resolve this",
                first, second, offset
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_yaml::Error> for ConfigError {
    fn from(other: serde_yaml::Error) -> Self {
        ConfigError::Yaml(other)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EnOceanConfig {
    pub port: String,
}

impl Default for EnOceanConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Prefix of every topic the bridge uses.
    pub base_topic: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            base_topic: "enocean".to_string(),
            client_id: "shutter-control".to_string(),
        }
    }
}

/// Static configuration of one FSB61NP actuator.
#[derive(Clone, Debug, PartialEq)]
pub struct ShutterConfig {
    pub device_id: DeviceId,
    pub name: String,
    /// Time to travel from fully open to fully closed.
    pub full_close_time: Duration,
    /// Time to travel from fully closed to fully open.
    pub full_open_time: Duration,
    pub sender_offset: Option<u8>,
    /// The motor is wired so that "up" closes the shutter.
    pub invert_direction: bool,
}

impl ShutterConfig {
    /// Identifier used in MQTT topics.
    pub fn topic_id(&self) -> String {
        self.device_id.compact()
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub enocean: EnOceanConfig,
    pub mqtt: MqttConfig,
    pub shutters: Vec<ShutterConfig>,
    pub position_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    enocean: EnOceanConfig,
    #[serde(default)]
    mqtt: MqttConfig,
    #[serde(default)]
    shutters: Vec<RawShutter>,
    #[serde(default = "default_position_file")]
    position_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawShutter {
    id: String,
    name: String,
    #[serde(default = "default_full_close_time")]
    full_close_time: f64,
    #[serde(default = "default_full_open_time")]
    full_open_time: f64,
    #[serde(default)]
    sender_offset: Option<i64>,
    #[serde(default)]
    invert_direction: bool,
}

fn default_position_file() -> PathBuf {
    PathBuf::from("positions.json")
}

fn default_full_close_time() -> f64 {
    25.0
}

fn default_full_open_time() -> f64 {
    23.0
}

fn travel_time(shutter: &str, field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::InvalidTravelTime {
            shutter: shutter.to_string(),
            field,
            value,
        }),
    }
}

impl TryFrom<RawShutter> for ShutterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawShutter) -> Result<Self, ConfigError> {
        let device_id =
            raw.id
                .parse()
                .map_err(|error| ConfigError::InvalidDeviceId {
                    shutter: raw.name.clone(),
                    error,
                })?;

        let sender_offset = match raw.sender_offset {
            None => None,
            Some(offset) if (0..=i64::from(crate::sender::MAX_SENDER_OFFSET)).contains(&offset) => {
                Some(offset as u8)
            }
            Some(offset) => {
                return Err(ConfigError::SenderOffsetOutOfRange {
                    shutter: raw.name,
                    offset,
                })
            }
        };

        Ok(Self {
            device_id,
            full_close_time: travel_time(&raw.name, "full_close_time", raw.full_close_time)?,
            full_open_time: travel_time(&raw.name, "full_open_time", raw.full_open_time)?,
            name: raw.name,
            sender_offset,
            invert_direction: raw.invert_direction,
        })
    }
}

pub fn load<P>(path: P) -> Result<AppConfig, ConfigError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
        path: path.to_path_buf(),
        error,
    })?;
    parse(&yaml)
}

pub fn parse(yaml: &str) -> Result<AppConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml)?;

    let shutters = raw
        .shutters
        .into_iter()
        .map(ShutterConfig::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    if shutters.is_empty() {
        return Err(ConfigError::NoShutters);
    }

    let mut seen: HashMap<DeviceId, &ShutterConfig> = HashMap::new();
    for shutter in &shutters {
        if let Some(first) = seen.insert(shutter.device_id, shutter) {
            return Err(ConfigError::DuplicateDeviceId {
                first: first.name.clone(),
                second: shutter.name.clone(),
                id: shutter.device_id,
            });
        }
    }

    Ok(AppConfig {
        enocean: raw.enocean,
        mqtt: raw.mqtt,
        shutters,
        position_file: raw.position_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
enocean:
  port: /dev/ttyUSB1
mqtt:
  host: broker.local
  port: 8883
  username: bridge
  password: secret
  base_topic: home
position_file: /data/positions.json
shutters:
  - id: "05:12:34:56"
    name: Living Room
    full_close_time: 25
    full_open_time: 22.5
  - id: "05:12:34:57"
    name: Bedroom
    sender_offset: 3
    invert_direction: true
"#;

    #[test]
    fn parses_full_config() {
        let config = parse(FULL).unwrap();

        assert_eq!(config.enocean.port, "/dev/ttyUSB1");
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.base_topic, "home");
        assert_eq!(config.mqtt.client_id, "shutter-control");
        assert_eq!(config.position_file, PathBuf::from("/data/positions.json"));

        let living_room = &config.shutters[0];
        assert_eq!(living_room.device_id, DeviceId(0x0512_3456));
        assert_eq!(living_room.topic_id(), "05123456");
        assert_eq!(living_room.full_close_time, Duration::from_secs(25));
        assert_eq!(living_room.full_open_time, Duration::from_millis(22_500));
        assert_eq!(living_room.sender_offset, None);
        assert!(!living_room.invert_direction);

        let bedroom = &config.shutters[1];
        assert_eq!(bedroom.full_close_time, Duration::from_secs(25));
        assert_eq!(bedroom.full_open_time, Duration::from_secs(23));
        assert_eq!(bedroom.sender_offset, Some(3));
        assert!(bedroom.invert_direction);
    }

    #[test]
    fn applies_defaults() {
        let config = parse("shutters:\n  - id: 01:02:03:04\n    name: Office\n").unwrap();

        assert_eq!(config.enocean.port, "/dev/ttyUSB0");
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "enocean");
        assert_eq!(config.position_file, PathBuf::from("positions.json"));
    }

    #[test]
    fn requires_shutters() {
        assert!(matches!(parse("mqtt:\n  host: x\n"), Err(ConfigError::NoShutters)));
    }

    #[test]
    fn missing_name_is_an_error() {
        let error = parse("shutters:\n  - id: 01:02:03:04\n").unwrap_err();
        assert!(matches!(error, ConfigError::Yaml(_)));
        assert!(error.to_string().contains("name"));
    }

    #[test]
    fn rejects_bad_shutter_fields() {
        let error = parse("shutters:\n  - id: 01:02:03\n    name: Office\n").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidDeviceId { ref shutter, .. } if shutter == "Office"));

        let error = parse(
            "shutters:\n  - id: 01:02:03:04\n    name: Office\n    full_open_time: 0\n",
        )
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::InvalidTravelTime {
                field: "full_open_time",
                ..
            }
        ));

        let error = parse(
            "shutters:\n  - id: 01:02:03:04\n    name: Office\n    sender_offset: 128\n",
        )
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::SenderOffsetOutOfRange { offset: 128, .. }
        ));
        assert!(error.to_string().contains("Office"));
    }

    #[test]
    fn rejects_travel_times_a_duration_cannot_hold() {
        for value in ["1.0e20", "0.000000000001", "-3.0", ".nan"] {
            let yaml = format!(
                "shutters:\n  - id: 01:02:03:04\n    name: Office\n    full_close_time: {}\n",
                value
            );
            let error = parse(&yaml).unwrap_err();
            assert!(
                matches!(
                    error,
                    ConfigError::InvalidTravelTime {
                        field: "full_close_time",
                        ..
                    }
                ),
                "{} was accepted",
                value
            );
        }
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let error = parse(
            "shutters:\n  - id: 01:02:03:04\n    name: A\n  - id: 01:02:03:04\n    name: B\n",
        )
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::DuplicateDeviceId { ref first, ref second, .. } if first == "A" && second == "B"
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        assert!(matches!(load(&path), Err(ConfigError::Io { .. })));

        std::fs::write(&path, FULL).unwrap();
        assert_eq!(load(&path).unwrap().shutters.len(), 2);
    }
}
