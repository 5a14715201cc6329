use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics;

/// Longest value accepted for any string field of [`Config`].
pub const MAX_FIELD_LEN: usize = 40;

pub const DEFAULT_HOST_NAME: &str = "bedroomTemp";
pub const DEFAULT_ROOM: &str = "bedroom";
pub const DEFAULT_BROKER_HOST: &str = "192.168.1.2";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_MEASUREMENT_INTERVAL_MS: u32 = 30_000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u32 = 180_000;

pub const PROVISIONING_AP_SSID: &str = "SimpleWeather-AP";
pub const PROVISIONING_AP_PASSWORD: &str = "WeatherSetup";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} is {len} bytes, limit is {max}", max = MAX_FIELD_LEN)]
    TooLong { field: &'static str, len: usize },
    #[error("mqtt_port must be between 1 and 65535, got `{0}`")]
    InvalidPort(String),
}

/// Broker and topic settings of one node. Every string field is non-empty
/// and at most [`MAX_FIELD_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    host_name: String,
    broker_host: String,
    broker_port: u16,
    humidity_topic: String,
    temperature_topic: String,
    status_topic: String,
}

impl Config {
    pub fn new(
        host_name: impl Into<String>,
        broker_host: impl Into<String>,
        broker_port: u16,
        humidity_topic: impl Into<String>,
        temperature_topic: impl Into<String>,
        status_topic: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if broker_port == 0 {
            return Err(ConfigError::InvalidPort(broker_port.to_string()));
        }

        Ok(Self {
            host_name: checked_field("hostName", host_name.into())?,
            broker_host: checked_field("mqtt_server", broker_host.into())?,
            broker_port,
            humidity_topic: checked_field("humidityTopic", humidity_topic.into())?,
            temperature_topic: checked_field("temperatureTopic", temperature_topic.into())?,
            status_topic: checked_field("statusTopic", status_topic.into())?,
        })
    }

    /// Compiled-in configuration. Build-time environment variables override
    /// the constants; values that fail validation fall back to them.
    pub fn compiled_defaults() -> Self {
        let host_name = option_env!("SIMPLEWEATHER_HOST_NAME").unwrap_or(DEFAULT_HOST_NAME);
        let room = option_env!("SIMPLEWEATHER_ROOM").unwrap_or(DEFAULT_ROOM);
        let broker_host = option_env!("MQTT_HOST").unwrap_or(DEFAULT_BROKER_HOST);
        let broker_port = option_env!("MQTT_PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_BROKER_PORT);

        Self::for_room(host_name, room, broker_host, broker_port).unwrap_or_else(|err| {
            log::warn!("invalid compiled-in config ({err}); using built-in constants");
            Self::fallback()
        })
    }

    /// Builds a config using the default topic layout for `room`.
    pub fn for_room(
        host_name: &str,
        room: &str,
        broker_host: &str,
        broker_port: u16,
    ) -> Result<Self, ConfigError> {
        Self::new(
            host_name,
            broker_host,
            broker_port,
            topics::humidity_topic(room),
            topics::temperature_topic(room),
            topics::status_topic(host_name),
        )
    }

    fn fallback() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            humidity_topic: topics::humidity_topic(DEFAULT_ROOM),
            temperature_topic: topics::temperature_topic(DEFAULT_ROOM),
            status_topic: topics::status_topic(DEFAULT_HOST_NAME),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn broker_host(&self) -> &str {
        &self.broker_host
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn humidity_topic(&self) -> &str {
        &self.humidity_topic
    }

    pub fn temperature_topic(&self) -> &str {
        &self.temperature_topic
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    pub fn to_persisted(&self) -> PersistedConfig {
        PersistedConfig {
            mqtt_server: self.broker_host.clone(),
            mqtt_port: self.broker_port.to_string(),
            host_name: self.host_name.clone(),
            humidity_topic: self.humidity_topic.clone(),
            temperature_topic: self.temperature_topic.clone(),
            status_topic: Some(self.status_topic.clone()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::compiled_defaults()
    }
}

fn checked_field(field: &'static str, value: String) -> Result<String, ConfigError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(ConfigError::TooLong {
            field,
            len: value.len(),
        });
    }
    Ok(value)
}

/// JSON layout of the stored config file. All values are strings, the port
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub mqtt_server: String,
    pub mqtt_port: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "humidityTopic")]
    pub humidity_topic: String,
    #[serde(rename = "temperatureTopic")]
    pub temperature_topic: String,
    #[serde(rename = "statusTopic", default, skip_serializing_if = "Option::is_none")]
    pub status_topic: Option<String>,
}

impl TryFrom<PersistedConfig> for Config {
    type Error = ConfigError;

    fn try_from(persisted: PersistedConfig) -> Result<Self, Self::Error> {
        let port_text = persisted.mqtt_port.trim();
        let broker_port = port_text
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port_text.to_string()))?;

        let status_topic = match persisted.status_topic {
            Some(topic) if !topic.trim().is_empty() => topic,
            _ => topics::status_topic(persisted.host_name.trim()),
        };

        Config::new(
            persisted.host_name,
            persisted.mqtt_server,
            broker_port,
            persisted.humidity_topic,
            persisted.temperature_topic,
            status_topic,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    /// Credentials baked in at build time. `None` when no SSID was supplied.
    pub fn compiled() -> Option<Self> {
        let ssid = option_env!("WIFI_SSID").unwrap_or_default();
        if ssid.trim().is_empty() {
            return None;
        }
        Some(Self {
            ssid: ssid.to_string(),
            password: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Dht11,
    Ds18b20,
    Simulated,
}

impl SensorKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dht11" | "dht" => Some(Self::Dht11),
            "ds18b20" | "onewire" => Some(Self::Ds18b20),
            "simulated" | "sim" => Some(Self::Simulated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dht11 => "dht11",
            Self::Ds18b20 => "ds18b20",
            Self::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSettings {
    pub ap_ssid: String,
    pub ap_password: String,
    pub join_timeout_ms: u32,
    /// Forces the portal on this boot even when a stored config exists.
    pub reset_config: bool,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            ap_ssid: PROVISIONING_AP_SSID.to_string(),
            ap_password: PROVISIONING_AP_PASSWORD.to_string(),
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            reset_config: option_env!("SIMPLEWEATHER_RESET_CONFIG")
                .map(parse_flag)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// Join with fixed credentials and wait as long as it takes.
    Direct(Option<WifiCredentials>),
    /// Stored config with a first-run captive portal.
    Provisioning(ProvisioningSettings),
}

impl NetworkMode {
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub measurement_interval_ms: u32,
    pub retain_readings: bool,
    pub network: NetworkMode,
    pub sensor: SensorKind,
    pub debug: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        let network = match option_env!("SIMPLEWEATHER_NETWORK_MODE") {
            Some(mode) if mode.eq_ignore_ascii_case("provisioning") => {
                NetworkMode::Provisioning(ProvisioningSettings::default())
            }
            _ => NetworkMode::Direct(WifiCredentials::compiled()),
        };

        Self {
            measurement_interval_ms: option_env!("SIMPLEWEATHER_INTERVAL_MS")
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(DEFAULT_MEASUREMENT_INTERVAL_MS),
            retain_readings: option_env!("SIMPLEWEATHER_RETAIN")
                .map(parse_flag)
                .unwrap_or(false),
            network,
            sensor: option_env!("SIMPLEWEATHER_SENSOR")
                .and_then(SensorKind::parse)
                .unwrap_or(SensorKind::Ds18b20),
            debug: option_env!("SIMPLEWEATHER_DEBUG")
                .map(parse_flag)
                .unwrap_or(false),
        }
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
