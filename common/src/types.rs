#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    #[default]
    NetworkDown,
    BrokerDown,
    Running,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkDown => "NETWORK_DOWN",
            Self::BrokerDown => "BROKER_DOWN",
            Self::Running => "RUNNING",
        }
    }
}

/// One sensor sample. A failed channel reads as NaN; `humidity` is `None`
/// for sensors without a humidity channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity: Option<f32>,
}

impl Reading {
    pub fn temperature_only(temperature_c: f32) -> Self {
        Self {
            temperature_c,
            humidity: None,
        }
    }

    pub fn with_humidity(temperature_c: f32, humidity: f32) -> Self {
        Self {
            temperature_c,
            humidity: Some(humidity),
        }
    }

    pub fn valid_temperature(&self) -> Option<f32> {
        Some(self.temperature_c).filter(|value| value.is_finite())
    }

    pub fn valid_humidity(&self) -> Option<f32> {
        self.humidity.filter(|value| value.is_finite())
    }

    pub fn has_valid_field(&self) -> bool {
        self.valid_temperature().is_some() || self.valid_humidity().is_some()
    }
}
