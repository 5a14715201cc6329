//! In-memory stand-ins for the hardware links, shared by the unit tests.

use crate::{
    broker::{BrokerError, BrokerLink, ConnectOptions},
    config::{Config, ProvisioningSettings, WifiCredentials},
    network::{LinkError, PortalOutcome, WifiLink},
    sensor::SensorReader,
    store::{ConfigStore, StoreError},
    types::{ConnectionState, Reading},
};

pub fn sample_config() -> Config {
    Config::new(
        "X",
        "Y",
        1883,
        "sensors/den/humidity",
        "sensors/den/temperature",
        "device/X/status",
    )
    .unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub struct MockBroker {
    failures_left: u32,
    connected: bool,
    drop_on_poll: bool,
    connect_attempts: u32,
    publish_attempts: u32,
    polls: u32,
    last_options: Option<ConnectOptions>,
    published: Vec<Published>,
    events: Vec<String>,
}

impl MockBroker {
    /// Refuses the first `failures` connects, then accepts.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: failures,
            ..Self::default()
        }
    }

    pub fn fail_next(&mut self, failures: u32) {
        self.failures_left = failures;
    }

    pub fn drop_session(&mut self) {
        self.connected = false;
    }

    /// The next `poll` loses the session, as a broken socket would.
    pub fn drop_on_next_poll(&mut self) {
        self.drop_on_poll = true;
    }

    pub fn clear_published(&mut self) {
        self.published.clear();
        self.publish_attempts = 0;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn last_options(&self) -> Option<&ConnectOptions> {
        self.last_options.as_ref()
    }

    pub fn published(&self) -> &[Published] {
        &self.published
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }
}

impl BrokerLink for MockBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        self.connect_attempts += 1;
        self.last_options = Some(options.clone());
        if self.failures_left > 0 {
            self.failures_left -= 1;
            self.events.push("connect:refused".to_string());
            return Err(BrokerError::ConnectFailed {
                code: -2,
                detail: "connection refused".to_string(),
            });
        }
        self.connected = true;
        self.events.push("connect:ok".to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        self.publish_attempts += 1;
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        self.events.push(format!("publish:{topic}"));
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        self.polls += 1;
        if self.drop_on_poll {
            self.drop_on_poll = false;
            self.connected = false;
        }
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

/// WiFi link that reports `Connected` once `status` has been polled more
/// than `join_after` times since the last reset of the counter.
#[derive(Debug, Default)]
pub struct MockWifi {
    join_after: Option<u32>,
    polls: u32,
    begin_calls: u32,
    refused_begins: u32,
    portal_runs: u32,
    last_credentials: Option<WifiCredentials>,
    portal_config: Option<Config>,
    portal_credentials: Option<WifiCredentials>,
}

impl MockWifi {
    pub fn joining_after(polls: u32) -> Self {
        Self {
            join_after: Some(polls),
            ..Self::default()
        }
    }

    pub fn never_joining() -> Self {
        Self::default()
    }

    pub fn with_portal(config: Config) -> Self {
        Self {
            portal_config: Some(config),
            ..Self::default()
        }
    }

    pub fn set_portal_credentials(&mut self, credentials: WifiCredentials) {
        self.portal_credentials = Some(credentials);
    }

    /// Makes the next `count` calls to `begin` fail.
    pub fn refuse_begin(&mut self, count: u32) {
        self.refused_begins = count;
    }

    pub fn join_after(&mut self, polls: u32) {
        self.join_after = Some(polls);
        self.polls = 0;
    }

    pub fn drop_link(&mut self) {
        self.join_after = None;
        self.polls = 0;
    }

    pub fn begin_calls(&self) -> u32 {
        self.begin_calls
    }

    pub fn portal_runs(&self) -> u32 {
        self.portal_runs
    }

    pub fn last_credentials(&self) -> Option<WifiCredentials> {
        self.last_credentials.clone()
    }
}

impl WifiLink for MockWifi {
    fn begin(&mut self, credentials: Option<&WifiCredentials>) -> Result<(), LinkError> {
        self.begin_calls += 1;
        if self.refused_begins > 0 {
            self.refused_begins -= 1;
            return Err(LinkError::Join("ESP_ERR_WIFI_CONN".to_string()));
        }
        self.last_credentials = credentials.cloned();
        Ok(())
    }

    fn status(&mut self) -> ConnectionState {
        self.polls += 1;
        match self.join_after {
            Some(after) if self.polls > after => ConnectionState::Connected,
            Some(_) => ConnectionState::Connecting,
            None => ConnectionState::Disconnected,
        }
    }

    fn run_portal(
        &mut self,
        _settings: &ProvisioningSettings,
        _current: &Config,
    ) -> Result<PortalOutcome, LinkError> {
        self.portal_runs += 1;
        let config = self
            .portal_config
            .clone()
            .ok_or_else(|| LinkError::Portal("no submission scripted".to_string()))?;
        Ok(PortalOutcome {
            config,
            credentials: self.portal_credentials.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FixedSensor {
    reading: Reading,
    reads: u32,
}

impl FixedSensor {
    pub fn new(temperature_c: f32, humidity: Option<f32>) -> Self {
        Self {
            reading: Reading {
                temperature_c,
                humidity,
            },
            reads: 0,
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }
}

impl SensorReader for FixedSensor {
    fn read(&mut self) -> Reading {
        self.reads += 1;
        self.reading
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    stored: Option<Config>,
    corrupt: bool,
    read_only: bool,
}

impl MemoryStore {
    pub fn holding(config: Config) -> Self {
        Self {
            stored: Some(config),
            ..Self::default()
        }
    }

    pub fn corrupt() -> Self {
        Self {
            corrupt: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Option<&Config> {
        self.stored.as_ref()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Result<Option<Config>, StoreError> {
        if self.corrupt {
            return Err(StoreError::Backend("checksum mismatch".to_string()));
        }
        Ok(self.stored.clone())
    }

    fn save(&mut self, config: &Config) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Backend("filesystem is read-only".to_string()));
        }
        self.stored = Some(config.clone());
        Ok(())
    }
}
