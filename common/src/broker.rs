use thiserror::Error;

use crate::{
    clock::Clock,
    config::Config,
    topics::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE},
    types::ConnectionState,
};

pub const RECONNECT_DELAY_MS: u32 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a link needs to open one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub last_will: LastWill,
}

impl ConnectOptions {
    pub fn for_config(config: &Config) -> Self {
        Self {
            client_id: config.host_name().to_string(),
            host: config.broker_host().to_string(),
            port: config.broker_port(),
            last_will: LastWill {
                topic: config.status_topic().to_string(),
                payload: PAYLOAD_OFFLINE.to_string(),
                qos: QoS::AtLeastOnce,
                retain: true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker or transport refused the session. `code` is the client
    /// library's status code, meaningful only to that library.
    #[error("broker connection failed (state {code}): {detail}")]
    ConnectFailed { code: i32, detail: String },
    #[error("not connected to broker")]
    NotConnected,
    #[error("publish to `{topic}` failed: {detail}")]
    PublishFailed { topic: String, detail: String },
    #[error("broker session dropped: {0}")]
    Dropped(String),
}

/// Transport to an MQTT broker. Implementations keep at most one session.
pub trait BrokerLink {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError>;
    /// Services inbound traffic and keepalive without blocking for long.
    fn poll(&mut self) -> Result<(), BrokerError>;
}

impl<T: BrokerLink + ?Sized> BrokerLink for Box<T> {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        (**self).connect(options)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        (**self).publish(topic, payload, retain)
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        (**self).poll()
    }
}

/// Keeps a broker session alive. Reconnects never give up: an unattended
/// node has nobody to escalate to.
#[derive(Debug)]
pub struct BrokerClient<L> {
    link: L,
    state: ConnectionState,
    reconnect_delay_ms: u32,
    attempts: u64,
}

impl<L: BrokerLink> BrokerClient<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: ConnectionState::Disconnected,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            attempts: 0,
        }
    }

    pub fn with_reconnect_delay(mut self, delay_ms: u32) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Total connect attempts since construction.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn is_connected(&mut self) -> bool {
        let connected = self.link.is_connected();
        if !connected && self.state == ConnectionState::Connected {
            log::warn!("mqtt connection lost");
            self.state = ConnectionState::Disconnected;
        }
        connected
    }

    /// Blocks until a session is up and `"online"` has been published
    /// retained to the status topic.
    pub fn ensure_connected<C>(&mut self, config: &Config, clock: &mut C)
    where
        C: Clock + ?Sized,
    {
        if self.state == ConnectionState::Connected && self.link.is_connected() {
            return;
        }

        let options = ConnectOptions::for_config(config);
        loop {
            self.state = ConnectionState::Connecting;
            self.attempts = self.attempts.saturating_add(1);
            log::debug!(
                "attempting mqtt connection to {}:{} as `{}`",
                options.host,
                options.port,
                options.client_id
            );

            match self.link.connect(&options) {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    log::info!("mqtt connected to {}:{}", options.host, options.port);
                    if let Err(err) = self.link.publish(config.status_topic(), PAYLOAD_ONLINE, true) {
                        log::warn!("failed to publish online status: {err}");
                    }
                    return;
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    log::warn!(
                        "{err}; retrying in {} seconds",
                        self.reconnect_delay_ms / 1000
                    );
                    clock.sleep_ms(self.reconnect_delay_ms);
                }
            }
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        self.link.publish(topic, payload, retain)
    }

    /// Drives the link's message pump. Errors mark the session as dropped.
    pub fn pump(&mut self) -> Result<(), BrokerError> {
        let result = self.link.poll();
        if let Err(err) = &result {
            log::warn!("mqtt poll error: {err}");
            self.state = ConnectionState::Disconnected;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        testing::{sample_config, MockBroker, Published},
    };

    #[test]
    fn retries_until_broker_accepts() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(3));

        client.ensure_connected(&config, &mut clock);

        assert_eq!(client.link().connect_attempts(), 4);
        assert_eq!(clock.sleeps(), &[5_000, 5_000, 5_000]);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(
            client.link().published(),
            &[Published {
                topic: "device/X/status".to_string(),
                payload: "online".to_string(),
                retain: true,
            }]
        );
    }

    #[test]
    fn first_try_success_does_not_sleep() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(0));

        client.ensure_connected(&config, &mut clock);

        assert_eq!(client.link().connect_attempts(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn online_is_published_right_after_connect() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(2));

        client.ensure_connected(&config, &mut clock);

        let log = client.link().events();
        let connected_at = log.iter().position(|e| e == "connect:ok").unwrap();
        assert_eq!(log[connected_at + 1], "publish:device/X/status");
    }

    #[test]
    fn connect_uses_host_name_and_offline_last_will() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(0));

        client.ensure_connected(&config, &mut clock);

        let options = client.link().last_options().unwrap();
        assert_eq!(options.client_id, "X");
        assert_eq!(
            options.last_will,
            LastWill {
                topic: "device/X/status".to_string(),
                payload: "offline".to_string(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }
        );
    }

    #[test]
    fn already_connected_skips_reconnect() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(0));

        client.ensure_connected(&config, &mut clock);
        client.ensure_connected(&config, &mut clock);

        assert_eq!(client.link().connect_attempts(), 1);
    }

    #[test]
    fn dropped_link_is_noticed() {
        let config = sample_config();
        let mut clock = ManualClock::default();
        let mut client = BrokerClient::new(MockBroker::failing(0));
        client.ensure_connected(&config, &mut clock);

        client.link_mut().drop_session();

        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
