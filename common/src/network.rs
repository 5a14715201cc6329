use thiserror::Error;

use crate::{
    clock::{wait_until, Clock},
    config::{Config, NetworkMode, ProvisioningSettings, WifiCredentials},
    store::{ConfigStore, StoreError},
    types::ConnectionState,
};

pub const JOIN_POLL_MS: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("wifi join failed: {0}")]
    Join(String),
    #[error("captive portal failed: {0}")]
    Portal(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Link(#[from] LinkError),
    /// The join did not complete in time; the device must be reset.
    #[error("wifi join did not complete within {timeout_ms} ms")]
    JoinTimeout { timeout_ms: u32 },
}

/// What the captive portal collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalOutcome {
    pub config: Config,
    pub credentials: Option<WifiCredentials>,
}

/// Station-mode WiFi plus the first-run access point.
pub trait WifiLink {
    /// Starts joining. `None` reuses whatever credentials the link remembers.
    fn begin(&mut self, credentials: Option<&WifiCredentials>) -> Result<(), LinkError>;
    fn status(&mut self) -> ConnectionState;
    /// Runs the captive portal until the user submits a valid form. `current`
    /// pre-fills the form.
    fn run_portal(
        &mut self,
        settings: &ProvisioningSettings,
        current: &Config,
    ) -> Result<PortalOutcome, LinkError>;
}

impl<T: WifiLink + ?Sized> WifiLink for Box<T> {
    fn begin(&mut self, credentials: Option<&WifiCredentials>) -> Result<(), LinkError> {
        (**self).begin(credentials)
    }

    fn status(&mut self) -> ConnectionState {
        (**self).status()
    }

    fn run_portal(
        &mut self,
        settings: &ProvisioningSettings,
        current: &Config,
    ) -> Result<PortalOutcome, LinkError> {
        (**self).run_portal(settings, current)
    }
}

#[derive(Debug)]
pub struct NetworkConnector<W> {
    link: W,
    mode: NetworkMode,
    credentials: Option<WifiCredentials>,
    state: ConnectionState,
    should_save_config: bool,
}

impl<W: WifiLink> NetworkConnector<W> {
    pub fn new(link: W, mode: NetworkMode) -> Self {
        let credentials = match &mode {
            NetworkMode::Direct(credentials) => credentials.clone(),
            NetworkMode::Provisioning(_) => None,
        };

        Self {
            link,
            mode,
            credentials,
            state: ConnectionState::Disconnected,
            should_save_config: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> &NetworkMode {
        &self.mode
    }

    /// Set once the portal collected a config that needs persisting.
    pub fn should_save_config(&self) -> bool {
        self.should_save_config
    }

    pub fn link(&self) -> &W {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut W {
        &mut self.link
    }

    /// Resolves the config for this boot. Provisioning mode opens the portal
    /// when nothing is stored or a reset was requested; a stored config that
    /// fails to parse falls back to `defaults`.
    pub fn load_or_provision<S>(
        &mut self,
        store: &mut S,
        defaults: Config,
    ) -> Result<Config, NetworkError>
    where
        S: ConfigStore + ?Sized,
    {
        let settings = match &self.mode {
            NetworkMode::Direct(_) => return Ok(defaults),
            NetworkMode::Provisioning(settings) => settings.clone(),
        };

        let stored = if settings.reset_config {
            log::warn!("config reset requested; ignoring stored config");
            None
        } else {
            match store.load() {
                Ok(stored) => stored,
                Err(err) => {
                    log::warn!("failed to load stored config ({err}); using defaults");
                    return Ok(defaults);
                }
            }
        };

        if let Some(config) = stored {
            log::info!("loaded stored config for `{}`", config.host_name());
            return Ok(config);
        }

        log::warn!(
            "no stored config; starting provisioning portal on AP `{}`",
            settings.ap_ssid
        );
        let outcome = self.link.run_portal(&settings, &defaults)?;
        if let Some(credentials) = outcome.credentials {
            self.credentials = Some(credentials);
        }
        self.should_save_config = true;

        if let Err(err) = persist(store, &outcome.config) {
            log::warn!("failed to save provisioned config: {err}; continuing with it in memory");
        } else {
            self.should_save_config = false;
        }

        Ok(outcome.config)
    }

    /// Joins the network if needed. Direct mode waits forever; provisioning
    /// mode gives up after the configured timeout. Link errors count as
    /// "not joined yet" in both modes.
    pub fn ensure_connected<C>(&mut self, clock: &mut C) -> Result<ConnectionState, NetworkError>
    where
        C: Clock + ?Sized,
    {
        if self.link.status() == ConnectionState::Connected {
            self.state = ConnectionState::Connected;
            return Ok(self.state);
        }

        let timeout_ms = match &self.mode {
            NetworkMode::Direct(_) => None,
            NetworkMode::Provisioning(settings) => Some(settings.join_timeout_ms),
        };

        match &self.credentials {
            Some(credentials) => log::info!("connecting to wifi `{}`", credentials.ssid),
            None => log::info!("connecting to wifi with stored credentials"),
        }
        self.state = ConnectionState::Connecting;

        // A refused `begin` is retried on the next poll; only the timeout ends the wait.
        let link = &mut self.link;
        let credentials = self.credentials.as_ref();
        let mut started = false;
        let joined = wait_until(clock, timeout_ms, JOIN_POLL_MS, || {
            if !started {
                match link.begin(credentials) {
                    Ok(()) => started = true,
                    Err(err) => {
                        log::warn!("{err}; retrying");
                        return false;
                    }
                }
            }
            link.status() == ConnectionState::Connected
        });

        if joined {
            log::info!("wifi connected");
            self.state = ConnectionState::Connected;
            Ok(self.state)
        } else {
            self.state = ConnectionState::Disconnected;
            Err(NetworkError::JoinTimeout {
                timeout_ms: timeout_ms.unwrap_or(u32::MAX),
            })
        }
    }

    /// Polls link status without joining. Used for loss detection.
    pub fn is_connected(&mut self) -> bool {
        let connected = self.link.status() == ConnectionState::Connected;
        if !connected && self.state == ConnectionState::Connected {
            log::warn!("wifi connection lost");
            self.state = ConnectionState::Disconnected;
        }
        connected
    }
}

fn persist<S: ConfigStore + ?Sized>(store: &mut S, config: &Config) -> Result<(), StoreError> {
    store.save(config)?;
    log::info!("saved provisioned config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        testing::{sample_config, MemoryStore, MockWifi},
    };

    fn provisioning(reset_config: bool) -> NetworkMode {
        NetworkMode::Provisioning(ProvisioningSettings {
            reset_config,
            ..ProvisioningSettings::default()
        })
    }

    fn credentials() -> WifiCredentials {
        WifiCredentials {
            ssid: "home".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn empty_store_enters_portal_instead_of_joining() {
        let portal_config = sample_config();
        let mut connector =
            NetworkConnector::new(MockWifi::with_portal(portal_config.clone()), provisioning(false));
        let mut store = MemoryStore::default();

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, portal_config);
        assert_eq!(connector.link().portal_runs(), 1);
        assert_eq!(connector.link().begin_calls(), 0);
        assert_eq!(store.saved(), Some(&portal_config));
        assert!(!connector.should_save_config());
    }

    #[test]
    fn stored_config_skips_portal() {
        let stored = sample_config();
        let mut connector = NetworkConnector::new(MockWifi::default(), provisioning(false));
        let mut store = MemoryStore::holding(stored.clone());

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, stored);
        assert_eq!(connector.link().portal_runs(), 0);
    }

    #[test]
    fn reset_flag_forces_portal() {
        let portal_config = sample_config();
        let mut connector =
            NetworkConnector::new(MockWifi::with_portal(portal_config.clone()), provisioning(true));
        let mut store = MemoryStore::holding(Config::compiled_defaults());

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, portal_config);
        assert_eq!(connector.link().portal_runs(), 1);
    }

    #[test]
    fn unreadable_store_falls_back_to_defaults() {
        let mut connector = NetworkConnector::new(MockWifi::default(), provisioning(false));
        let mut store = MemoryStore::corrupt();

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, Config::compiled_defaults());
        assert_eq!(connector.link().portal_runs(), 0);
    }

    #[test]
    fn save_failure_keeps_config_in_memory() {
        let portal_config = sample_config();
        let mut connector =
            NetworkConnector::new(MockWifi::with_portal(portal_config.clone()), provisioning(false));
        let mut store = MemoryStore::read_only();

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, portal_config);
        assert!(connector.should_save_config());
    }

    #[test]
    fn direct_mode_never_provisions() {
        let mut connector =
            NetworkConnector::new(MockWifi::default(), NetworkMode::Direct(Some(credentials())));
        let mut store = MemoryStore::default();

        let config = connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();

        assert_eq!(config, Config::compiled_defaults());
        assert_eq!(connector.link().portal_runs(), 0);
    }

    #[test]
    fn direct_mode_polls_until_joined() {
        let mut connector = NetworkConnector::new(
            MockWifi::joining_after(40),
            NetworkMode::Direct(Some(credentials())),
        );
        let mut clock = ManualClock::default();

        let state = connector.ensure_connected(&mut clock).unwrap();

        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(connector.link().begin_calls(), 1);
        assert_eq!(connector.link().last_credentials(), Some(credentials()));
        assert!(clock.sleeps().iter().all(|&ms| ms == JOIN_POLL_MS));
    }

    #[test]
    fn provisioning_mode_times_out() {
        let mode = NetworkMode::Provisioning(ProvisioningSettings {
            join_timeout_ms: 10_000,
            ..ProvisioningSettings::default()
        });
        let mut connector = NetworkConnector::new(MockWifi::never_joining(), mode);
        let mut clock = ManualClock::default();

        let result = connector.ensure_connected(&mut clock);

        assert!(matches!(
            result,
            Err(NetworkError::JoinTimeout { timeout_ms: 10_000 })
        ));
        assert_eq!(clock.total_slept(), 10_000);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn direct_mode_retries_refused_begin() {
        let mut wifi = MockWifi::joining_after(2);
        wifi.refuse_begin(2);
        let mut connector =
            NetworkConnector::new(wifi, NetworkMode::Direct(Some(credentials())));
        let mut clock = ManualClock::default();

        let state = connector.ensure_connected(&mut clock).unwrap();

        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(connector.link().begin_calls(), 3);
        assert_eq!(clock.sleeps(), &[JOIN_POLL_MS; 3]);
    }

    #[test]
    fn provisioning_mode_counts_refused_begins_against_timeout() {
        let mode = NetworkMode::Provisioning(ProvisioningSettings {
            join_timeout_ms: 3_000,
            ..ProvisioningSettings::default()
        });
        let mut wifi = MockWifi::never_joining();
        wifi.refuse_begin(u32::MAX);
        let mut connector = NetworkConnector::new(wifi, mode);
        let mut clock = ManualClock::default();

        let result = connector.ensure_connected(&mut clock);

        assert!(matches!(
            result,
            Err(NetworkError::JoinTimeout { timeout_ms: 3_000 })
        ));
        assert_eq!(clock.total_slept(), 3_000);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connected_link_is_not_rejoined() {
        let mut connector = NetworkConnector::new(
            MockWifi::joining_after(0),
            NetworkMode::Direct(Some(credentials())),
        );
        let mut clock = ManualClock::default();

        connector.ensure_connected(&mut clock).unwrap();

        assert_eq!(connector.link().begin_calls(), 0);
    }

    #[test]
    fn portal_credentials_are_used_for_join() {
        let mut wifi = MockWifi::with_portal(sample_config());
        wifi.set_portal_credentials(credentials());
        wifi.join_after(1);
        let mut connector = NetworkConnector::new(wifi, provisioning(false));
        let mut store = MemoryStore::default();
        let mut clock = ManualClock::default();

        connector
            .load_or_provision(&mut store, Config::compiled_defaults())
            .unwrap();
        connector.ensure_connected(&mut clock).unwrap();

        assert_eq!(connector.link().last_credentials(), Some(credentials()));
    }
}
