use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Runtime,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simpleweather_common::{
    config::parse_flag,
    portal::{parse_submission, CAPTIVE_PROBE_PATHS, PORTAL_CONFIG_PATH, PORTAL_HTML},
    BrokerClient, BrokerError, BrokerLink, Clock, Config, ConnectOptions, ConnectionState,
    JsonFileStore, LinkError, NetworkConnector, NetworkMode, NodeSettings, PersistedConfig,
    PortalOutcome, ProvisioningSettings, QoS, Reading, SensorKind, SensorReader, Supervisor,
    WifiCredentials, WifiLink,
};

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_PUMP_WINDOW: Duration = Duration::from_millis(20);
const MQTT_REQUEST_CAPACITY: usize = 32;
const DEFAULT_PORTAL_PORT: u16 = 8080;

// Status codes reported for failed connects, in the numbering dashboards
// already know from the Arduino client.
const STATE_CONNECTION_TIMEOUT: i32 = -4;
const STATE_CONNECT_FAILED: i32 = -2;
const STATE_DISCONNECTED: i32 = -1;
const STATE_CONNECT_UNAUTHORIZED: i32 = 5;

pub fn run() -> anyhow::Result<()> {
    let (settings, unknown_sensor) = host_settings();

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Some(value) = unknown_sensor {
        warn!(
            "unknown SIMPLEWEATHER_SENSOR `{value}`, keeping {}",
            settings.sensor.as_str()
        );
    }

    let runtime = Arc::new(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?,
    );

    let portal_port = std::env::var("SIMPLEWEATHER_PORTAL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORTAL_PORT);
    let portal_addr = SocketAddr::from(([0, 0, 0, 0], portal_port));

    let data_dir = std::env::var("SIMPLEWEATHER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.simpleweather"));
    let mut store = JsonFileStore::in_dir(data_dir);

    let mut network = NetworkConnector::new(
        HostNetwork::new(runtime.clone(), portal_addr),
        settings.network.clone(),
    );
    let config = network
        .load_or_provision(&mut store, host_default_config())
        .context("provisioning failed")?;
    info!(
        "sensor `{}` publishing to {}:{} every {} ms ({} sensor)",
        config.host_name(),
        config.broker_host(),
        config.broker_port(),
        settings.measurement_interval_ms,
        settings.sensor.as_str()
    );

    let broker = BrokerClient::new(HostBroker::new(runtime, mqtt_credentials()));
    let sensor = SimulatedSensor::new(settings.sensor);

    let mut supervisor = Supervisor::new(
        config,
        &settings,
        network,
        broker,
        sensor,
        HostClock::new(),
    );

    match supervisor.run() {
        Ok(never) => match never {},
        // A service manager restarts the process, standing in for a device reset.
        Err(err) => Err(err).context("supervisor stopped, restart required"),
    }
}

/// Settings from the environment, plus any `SIMPLEWEATHER_SENSOR` value
/// that did not parse so it can be logged once tracing is up.
fn host_settings() -> (NodeSettings, Option<String>) {
    let mut settings = NodeSettings::default();
    let mut unknown_sensor = None;

    if let Some(interval) = std::env::var("SIMPLEWEATHER_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        settings.measurement_interval_ms = interval;
    }
    if let Ok(value) = std::env::var("SIMPLEWEATHER_RETAIN") {
        settings.retain_readings = parse_flag(&value);
    }
    if let Ok(value) = std::env::var("SIMPLEWEATHER_DEBUG") {
        settings.debug = parse_flag(&value);
    }
    if let Ok(value) = std::env::var("SIMPLEWEATHER_SENSOR") {
        match SensorKind::parse(&value) {
            Some(kind) => settings.sensor = kind,
            None => unknown_sensor = Some(value),
        }
    }

    let mode = std::env::var("SIMPLEWEATHER_NETWORK_MODE").ok();
    let provisioning = match mode.as_deref() {
        Some(mode) => mode.eq_ignore_ascii_case("provisioning"),
        None => settings.network.is_provisioning(),
    };

    settings.network = if provisioning {
        let mut provisioning = match settings.network {
            NetworkMode::Provisioning(current) => current,
            NetworkMode::Direct(_) => ProvisioningSettings::default(),
        };
        if let Ok(value) = std::env::var("SIMPLEWEATHER_RESET_CONFIG") {
            provisioning.reset_config = parse_flag(&value);
        }
        NetworkMode::Provisioning(provisioning)
    } else {
        let credentials = match std::env::var("WIFI_SSID") {
            Ok(ssid) if !ssid.trim().is_empty() => Some(WifiCredentials {
                ssid,
                password: std::env::var("WIFI_PASS").unwrap_or_default(),
            }),
            _ => WifiCredentials::compiled(),
        };
        NetworkMode::Direct(credentials)
    };

    (settings, unknown_sensor)
}

fn host_default_config() -> Config {
    let compiled = Config::compiled_defaults();

    let host_name = std::env::var("SIMPLEWEATHER_HOST_NAME").ok();
    let room = std::env::var("SIMPLEWEATHER_ROOM").ok();
    let broker_host = std::env::var("MQTT_HOST").ok();
    let broker_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok());

    if host_name.is_none() && room.is_none() && broker_host.is_none() && broker_port.is_none() {
        return compiled;
    }

    let host_name = host_name.unwrap_or_else(|| compiled.host_name().to_string());
    let room = room.unwrap_or_else(|| simpleweather_common::config::DEFAULT_ROOM.to_string());
    let broker_host = broker_host.unwrap_or_else(|| compiled.broker_host().to_string());
    let broker_port = broker_port.unwrap_or(compiled.broker_port());

    Config::for_room(&host_name, &room, &broker_host, broker_port).unwrap_or_else(|err| {
        warn!("ignoring invalid config overrides from environment: {err}");
        compiled
    })
}

fn mqtt_credentials() -> Option<(String, String)> {
    let user = std::env::var("MQTT_USER").ok()?;
    if user.is_empty() {
        return None;
    }
    Some((user, std::env::var("MQTT_PASS").unwrap_or_default()))
}

struct HostClock {
    started: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for HostClock {
    fn now_ms(&self) -> u32 {
        // Truncation wraps the counter the same way the device timer does.
        self.started.elapsed().as_millis() as u32
    }

    fn sleep_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Host networking belongs to the operating system, so the link is always
/// up; provisioning serves the setup page over HTTP instead of an AP.
struct HostNetwork {
    runtime: Arc<Runtime>,
    portal_addr: SocketAddr,
}

impl HostNetwork {
    fn new(runtime: Arc<Runtime>, portal_addr: SocketAddr) -> Self {
        Self {
            runtime,
            portal_addr,
        }
    }
}

impl WifiLink for HostNetwork {
    fn begin(&mut self, credentials: Option<&WifiCredentials>) -> Result<(), LinkError> {
        if let Some(credentials) = credentials {
            info!(
                "wifi `{}` is managed by the host; nothing to join",
                credentials.ssid
            );
        }
        Ok(())
    }

    fn status(&mut self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn run_portal(
        &mut self,
        settings: &ProvisioningSettings,
        current: &Config,
    ) -> Result<PortalOutcome, LinkError> {
        info!(
            "no access point on host; serving setup for `{}` on http://{}",
            settings.ap_ssid, self.portal_addr
        );
        self.runtime
            .block_on(serve_portal(self.portal_addr, current.to_persisted()))
            .map_err(|err| LinkError::Portal(format!("{err:#}")))
    }
}

#[derive(Clone)]
struct PortalState {
    current: Arc<PersistedConfig>,
    submissions: mpsc::Sender<PortalOutcome>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SavedBody {
    saved: bool,
    #[serde(rename = "hostName")]
    host_name: String,
}

async fn serve_portal(addr: SocketAddr, current: PersistedConfig) -> anyhow::Result<PortalOutcome> {
    let (submissions, mut received) = mpsc::channel(1);
    let state = PortalState {
        current: Arc::new(current),
        submissions,
    };

    let mut app: Router<PortalState> = Router::new();
    for path in CAPTIVE_PROBE_PATHS {
        app = app.route(path, get(handle_index));
    }
    let app = app
        .route(
            PORTAL_CONFIG_PATH,
            get(handle_get_config).put(handle_put_config),
        )
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;
    info!("provisioning portal listening on http://{addr}");

    let (stop, stopped) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
    });

    let outcome = tokio::select! {
        outcome = received.recv() => {
            outcome.context("provisioning portal closed before a configuration was submitted")?
        }
        result = &mut server => {
            result.context("provisioning portal task failed")??;
            anyhow::bail!("provisioning portal stopped before a configuration was submitted");
        }
    };

    let _ = stop.send(());
    server
        .await
        .context("provisioning portal task failed")?
        .context("provisioning portal server failed")?;

    info!("provisioning portal closed");
    Ok(outcome)
}

async fn handle_index() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn handle_get_config(State(state): State<PortalState>) -> Json<PersistedConfig> {
    Json(state.current.as_ref().clone())
}

async fn handle_put_config(State(state): State<PortalState>, body: Bytes) -> axum::response::Response {
    // The host OS owns the network, so WiFi fields are optional here.
    let outcome = match parse_submission(&body, false) {
        Ok(outcome) => outcome,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let host_name = outcome.config.host_name().to_string();
    if state.submissions.send(outcome).await.is_err() {
        return error_response(StatusCode::CONFLICT, "configuration was already submitted");
    }

    info!("provisioning portal received config for `{host_name}`");
    Json(SavedBody {
        saved: true,
        host_name,
    })
    .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// rumqttc session driven from the supervisor thread. Every connect builds
/// a fresh client so a refused session leaves nothing behind.
struct HostBroker {
    runtime: Arc<Runtime>,
    credentials: Option<(String, String)>,
    session: Option<MqttSession>,
}

impl HostBroker {
    fn new(runtime: Arc<Runtime>, credentials: Option<(String, String)>) -> Self {
        Self {
            runtime,
            credentials,
            session: None,
        }
    }
}

impl BrokerLink for HostBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        self.session = None;

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(MQTT_KEEP_ALIVE);
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            options.last_will.topic.clone(),
            options.last_will.payload.clone(),
            mqtt_qos(options.last_will.qos),
            options.last_will.retain,
        ));
        if let Some((user, pass)) = &self.credentials {
            mqtt_options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, MQTT_REQUEST_CAPACITY);
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(MQTT_CONNECT_TIMEOUT, wait_for_connack(&mut eventloop)).await
        });

        match outcome {
            Ok(Ok(())) => {
                self.session = Some(MqttSession { client, eventloop });
                Ok(())
            }
            Ok(Err(err)) => Err(BrokerError::ConnectFailed {
                code: connection_state_code(&err),
                detail: err.to_string(),
            }),
            Err(_) => Err(BrokerError::ConnectFailed {
                code: STATE_CONNECTION_TIMEOUT,
                detail: "timed out waiting for CONNACK".to_string(),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .try_publish(topic, rumqttc::QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
            .map_err(|err| BrokerError::PublishFailed {
                topic: topic.to_string(),
                detail: err.to_string(),
            })
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        let Some(session) = self.session.as_mut() else {
            return Err(BrokerError::NotConnected);
        };

        let result = self.runtime.block_on(async {
            loop {
                match tokio::time::timeout(MQTT_PUMP_WINDOW, session.eventloop.poll()).await {
                    Err(_) => return Ok(()),
                    Ok(Ok(_event)) => {
                        // No subscriptions; inbound traffic is keepalive and acks.
                    }
                    Ok(Err(err)) => return Err(err),
                }
            }
        });

        result.map_err(|err| {
            self.session = None;
            BrokerError::Dropped(err.to_string())
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

fn connection_state_code(err: &ConnectionError) -> i32 {
    match err {
        ConnectionError::ConnectionRefused(_) => STATE_CONNECT_UNAUTHORIZED,
        ConnectionError::Io(_) => STATE_CONNECT_FAILED,
        _ => STATE_DISCONNECTED,
    }
}

fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Deterministic readings in the shape of the configured sensor.
struct SimulatedSensor {
    kind: SensorKind,
    tick: u32,
}

impl SimulatedSensor {
    fn new(kind: SensorKind) -> Self {
        if kind != SensorKind::Simulated {
            info!(
                "no {} bus on host; simulating its readings",
                kind.as_str()
            );
        }
        Self { kind, tick: 0 }
    }
}

impl SensorReader for SimulatedSensor {
    fn read(&mut self) -> Reading {
        self.tick = self.tick.wrapping_add(1);

        // Hardware integration point: the esp32 build reads DHT11/DS18B20 here.
        let temperature_c = 20.5 + (self.tick % 8) as f32 * 0.25;
        let humidity = 42.0 + (self.tick % 6) as f32 * 0.5;

        match self.kind {
            SensorKind::Ds18b20 => Reading::temperature_only(temperature_c),
            SensorKind::Dht11 | SensorKind::Simulated => {
                Reading::with_humidity(temperature_c, humidity)
            }
        }
    }

    fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_sensor_follows_configured_shape() {
        let mut ds18b20 = SimulatedSensor::new(SensorKind::Ds18b20);
        let mut dht11 = SimulatedSensor::new(SensorKind::Dht11);

        assert_eq!(ds18b20.read().humidity, None);
        assert!(dht11.read().humidity.is_some());
        assert_eq!(dht11.name(), "dht11");
    }

    #[test]
    fn simulated_readings_stay_plausible() {
        let mut sensor = SimulatedSensor::new(SensorKind::Simulated);
        for _ in 0..20 {
            let reading = sensor.read();
            assert!((20.0..=23.0).contains(&reading.temperature_c));
            assert!(reading.has_valid_field());
        }
    }

    #[test]
    fn unknown_sensor_kind_is_reported_not_applied() {
        std::env::set_var("SIMPLEWEATHER_SENSOR", "bme280");
        let (settings, unknown) = host_settings();
        std::env::remove_var("SIMPLEWEATHER_SENSOR");

        assert_eq!(unknown.as_deref(), Some("bme280"));
        assert_eq!(settings.sensor, NodeSettings::default().sensor);
    }

    #[test]
    fn broker_without_session_refuses_publish() {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap(),
        );
        let mut broker = HostBroker::new(runtime, None);

        assert!(!broker.is_connected());
        assert_eq!(
            broker.publish("sensors/den/temperature", "21.50", false),
            Err(BrokerError::NotConnected)
        );
        assert_eq!(broker.poll(), Err(BrokerError::NotConnected));
    }
}
