use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::QoS as MqttQoS,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use simpleweather_common::{
    portal::{parse_submission, CAPTIVE_PROBE_PATHS, PORTAL_CONFIG_PATH, PORTAL_HTML},
    store::{decode_config, encode_config},
    BrokerClient, BrokerError, BrokerLink, Clock, Config, ConfigStore, ConnectOptions,
    ConnectionState, LinkError, NetworkConnector, NodeSettings, PersistedConfig, PortalOutcome,
    ProvisioningSettings, QoS, Reading, SensorKind, SensorReader, StoreError, Supervisor,
    WifiCredentials, WifiLink,
};

const NVS_NAMESPACE: &str = "simpleweather";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_LEN: usize = 1024;

const DS18B20_PIN: i32 = 4;
const DHT11_PIN: i32 = 16;

const MAX_HTTP_BODY: usize = 4096;
const PORTAL_POLL_MS: u32 = 250;
const PORTAL_CLOSE_GRACE_MS: u32 = 500;

const MQTT_CONNECT_TIMEOUT_MS: u32 = 5_000;
const MQTT_CONNECT_POLL_MS: u32 = 50;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const STATE_CONNECTION_TIMEOUT: i32 = -4;
const STATE_CONNECT_FAILED: i32 = -2;

const LOOP_YIELD_MS: u32 = 10;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let settings = NodeSettings::default();
    if settings.debug {
        log::set_max_level(log::LevelFilter::Debug);
    }

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let sensor = build_sensor(settings.sensor, pins.gpio4.downgrade(), pins.gpio16.downgrade())
        .context("failed to initialize sensor")?;

    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let mut network = NetworkConnector::new(
        EspWifiLink::new(wifi, sys_loop),
        settings.network.clone(),
    );

    let mut store = NvsConfigStore {
        partition: nvs_partition,
    };
    let config = network
        .load_or_provision(&mut store, Config::compiled_defaults())
        .context("provisioning failed")?;
    info!(
        "sensor `{}` publishing to {}:{} every {} ms",
        config.host_name(),
        config.broker_host(),
        config.broker_port(),
        settings.measurement_interval_ms
    );

    let mut supervisor = Supervisor::new(
        config,
        &settings,
        network,
        BrokerClient::new(EspBroker::default()),
        sensor,
        EspClock,
    );

    match supervisor.run() {
        Ok(never) => match never {},
        Err(err) => {
            warn!("{err}; restarting device");
            restart_device();
            Ok(())
        }
    }
}

fn restart_device() {
    FreeRtos::delay_ms(100);
    unsafe { esp_idf_svc::sys::esp_restart() };
}

struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u32 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        // Wraps every ~49 days, like the Arduino millis() counter.
        (micros / 1_000) as u32
    }

    fn sleep_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn yield_now(&mut self) {
        // Lets the idle task run so the task watchdog stays quiet.
        FreeRtos::delay_ms(LOOP_YIELD_MS);
    }
}

fn build_sensor(
    kind: SensorKind,
    ds18_pin: AnyIOPin,
    dht_pin: AnyIOPin,
) -> anyhow::Result<Box<dyn SensorReader>> {
    let sensor: Box<dyn SensorReader> = match kind {
        SensorKind::Dht11 => Box::new(Dht11Sensor::new(dht_pin)?),
        SensorKind::Ds18b20 => Box::new(Ds18b20Sensor::new(ds18_pin)?),
        SensorKind::Simulated => {
            return Err(anyhow!("simulated sensor is only available on host builds"))
        }
    };
    info!("using {} sensor", sensor.name());
    Ok(sensor)
}

fn open_drain_pin(pin: AnyIOPin) -> anyhow::Result<PinDriver<'static, AnyIOPin, InputOutput>> {
    let mut driver = PinDriver::input_output_od(pin)?;
    driver.set_pull(Pull::Up)?;
    driver.set_high()?;
    Ok(driver)
}

struct Dht11Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht11Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        Ok(Self {
            pin: open_drain_pin(pin)?,
            delay: Ets,
        })
    }
}

impl SensorReader for Dht11Sensor {
    fn read(&mut self) -> Reading {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return Reading::with_humidity(f32::NAN, f32::NAN);
        }

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                let temperature = f32::from(reading.temperature);
                let humidity = f32::from(reading.relative_humidity);
                info!("[DHT11] {temperature:.1}°C, {humidity:.1}%");
                Reading::with_humidity(temperature, humidity)
            }
            Err(err) => {
                warn!("failed to read DHT11 on GPIO{DHT11_PIN}: {err:?}");
                Reading::with_humidity(f32::NAN, f32::NAN)
            }
        }
    }

    fn name(&self) -> &'static str {
        "dht11"
    }
}

struct Ds18b20Sensor {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl Ds18b20Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let one_wire = OneWire::new(open_drain_pin(pin)?)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut sensor = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        sensor.refresh_address();
        Ok(sensor)
    }

    fn refresh_address(&mut self) {
        let mut found = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if found.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        found = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = found;
        match self.address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{DS18B20_PIN} ({device_count} one-wire device(s), using {address:?})"
            ),
            None => warn!(
                "no DS18B20 found on GPIO{DS18B20_PIN} ({device_count} one-wire device(s) detected)"
            ),
        }
    }

    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => {
                info!("[DS18B20] {:.1}°C", data.temperature);
                Some(data.temperature)
            }
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

impl SensorReader for Ds18b20Sensor {
    fn read(&mut self) -> Reading {
        Reading::temperature_only(self.read_celsius().unwrap_or(f32::NAN))
    }

    fn name(&self) -> &'static str {
        "ds18b20"
    }
}

struct NvsConfigStore {
    partition: EspDefaultNvsPartition,
}

fn backend_error(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl ConfigStore for NvsConfigStore {
    fn load(&mut self) -> Result<Option<Config>, StoreError> {
        let nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(backend_error)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_LEN];
        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer).map_err(backend_error)? {
            Some(raw) => decode_config(raw.as_bytes()).map(Some),
            None => Ok(None),
        }
    }

    fn save(&mut self, config: &Config) -> Result<(), StoreError> {
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(backend_error)?;
        let payload = String::from_utf8(encode_config(config)?)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        nvs.set_str(NVS_CONFIG_KEY, &payload)
            .map_err(backend_error)
    }
}

/// Station WiFi on the esp-idf driver. Joining is non-blocking; the driver
/// keeps the last station credentials in NVS for `begin(None)`.
struct EspWifiLink {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
}

impl EspWifiLink {
    fn new(wifi: EspWifi<'static>, sys_loop: EspSystemEventLoop) -> Self {
        Self { wifi, sys_loop }
    }

    fn join(&mut self, credentials: Option<&WifiCredentials>) -> anyhow::Result<()> {
        if let Some(credentials) = credentials {
            let auth_method = if credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            };
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration {
                    ssid: credentials
                        .ssid
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi ssid too long"))?,
                    password: credentials
                        .password
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi password too long"))?,
                    auth_method,
                    ..Default::default()
                }))?;
        }

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        Ok(())
    }

    fn serve_portal(
        &mut self,
        settings: &ProvisioningSettings,
        current: &Config,
    ) -> anyhow::Result<PortalOutcome> {
        let previous = self.wifi.get_configuration()?;
        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        if wifi.is_started()? {
            wifi.stop()?;
        }

        let auth_method = if settings.ap_password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: settings
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: settings
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method,
            channel: 1,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
        info!("provisioning AP started on `{}`", settings.ap_ssid);

        let submitted = Arc::new(Mutex::new(None));
        let ssid_required = !has_station_credentials(&previous);
        let server =
            create_portal_server(current.to_persisted(), ssid_required, submitted.clone())?;

        let outcome = loop {
            let pending = submitted
                .lock()
                .map_err(|_| anyhow!("portal state lock poisoned"))?
                .take();
            if let Some(outcome) = pending {
                break outcome;
            }
            FreeRtos::delay_ms(PORTAL_POLL_MS);
        };

        // Let the response reach the browser before the AP goes away.
        FreeRtos::delay_ms(PORTAL_CLOSE_GRACE_MS);
        drop(server);
        wifi.stop()?;
        wifi.set_configuration(&previous)?;
        info!("provisioning portal closed");

        Ok(outcome)
    }
}

impl WifiLink for EspWifiLink {
    fn begin(&mut self, credentials: Option<&WifiCredentials>) -> Result<(), LinkError> {
        self.join(credentials)
            .map_err(|err| LinkError::Join(format!("{err:#}")))
    }

    fn status(&mut self) -> ConnectionState {
        match (self.wifi.is_connected(), self.wifi.is_up()) {
            (Ok(true), Ok(true)) => ConnectionState::Connected,
            (Ok(true), _) => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    fn run_portal(
        &mut self,
        settings: &ProvisioningSettings,
        current: &Config,
    ) -> Result<PortalOutcome, LinkError> {
        self.serve_portal(settings, current)
            .map_err(|err| LinkError::Portal(format!("{err:#}")))
    }
}

#[derive(Debug, Serialize)]
struct SavedBody {
    saved: bool,
    #[serde(rename = "hostName")]
    host_name: String,
}

fn has_station_credentials(configuration: &Configuration) -> bool {
    match configuration {
        Configuration::Client(client) | Configuration::Mixed(client, _) => {
            !client.ssid.trim().is_empty()
        }
        _ => false,
    }
}

fn create_portal_server(
    current: PersistedConfig,
    ssid_required: bool,
    submitted: Arc<Mutex<Option<PortalOutcome>>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PROBE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler(PORTAL_CONFIG_PATH, Method::Get, move |req| {
        write_json(req, &current)
    })?;

    server.fn_handler::<anyhow::Error, _>(PORTAL_CONFIG_PATH, Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let outcome = match parse_submission(&body, ssid_required) {
            Ok(outcome) => outcome,
            Err(message) => return write_error(req, 400, &message),
        };

        let host_name = outcome.config.host_name().to_string();
        *submitted
            .lock()
            .map_err(|_| anyhow!("portal state lock poisoned"))? = Some(outcome);
        info!("provisioning portal received config for `{host_name}`");

        write_json(
            req,
            &SavedBody {
                saved: true,
                host_name,
            },
        )
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// esp-mqtt runs its own task, so `poll` only reports whether the session
/// is still up. Each connect replaces the client to keep one session.
#[derive(Default)]
struct EspBroker {
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl BrokerLink for EspBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        self.client = None;
        self.connected = Arc::new(AtomicBool::new(false));

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            keep_alive_interval: Some(MQTT_KEEP_ALIVE),
            lwt: Some(LwtConfiguration {
                topic: options.last_will.topic.as_str(),
                payload: options.last_will.payload.as_bytes(),
                qos: mqtt_qos(options.last_will.qos),
                retain: options.last_will.retain,
            }),
            ..Default::default()
        };

        let connected = self.connected.clone();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => connected.store(true, Ordering::SeqCst),
            EventPayload::Disconnected => connected.store(false, Ordering::SeqCst),
            _ => {}
        })
        .map_err(|err| BrokerError::ConnectFailed {
            code: STATE_CONNECT_FAILED,
            detail: err.to_string(),
        })?;

        let mut waited = 0;
        while !self.connected.load(Ordering::SeqCst) {
            if waited >= MQTT_CONNECT_TIMEOUT_MS {
                return Err(BrokerError::ConnectFailed {
                    code: STATE_CONNECTION_TIMEOUT,
                    detail: format!("no CONNACK from {url}"),
                });
            }
            FreeRtos::delay_ms(MQTT_CONNECT_POLL_MS);
            waited += MQTT_CONNECT_POLL_MS;
        }

        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::SeqCst)
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, MqttQoS::AtMostOnce, retain, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| BrokerError::PublishFailed {
                topic: topic.to_string(),
                detail: err.to_string(),
            })
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            self.client = None;
            Err(BrokerError::Dropped("esp-mqtt reported disconnect".to_string()))
        }
    }
}

fn mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
    }
}
