use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyOutputPin, Output, PinDriver},
    prelude::Peripherals,
    spi::{config::Config as SpiConfig, SpiDeviceDriver, SpiDriver, SpiDriverConfig},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::pages::{render_config_page, DASHBOARD_HTML, REBOOT_HTML, SAVED_HTML};
use spilink_common::{
    config::{MAX_HOST_LEN, MAX_SECRET_LEN, MAX_SSID_LEN, MAX_TOPIC_LEN, MAX_USER_LEN},
    scheduler::{MANAGED_CONNECT_POLL_MS, MANAGED_CONNECT_TIMEOUT_MS},
    DeviceConfig, ConnectPoller, ConnectProgress, LinkMode, LinkScheduler, NodeRole,
    SchedulerAction, TOPIC_RX_DEFAULT,
};

const NVS_NAMESPACE: &str = "spilink-rx";

const LOCAL_AP_SSID: &str = "SpiLink-RX-Setup";
const LOCAL_AP_PASSWORD: &str = "spilink-setup";

const SPI_BAUD_HZ: u32 = 1_000_000;
const SPI_CS_SETTLE_US: u32 = 10;
const INDICATOR_LED_PIN: i32 = 2;

const MAX_HTTP_BODY: usize = 2048;
const OTA_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const SAVE_RESTART_DELAY_MS: u64 = 3_000;
const REBOOT_DELAY_MS: u64 = 1_000;
const SCHEDULER_PAUSE_MS: u64 = 10;

// Captive-portal probe paths various OSes poke; all of them behave like `/`.
const PORTAL_PROBE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

enum LinkStartup {
    Managed(EspWifi<'static>),
    Local(EspWifi<'static>),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
struct SharedState {
    sched: Arc<Mutex<LinkScheduler>>,
    mqtt: Arc<Mutex<Option<EspMqttClient<'static>>>>,
    ota: Arc<Mutex<OtaRuntimeState>>,
    config: Arc<DeviceConfig>,
}

struct SpiBus {
    spi: SpiDeviceDriver<'static, SpiDriver<'static>>,
    cs: PinDriver<'static, esp_idf_hal::gpio::Gpio5, Output>,
}

struct Indicator {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

#[derive(Debug, Default)]
struct OtaRuntimeState {
    in_progress: bool,
    bytes_written: u64,
    total_bytes: Option<u64>,
    progress_pct: Option<u8>,
    last_error: Option<String>,
    last_sha256: Option<String>,
    last_completed_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OtaApplyRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    reboot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OtaApplyResponse {
    accepted: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "bytesWritten")]
    bytes_written: u64,
    #[serde(rename = "totalBytes")]
    total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    last_sha256: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    last_completed_epoch: Option<i64>,
}

impl SpiBus {
    fn new(
        spi: esp_idf_hal::spi::SPI2,
        sclk: esp_idf_hal::gpio::Gpio18,
        mosi: esp_idf_hal::gpio::Gpio23,
        miso: esp_idf_hal::gpio::Gpio19,
        cs: esp_idf_hal::gpio::Gpio5,
    ) -> anyhow::Result<Self> {
        let spi_config = SpiConfig::new()
            .baudrate(Hertz(SPI_BAUD_HZ))
            .data_mode(embedded_hal::spi::MODE_0);

        // Chip select is driven manually so the settle delay after assert
        // stays under our control.
        let spi = SpiDeviceDriver::new_single(
            spi,
            sclk,
            mosi,
            Some(miso),
            Option::<esp_idf_hal::gpio::AnyIOPin>::None,
            &SpiDriverConfig::new(),
            &spi_config,
        )?;

        let mut cs = PinDriver::output(cs)?;
        cs.set_high()?;

        Ok(Self { spi, cs })
    }

    /// One chip-select-gated synchronous exchange. The receiving role clocks
    /// out zeros; whatever the peer shifted back is the captured frame.
    fn exchange(&mut self, out_frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut response = vec![0_u8; out_frame.len()];

        self.cs.set_low()?;
        Ets::delay_us(SPI_CS_SETTLE_US);
        let result = self.spi.transfer(&mut response, out_frame);
        self.cs.set_high()?;
        result?;

        Ok(response)
    }
}

fn init_indicator(pin: i32) -> Option<Indicator> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(Indicator { pin })
        }
        Err(err) => {
            warn!("indicator LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

impl Indicator {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator LED: {err}");
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        DeviceConfig::default()
    });
    ensure_defaults(&mut config);

    info!(
        "config loaded: ssid=`{}`, mqtt=`{}:{}`, topic=`{}`",
        config.wifi_ssid, config.mqtt_host, config.mqtt_port, config.mqtt_topic
    );

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let mut bus = SpiBus::new(
        peripherals.spi2,
        pins.gpio18,
        pins.gpio23,
        pins.gpio19,
        pins.gpio5,
    )
    .context("failed to initialize SPI bus")?;
    let mut indicator = init_indicator(INDICATOR_LED_PIN);

    let (wifi, link_mode) =
        match establish_link(peripherals.modem, sys_loop, &config).context("link startup failed")? {
            LinkStartup::Managed(wifi) => {
                info!("managed link established to `{}`", config.wifi_ssid);
                (wifi, LinkMode::Managed)
            }
            LinkStartup::Local(wifi) => {
                warn!(
                    "managed link unavailable; local AP `{}` active for {}s",
                    LOCAL_AP_SSID,
                    spilink_common::scheduler::LOCAL_MODE_WINDOW_MS / 1000
                );
                (wifi, LinkMode::Local)
            }
        };
    disable_wifi_power_save();

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut sched = LinkScheduler::new(NodeRole::Rx);
    sched.set_link_mode(link_mode, monotonic_ms());
    sched.set_telemetry_enabled(link_mode == LinkMode::Managed && config.telemetry_enabled());

    let state = SharedState {
        sched: Arc::new(Mutex::new(sched)),
        mqtt: Arc::new(Mutex::new(None)),
        ota: Arc::new(Mutex::new(OtaRuntimeState::default())),
        config: Arc::new(config),
    };

    let server = create_http_server(state.clone(), nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    // The scheduler step: every pass is constant work, all waiting is
    // expressed as "not yet eligible".
    loop {
        feed_watchdog();

        let now_ms = monotonic_ms();
        let actions = {
            let mut sched = state.sched.lock().unwrap();
            sched.tick(now_ms)
        };
        execute_actions(&state, &mut bus, &mut indicator, actions);

        thread::sleep(Duration::from_millis(SCHEDULER_PAUSE_MS));
    }
}

fn execute_actions(
    state: &SharedState,
    bus: &mut SpiBus,
    indicator: &mut Option<Indicator>,
    actions: Vec<SchedulerAction>,
) {
    for action in actions {
        match action {
            SchedulerAction::ConnectTelemetry => attempt_telemetry_connect(state),
            SchedulerAction::BusExchange => match bus.exchange(NodeRole::Rx.out_frame()) {
                Ok(response) => {
                    let follow_ups = {
                        let mut sched = state.sched.lock().unwrap();
                        sched.record_exchange(&response, monotonic_ms())
                    };
                    execute_actions(state, bus, indicator, follow_ups);
                }
                Err(err) => {
                    warn!("bus exchange failed: {err:#}");
                    state.sched.lock().unwrap().record_exchange_fault();
                }
            },
            SchedulerAction::Publish(payload) => publish_telemetry(state, &payload),
            SchedulerAction::IndicatorOn => {
                if let Some(indicator) = indicator.as_mut() {
                    indicator.set(true);
                }
            }
            SchedulerAction::IndicatorOff => {
                if let Some(indicator) = indicator.as_mut() {
                    indicator.set(false);
                }
            }
            SchedulerAction::Restart => {
                warn!("local mode exceeded its safety window; restarting");
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        }
    }
}

fn attempt_telemetry_connect(state: &SharedState) {
    let mut guard = state.mqtt.lock().unwrap();
    if guard.is_some() {
        // The esp-idf client owns reconnection once created; the scheduler's
        // gate only bounds client creation.
        return;
    }

    match create_mqtt_client(&state.config, state.sched.clone()) {
        Ok(client) => *guard = Some(client),
        Err(err) => warn!("telemetry connect attempt failed: {err:#}"),
    }
}

fn publish_telemetry(state: &SharedState, payload: &str) {
    let mut guard = state.mqtt.lock().unwrap();
    let Some(client) = guard.as_mut() else {
        return;
    };

    // Fire and forget; a failed publish surfaces through the connection
    // events on the next tick.
    if let Err(err) = client.publish(
        &state.config.mqtt_topic,
        QoS::AtMostOnce,
        false,
        payload.as_bytes(),
    ) {
        warn!("telemetry publish failed: {err:?}");
    }
}

fn create_mqtt_client(
    config: &DeviceConfig,
    sched: Arc<Mutex<LinkScheduler>>,
) -> anyhow::Result<EspMqttClient<'static>> {
    let url = format!("mqtt://{}:{}", config.mqtt_host, config.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("spilink-rx"),
        username: if config.mqtt_user.is_empty() {
            None
        } else {
            Some(config.mqtt_user.as_str())
        },
        password: if config.mqtt_pass.is_empty() {
            None
        } else {
            Some(config.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    let (client, connection) = EspMqttClient::new(&url, &conf)?;
    spawn_mqtt_event_loop(sched, connection);
    Ok(client)
}

fn spawn_mqtt_event_loop(sched: Arc<Mutex<LinkScheduler>>, mut connection: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-events".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            match connection.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("telemetry link connected");
                        sched.lock().unwrap().set_telemetry_connected(true);
                    }
                    EventPayload::Disconnected => {
                        warn!("telemetry link disconnected");
                        sched.lock().unwrap().set_telemetry_connected(false);
                    }
                    _ => {}
                },
                Err(err) => {
                    sched.lock().unwrap().set_telemetry_connected(false);
                    warn!("mqtt event loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt event thread");
}

fn establish_link(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    config: &DeviceConfig,
) -> anyhow::Result<LinkStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), None)?;

    if !config.has_identity() {
        info!("no network identity configured; starting local AP");
        start_local_ap(&mut esp_wifi, sys_loop)?;
        return Ok(LinkStartup::Local(esp_wifi));
    }

    let auth_method = if config.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    esp_wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    esp_wifi.start()?;
    esp_wifi.connect()?;
    info!(
        "joining `{}` (bounded wait {}s)",
        config.wifi_ssid,
        MANAGED_CONNECT_TIMEOUT_MS / 1000
    );

    // The only blocking wait in the system: once, at startup, bounded.
    let poller = ConnectPoller::new(monotonic_ms(), MANAGED_CONNECT_TIMEOUT_MS);
    loop {
        let connected = is_wifi_station_connected()
            && esp_wifi.sta_netif().is_up().unwrap_or(false);

        match poller.poll(monotonic_ms(), connected) {
            ConnectProgress::Connected => return Ok(LinkStartup::Managed(esp_wifi)),
            ConnectProgress::Pending => {
                thread::sleep(Duration::from_millis(MANAGED_CONNECT_POLL_MS))
            }
            ConnectProgress::TimedOut => break,
        }
    }

    warn!(
        "managed link not up within {}s; falling back to local AP",
        MANAGED_CONNECT_TIMEOUT_MS / 1000
    );
    let _ = esp_wifi.disconnect();
    let _ = esp_wifi.stop();
    start_local_ap(&mut esp_wifi, sys_loop)?;
    Ok(LinkStartup::Local(esp_wifi))
}

fn start_local_ap(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
) -> anyhow::Result<()> {
    let mut wifi = BlockingWifi::wrap(&mut *esp_wifi, sys_loop)?;

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: LOCAL_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("local AP SSID too long"))?,
        password: LOCAL_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("local AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;

    info!(
        "local AP started on `{}` (password: `{}`)",
        LOCAL_AP_SSID, LOCAL_AP_PASSWORD
    );
    Ok(())
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            serve_dashboard(&state, req)
        })?;
    }

    // Unknown paths behave exactly like `/`.
    for path in PORTAL_PROBE_PATHS {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            serve_dashboard(&state, req)
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let config = nvs_store.load_config().unwrap_or_default();
            write_html(req, &render_config_page(&config))
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let body = String::from_utf8_lossy(&body).into_owned();

            let fields = match spilink_common::parse_form(&body) {
                Ok(fields) => fields,
                Err(err) => return write_error(req, 400, &format!("bad form body: {err}")),
            };

            let mut config = nvs_store.load_config().unwrap_or_default();
            config
                .apply_form_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            nvs_store.save_config(&config)?;

            info!("configuration saved; rebooting shortly");
            schedule_restart(SAVE_RESTART_DELAY_MS);
            write_html(req, SAVED_HTML)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let payload = {
                let sched = state.sched.lock().unwrap();
                sched.status_rx(wifi_rssi(), monotonic_ms() / 1000, free_heap_bytes())
            };
            write_json(req, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/reboot", Method::Get, move |req| {
        schedule_restart(REBOOT_DELAY_MS);
        write_html(req, REBOOT_HTML)
    })?;

    {
        let ota = state.ota.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/status", Method::Get, move |req| {
            let payload = build_ota_status(&ota);
            write_json(req, &payload)
        })?;
    }

    {
        let ota = state.ota.clone();
        let sched = state.sched.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            if sched.lock().unwrap().link_mode() == LinkMode::Local {
                return write_error(req, 409, "join a managed network before applying updates");
            }

            let body = read_request_body(&mut req)?;
            let request: OtaApplyRequest =
                serde_json::from_slice(&body).context("invalid ota payload")?;

            if let Err(message) = validate_ota_request(&request) {
                return write_error(req, 400, message);
            }

            match start_ota_apply(&ota, request) {
                Ok(payload) => write_json(req, &payload),
                Err(err) => {
                    let message = err.to_string();
                    if message.contains("already in progress") {
                        write_error(req, 409, &message)
                    } else {
                        write_error(req, 500, "failed to start OTA apply")
                    }
                }
            }
        })?;
    }

    Ok(server)
}

fn serve_dashboard(
    state: &SharedState,
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
) -> anyhow::Result<()> {
    let link_mode = state.sched.lock().unwrap().link_mode();
    if link_mode == LinkMode::Managed {
        write_html(req, DASHBOARD_HTML)
    } else {
        req.into_response(302, Some("Found"), &[("Location", "/config")])?;
        Ok(())
    }
}

fn schedule_restart(delay_ms: u64) {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

fn ensure_defaults(config: &mut DeviceConfig) {
    config.sanitize();
    if config.mqtt_topic.is_empty() {
        config.mqtt_topic = TOPIC_RX_DEFAULT.to_string();
    }
}

fn validate_ota_request(request: &OtaApplyRequest) -> Result<(), &'static str> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url must start with http:// or https://");
    }

    if let Some(sha256) = request.sha256.as_ref() {
        let value = sha256.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("sha256 must be 64 hex characters");
        }
    }

    Ok(())
}

fn start_ota_apply(
    ota_state: &Arc<Mutex<OtaRuntimeState>>,
    request: OtaApplyRequest,
) -> anyhow::Result<OtaApplyResponse> {
    {
        let mut ota = ota_state.lock().unwrap();
        if ota.in_progress {
            return Err(anyhow!("OTA update already in progress"));
        }

        ota.in_progress = true;
        ota.bytes_written = 0;
        ota.total_bytes = None;
        ota.progress_pct = None;
        ota.last_error = None;
        ota.last_sha256 = None;
    }

    let ota_state = ota_state.clone();
    thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let reboot_after_apply = request.reboot.unwrap_or(true);
            let expected_sha = request
                .sha256
                .as_ref()
                .map(|value| value.trim().to_ascii_lowercase());
            let result = download_and_apply_ota(&ota_state, &request.url, expected_sha.as_deref());

            match result {
                Ok((bytes_written, digest_hex)) => {
                    {
                        let mut ota = ota_state.lock().unwrap();
                        ota.in_progress = false;
                        ota.bytes_written = bytes_written;
                        ota.progress_pct = Some(100);
                        ota.last_error = None;
                        ota.last_sha256 = Some(digest_hex);
                        ota.last_completed_epoch = Some(chrono::Utc::now().timestamp());
                    }

                    info!("OTA apply completed ({bytes_written} bytes)");

                    if reboot_after_apply {
                        thread::sleep(Duration::from_millis(800));
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    }
                }
                Err(err) => {
                    warn!("OTA apply failed: {err:#}");
                    let mut ota = ota_state.lock().unwrap();
                    ota.in_progress = false;
                    ota.last_error = Some(err.to_string());
                    ota.last_completed_epoch = Some(chrono::Utc::now().timestamp());
                }
            }
        })
        .context("failed to spawn OTA apply thread")?;

    Ok(OtaApplyResponse {
        accepted: true,
        in_progress: true,
    })
}

fn download_and_apply_ota(
    ota_state: &Arc<Mutex<OtaRuntimeState>>,
    url: &str,
    expected_sha256: Option<&str>,
) -> anyhow::Result<(u64, String)> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("OTA download failed with HTTP {status}"));
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());

    {
        let mut ota = ota_state.lock().unwrap();
        ota.total_bytes = content_length;
    }

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        let mut state = ota_state.lock().unwrap();
        state.bytes_written = total_written;
        if let Some(total) = state.total_bytes.filter(|value| *value > 0) {
            let pct = (total_written.saturating_mul(100) / total).min(100);
            state.progress_pct = Some(pct as u8);
        }
    }

    if total_written == 0 {
        return Err(anyhow!("OTA download body is empty"));
    }

    let digest = hasher.finalize();
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            return Err(anyhow!(
                "sha256 mismatch (expected {expected}, got {digest_hex})"
            ));
        }
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    drop(ota);

    Ok((total_written, digest_hex))
}

fn build_ota_status(ota_state: &Arc<Mutex<OtaRuntimeState>>) -> OtaStatusResponse {
    let ota = ota_state.lock().unwrap();

    OtaStatusResponse {
        supported: true,
        in_progress: ota.in_progress,
        bytes_written: ota.bytes_written,
        total_bytes: ota.total_bytes,
        progress_pct: ota.progress_pct,
        last_error: ota.last_error.clone(),
        last_sha256: ota.last_sha256.clone(),
        last_completed_epoch: ota.last_completed_epoch,
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
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

fn write_html(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
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
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
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

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;

        let mut config = DeviceConfig {
            wifi_ssid: read_str_key(&nvs, "ssid", MAX_SSID_LEN)?,
            wifi_pass: read_str_key(&nvs, "pass", MAX_SECRET_LEN)?,
            mqtt_host: read_str_key(&nvs, "mqtt_host", MAX_HOST_LEN)?,
            mqtt_port: nvs
                .get_u16("mqtt_port")?
                .unwrap_or(spilink_common::config::DEFAULT_MQTT_PORT),
            mqtt_topic: read_str_key(&nvs, "mqtt_topic", MAX_TOPIC_LEN)?,
            mqtt_user: read_str_key(&nvs, "mqtt_user", MAX_USER_LEN)?,
            mqtt_pass: read_str_key(&nvs, "mqtt_pass", MAX_SECRET_LEN)?,
        };
        config.sanitize();
        Ok(config)
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;

        nvs.set_str("ssid", &config.wifi_ssid)?;
        nvs.set_str("pass", &config.wifi_pass)?;
        nvs.set_str("mqtt_host", &config.mqtt_host)?;
        nvs.set_u16("mqtt_port", config.mqtt_port)?;
        nvs.set_str("mqtt_topic", &config.mqtt_topic)?;
        nvs.set_str("mqtt_user", &config.mqtt_user)?;
        nvs.set_str("mqtt_pass", &config.mqtt_pass)?;
        Ok(())
    }
}

fn read_str_key(
    nvs: &EspNvs<esp_idf_svc::nvs::NvsDefault>,
    key: &str,
    max_len: usize,
) -> anyhow::Result<String> {
    let mut buffer = vec![0_u8; max_len + 1];
    Ok(nvs
        .get_str(key, &mut buffer)?
        .map(|value| value.to_string())
        .unwrap_or_default())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn wifi_rssi() -> i32 {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    if rc == esp_idf_svc::sys::ESP_OK {
        ap_info.rssi as i32
    } else {
        0
    }
}

fn free_heap_bytes() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
