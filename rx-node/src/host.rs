use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use crate::pages::{render_config_page, DASHBOARD_HTML, REBOOT_HTML, SAVED_HTML};
use spilink_common::{
    frame::{RX_FRAME_LEN, TX_FRAME},
    parse_form, DeviceConfig, LinkMode, LinkScheduler, NodeRole, SchedulerAction,
    TOPIC_RX_DEFAULT,
};

const SCHEDULER_TICK_MS: u64 = 25;

// Host builds have no radio; report a plausible fixed signal level.
const SIMULATED_RSSI: i32 = -42;
const SIMULATED_HEAP: u32 = 0;

#[derive(Clone)]
struct AppState {
    sched: Arc<Mutex<LinkScheduler>>,
    mqtt: AsyncClient,
    config: Arc<DeviceConfig>,
    store: AppStore,
    peer: Arc<Mutex<SimulatedPeer>>,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Stands in for the wire peer: every other exchange shifts back a greeting,
/// the rest come back all sentinel.
#[derive(Default)]
struct SimulatedPeer {
    exchanges: u64,
}

impl SimulatedPeer {
    fn respond(&mut self) -> Vec<u8> {
        self.exchanges = self.exchanges.wrapping_add(1);

        let mut response = vec![0_u8; RX_FRAME_LEN];
        if self.exchanges % 2 == 1 {
            response[..TX_FRAME.len()].copy_from_slice(TX_FRAME);
        }
        response
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, serde::Deserialize)]
struct OtaApplyRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        DeviceConfig::default()
    });
    config.sanitize();
    if config.mqtt_topic.is_empty() {
        config.mqtt_topic = TOPIC_RX_DEFAULT.to_string();
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.mqtt_pass.clone());

    let telemetry_enabled = !mqtt_host.is_empty();
    let broker_host = if telemetry_enabled {
        mqtt_host
    } else {
        // rumqttc needs an address even when telemetry stays gated off.
        "127.0.0.1".to_string()
    };

    let mut mqtt_options = MqttOptions::new("spilink-rx-host", broker_host, mqtt_port);
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);

    let mut sched = LinkScheduler::new(NodeRole::Rx);
    sched.set_link_mode(LinkMode::Managed, monotonic_ms());
    sched.set_telemetry_enabled(telemetry_enabled);

    let app_state = AppState {
        sched: Arc::new(Mutex::new(sched)),
        mqtt,
        config: Arc::new(config),
        store,
        peer: Arc::new(Mutex::new(SimulatedPeer::default())),
    };

    if telemetry_enabled {
        spawn_mqtt_loop(app_state.clone(), eventloop);
    }
    spawn_scheduler_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_dashboard))
        .route("/config", get(handle_config_page))
        .route("/save", post(handle_save))
        .route("/api/status", get(handle_status))
        .route("/api/ota/status", get(handle_ota_status))
        .route("/api/ota/apply", post(handle_ota_apply))
        .route("/reboot", get(handle_reboot))
        .fallback(handle_dashboard)
        .with_state(app_state);

    let port = std::env::var("SPILINK_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind rx node server at {addr}"))?;

    info!("rx node listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("telemetry link connected");
                    app_state.sched.lock().await.set_telemetry_connected(true);
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.sched.lock().await.set_telemetry_connected(false);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_scheduler_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(SCHEDULER_TICK_MS));

        loop {
            interval.tick().await;

            let actions = {
                let mut sched = app_state.sched.lock().await;
                sched.tick(monotonic_ms())
            };

            if !actions.is_empty() {
                execute_actions(&app_state, actions).await;
            }
        }
    });
}

async fn execute_actions(app_state: &AppState, actions: Vec<SchedulerAction>) {
    for action in actions {
        match action {
            SchedulerAction::ConnectTelemetry => {
                // rumqttc owns reconnection; the scheduler's gate is satisfied
                // by the running event loop.
                debug!("telemetry connect attempt");
            }
            SchedulerAction::BusExchange => {
                // Hardware integration point:
                // replace the simulated peer response with the SPI transfer on
                // ESP target.
                let response = app_state.peer.lock().await.respond();
                let follow_ups = {
                    let mut sched = app_state.sched.lock().await;
                    sched.record_exchange(&response, monotonic_ms())
                };
                if !follow_ups.is_empty() {
                    Box::pin(execute_actions(app_state, follow_ups)).await;
                }
            }
            SchedulerAction::Publish(payload) => {
                if let Err(err) = app_state
                    .mqtt
                    .publish(
                        app_state.config.mqtt_topic.clone(),
                        QoS::AtMostOnce,
                        false,
                        payload,
                    )
                    .await
                {
                    warn!("telemetry publish failed: {err}");
                }
            }
            SchedulerAction::IndicatorOn => debug!("indicator on"),
            SchedulerAction::IndicatorOff => debug!("indicator off"),
            SchedulerAction::Restart => warn!("restart requested (ignored on host)"),
        }
    }
}

async fn handle_dashboard(State(app_state): State<AppState>) -> axum::response::Response {
    let link_mode = app_state.sched.lock().await.link_mode();
    if link_mode == LinkMode::Managed {
        Html(DASHBOARD_HTML).into_response()
    } else {
        Redirect::to("/config").into_response()
    }
}

async fn handle_config_page(State(app_state): State<AppState>) -> impl IntoResponse {
    let config = app_state
        .store
        .load_config()
        .await
        .unwrap_or_else(|_| (*app_state.config).clone());
    Html(render_config_page(&config))
}

async fn handle_save(State(app_state): State<AppState>, body: String) -> axum::response::Response {
    let fields = match parse_form(&body) {
        Ok(fields) => fields,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("bad form body: {err}"))
        }
    };

    let mut config = app_state
        .store
        .load_config()
        .await
        .unwrap_or_else(|_| (*app_state.config).clone());
    config.apply_form_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    if let Err(err) = app_state.store.save_config(&config).await {
        warn!("failed to persist config: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist config");
    }

    info!("configuration saved (host build does not reboot)");
    Html(SAVED_HTML).into_response()
}

async fn handle_status(State(app_state): State<AppState>) -> impl IntoResponse {
    let payload = {
        let sched = app_state.sched.lock().await;
        sched.status_rx(SIMULATED_RSSI, monotonic_ms() / 1000, SIMULATED_HEAP)
    };
    Json(payload)
}

async fn handle_reboot() -> impl IntoResponse {
    warn!("reboot requested (ignored on host)");
    Html(REBOOT_HTML)
}

async fn handle_ota_status() -> impl IntoResponse {
    Json(OtaStatusResponse {
        supported: false,
        in_progress: false,
        last_error: Some("OTA apply is only available in ESP32 builds".to_string()),
    })
}

async fn handle_ota_apply(Json(request): Json<OtaApplyRequest>) -> impl IntoResponse {
    let _ = (request.url.as_str(), request.sha256.as_deref());
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "OTA apply is only available in ESP32 builds",
    )
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

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("SPILINK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.spilink-rx"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<DeviceConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_peer_alternates_greeting_and_idle_frames() {
        let mut peer = SimulatedPeer::default();

        let first = peer.respond();
        assert_eq!(&first[..TX_FRAME.len()], TX_FRAME);
        assert!(first[TX_FRAME.len()..].iter().all(|byte| *byte == 0));

        let second = peer.respond();
        assert!(second.iter().all(|byte| *byte == 0));

        let third = peer.respond();
        assert_eq!(&third[..TX_FRAME.len()], TX_FRAME);
    }

    #[test]
    fn peer_frames_match_the_bus_width() {
        let mut peer = SimulatedPeer::default();
        assert_eq!(peer.respond().len(), RX_FRAME_LEN);
    }
}
