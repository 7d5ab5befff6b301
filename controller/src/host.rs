use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::clock::{is_daylight_saving, monotonic_ms, zone_offset_hours};
use switch_common::{
    command::parse_flag, Clock, ControlCommand, EdgeCallback, EventKind, Fetch,
    FetchError, FetchResponse, Host, RuntimeConfig, SchedulerConfiguration, SchedulerEngine,
    SchedulerStatus, SwitchState, TaskConfig, MAX_MQTT_PAYLOAD_BYTES, TOPIC_CMD_ENABLED,
    TOPIC_CMD_HOME_ONLY, TOPIC_CMD_PRESENCE_AWAY, TOPIC_CMD_PRESENCE_HOME,
    TOPIC_CMD_PRESENCE_RESET, TOPIC_SCHEDULER_STATE, TOPIC_SWITCH_STATE,
};

const CONTROL_LOOP_IDLE_MS: u64 = 200;
const FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
struct AppState {
    commands: mpsc::UnboundedSender<ControlCommand>,
    status: watch::Receiver<SchedulerStatus>,
    mqtt: AsyncClient,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Wall clock in an IANA zone. Offsets are truncated to whole hours.
struct SystemClock {
    tz: Tz,
}

/// Plain-HTTP GET through a blocking reqwest client.
struct HttpFetch {
    client: reqwest::blocking::Client,
}

/// Blocking host services for the control thread.
struct ThreadHost;

/// The physical switch. On the host this is logged and mirrored to MQTT.
#[derive(Clone)]
struct SwitchOutput {
    mqtt: AsyncClient,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("switch-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();

    let app_state = AppState {
        commands: command_tx,
        status: status_rx,
        mqtt: mqtt.clone(),
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_thread(runtime, SwitchOutput { mqtt }, command_rx, status_tx, persist_tx)?;
    spawn_state_publish_loop(app_state.clone());
    spawn_persist_loop(store, persist_rx);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/enabled", post(handle_set_enabled))
        .route("/api/home-only", post(handle_set_home_only))
        .route("/api/presence/home", post(handle_presence_home))
        .route("/api/presence/away", post(handle_presence_away))
        .route("/api/presence/reset", post(handle_presence_reset))
        .route("/api/tasks", get(handle_get_tasks).post(handle_post_task))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_CMD_PRESENCE_HOME,
        TOPIC_CMD_PRESENCE_AWAY,
        TOPIC_CMD_PRESENCE_RESET,
        TOPIC_CMD_ENABLED,
        TOPIC_CMD_HOME_ONLY,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload)
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The engine is not `Send`; it is built and ticked on one dedicated thread
/// and everything else talks to it through channels.
fn spawn_control_thread(
    runtime: RuntimeConfig,
    switch: SwitchOutput,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
    status: watch::Sender<SchedulerStatus>,
    persist: mpsc::UnboundedSender<SchedulerConfiguration>,
) -> anyhow::Result<()> {
    let tz: Tz = runtime
        .timezone
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid timezone `{}`: {err}", runtime.timezone))?;

    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || {
            let fetch = match HttpFetch::new() {
                Ok(fetch) => fetch,
                Err(err) => {
                    warn!("failed to build HTTP client, control loop not started: {err:#}");
                    return;
                }
            };

            let mut engine =
                SchedulerEngine::new(runtime.engine, SystemClock { tz }, fetch, ThreadHost);

            for task in runtime.tasks {
                ControlCommand::AddTask(task).apply(&mut engine, || switch.callback());
            }
            if let Some(configuration) = runtime.scheduler {
                engine.configure(configuration);
            }
            info!(tasks = engine.task_count(), timezone = tz.name(), "control loop started");

            loop {
                loop {
                    match commands.try_recv() {
                        Ok(command) => {
                            debug!(?command, "applying command");
                            let persist_after = command.touches_configuration();
                            command.apply(&mut engine, || switch.callback());
                            if persist_after {
                                if let Some(configuration) = engine.configuration() {
                                    queue_persist(&persist, configuration.clone());
                                }
                            }
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            info!("command channel closed; stopping control loop");
                            return;
                        }
                    }
                }

                engine.tick();
                status.send_replace(engine.status());

                thread::sleep(Duration::from_millis(CONTROL_LOOP_IDLE_MS));
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let payload = serde_json::to_vec(&*app_state.status.borrow());
            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_SCHEDULER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("scheduler state publish failed: {err}");
                    }
                }
                Err(err) => warn!("scheduler state serialization failed: {err}"),
            }
        }
    });
}

fn queue_persist(
    persist: &mpsc::UnboundedSender<SchedulerConfiguration>,
    configuration: SchedulerConfiguration,
) -> bool {
    if persist.send(configuration).is_err() {
        warn!("persist loop is gone; scheduler configuration not saved");
        return false;
    }
    true
}

fn spawn_persist_loop(store: AppStore, mut updates: mpsc::UnboundedReceiver<SchedulerConfiguration>) {
    tokio::spawn(async move {
        while let Some(configuration) = updates.recv().await {
            if let Err(err) = store.save_scheduler_configuration(configuration).await {
                warn!("failed to persist scheduler configuration: {err:#}");
            }
        }
    });
}

fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
    match ControlCommand::from_mqtt(topic, message) {
        Some(command) => app_state
            .commands
            .send(command)
            .context("control loop is not running"),
        None => {
            debug!(topic, "ignoring mqtt message");
            Ok(())
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().clone())
}

async fn handle_get_config(State(state): State<AppState>) -> axum::response::Response {
    let configuration = state.status.borrow().configuration.clone();
    match configuration {
        Some(configuration) => Json(configuration).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Scheduler is not configured"),
    }
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(configuration): Json<SchedulerConfiguration>,
) -> axum::response::Response {
    let needs_astronomy = state.status.borrow().using_astronomy_data;
    if let Err(err) = configuration.validate(needs_astronomy) {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    queue_command(
        &state,
        ControlCommand::Configure(configuration.clone()),
        Json(configuration),
    )
}

async fn handle_set_enabled(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(enabled) = params.get("value").and_then(|value| parse_flag(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'value' parameter");
    };
    queue_command(&state, ControlCommand::SetEnabled(enabled), StatusCode::ACCEPTED)
}

async fn handle_set_home_only(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(enabled) = params.get("value").and_then(|value| parse_flag(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'value' parameter");
    };
    queue_command(&state, ControlCommand::SetHomeOnly(enabled), StatusCode::ACCEPTED)
}

async fn handle_presence_home(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(id) = device_id_param(&params) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'id' parameter");
    };
    queue_command(&state, ControlCommand::MarkPresent(id), StatusCode::ACCEPTED)
}

async fn handle_presence_away(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(id) = device_id_param(&params) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'id' parameter");
    };
    queue_command(&state, ControlCommand::MarkAway(id), StatusCode::ACCEPTED)
}

async fn handle_presence_reset(State(state): State<AppState>) -> axum::response::Response {
    queue_command(&state, ControlCommand::ResetPresence, StatusCode::ACCEPTED)
}

async fn handle_get_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().tasks.clone())
}

async fn handle_post_task(
    State(state): State<AppState>,
    Json(task): Json<TaskConfig>,
) -> axum::response::Response {
    if let Err(err) = task.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    queue_command(
        &state,
        ControlCommand::AddTask(task.clone()),
        (StatusCode::ACCEPTED, Json(task)),
    )
}

fn queue_command(
    state: &AppState,
    command: ControlCommand,
    ok: impl IntoResponse,
) -> axum::response::Response {
    match state.commands.send(command) {
        Ok(()) => ok.into_response(),
        Err(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Control loop is not running",
        ),
    }
}

fn device_id_param(params: &HashMap<String, String>) -> Option<String> {
    params
        .get("id")
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("SWITCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.switch"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    /// Only the scheduler section is rewritten; tasks added at runtime and
    /// presence are never persisted.
    async fn save_scheduler_configuration(
        &self,
        configuration: SchedulerConfiguration,
    ) -> anyhow::Result<()> {
        let mut runtime = self.load_runtime_config().await?;
        runtime.scheduler = Some(configuration);
        self.save_runtime_config(&runtime).await
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn zone_offset(&self, timestamp: i64) -> i32 {
        zone_offset_hours(&self.tz, timestamp)
    }

    fn is_daylight_saving(&self, timestamp: i64) -> bool {
        is_daylight_saving(&self.tz, timestamp)
    }

    fn millis(&self) -> u64 {
        monotonic_ms()
    }

    fn sync_from_network(&mut self) {
        info!("host clock is disciplined by the operating system; nothing to sync");
    }
}

impl HttpFetch {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetch {
    fn get(&mut self, host: &str, path: &str) -> Result<FetchResponse, FetchError> {
        let url = format!("http://{host}{path}");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(FetchResponse { status, body })
    }
}

impl Host for ThreadHost {
    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    fn network_maintenance(&mut self) {}
}

impl SwitchOutput {
    fn callback(&self) -> EdgeCallback {
        let output = self.clone();
        Box::new(move |event: EventKind| output.set(SwitchState::from(event)))
    }

    fn set(&self, state: SwitchState) {
        info!(state = state.as_str(), "switch output");
        if let Err(err) =
            self.mqtt
                .try_publish(TOPIC_SWITCH_STATE, QoS::AtLeastOnce, true, state.as_str())
        {
            warn!("switch state publish failed: {err}");
        }
    }
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn device_id_param_requires_non_blank_value() {
        let mut params = HashMap::new();
        assert_eq!(device_id_param(&params), None);

        params.insert("id".to_string(), "  ".to_string());
        assert_eq!(device_id_param(&params), None);

        params.insert("id".to_string(), " phone ".to_string());
        assert_eq!(device_id_param(&params), Some("phone".to_string()));
    }

    #[test]
    fn persist_requests_report_a_stopped_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(queue_persist(&tx, SchedulerConfiguration::default()));
        assert_eq!(rx.try_recv().ok(), Some(SchedulerConfiguration::default()));

        drop(rx);
        assert!(!queue_persist(&tx, SchedulerConfiguration::default()));
    }
}
