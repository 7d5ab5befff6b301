use core::convert::TryInto;
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use crate::clock::{is_daylight_saving, monotonic_ms, zone_offset_hours};
use switch_common::{
    command::parse_flag,
    config::{NetworkConfig, SwitchOutputConfig},
    Clock, ControlCommand, EdgeCallback, EventKind, Fetch, FetchError, FetchResponse, Host,
    RuntimeConfig, SchedulerConfiguration, SchedulerEngine, SchedulerStatus, SwitchState,
    TaskConfig, MAX_MQTT_PAYLOAD_BYTES, TOPIC_CMD_ENABLED, TOPIC_CMD_HOME_ONLY,
    TOPIC_CMD_PRESENCE_AWAY, TOPIC_CMD_PRESENCE_HOME, TOPIC_CMD_PRESENCE_RESET,
    TOPIC_SCHEDULER_STATE, TOPIC_SWITCH_STATE,
};

const NVS_NAMESPACE: &str = "switch";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_FETCH_BODY: usize = 16 * 1024;
const FETCH_TIMEOUT_SECS: u64 = 10;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const TIME_SYNC_WAIT_SECS: u64 = 30;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;
const CONTROL_LOOP_IDLE_MS: u64 = 200;

const INDEX_HTML: &str = include_str!("../web/index.html");

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// System time kept by SNTP, viewed through an IANA zone.
struct EspClock {
    tz: Tz,
    sntp: EspSntp<'static>,
}

struct EspFetch;

/// Delays feed the task watchdog and watch for a lasting wifi outage, which
/// also covers the time spent inside the astronomy retry loop.
#[derive(Default)]
struct EspHost {
    wifi_disconnected_since_ms: Option<u64>,
}

/// The relay or LED driven by every task's callback.
struct SwitchPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_high: bool,
    mqtt: SharedMqtt,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
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

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, switch=GPIO{}, tasks={}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.switch.gpio_pin,
        runtime.tasks.len(),
    );

    let tz: Tz = runtime
        .timezone
        .parse()
        .map_err(|err| anyhow!("invalid timezone `{}`: {err}", runtime.timezone))?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    info!("wifi connected");
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let status = Arc::new(Mutex::new(SchedulerStatus::default()));
    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = mpsc::channel();

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(
        command_tx.clone(),
        mqtt_connected.clone(),
        mqtt_conn,
        mqtt_client.clone(),
    )?;
    spawn_control_loop(
        runtime,
        tz,
        nvs_store,
        mqtt_client,
        command_rx,
        status.clone(),
    )?;

    let server = create_http_server(command_tx, status)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
        debug!("mqtt connected: {}", mqtt_connected.load(Ordering::Relaxed));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(
    commands: Sender<ControlCommand>,
    status: Arc<Mutex<SchedulerStatus>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let status = status.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, 200, &snapshot(&status))
        })?;
    }

    {
        let status = status.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            match snapshot(&status).configuration {
                Some(configuration) => write_json(req, 200, &configuration),
                None => write_error(req, 404, "Scheduler is not configured"),
            }
        })?;
    }

    {
        let status = status.clone();
        let commands = commands.clone();
        server.fn_handler("/api/config", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let configuration = match serde_json::from_slice::<SchedulerConfiguration>(&body) {
                Ok(configuration) => configuration,
                Err(err) => return write_error(req, 400, &format!("Invalid JSON: {err}")),
            };
            let needs_astronomy = snapshot(&status).using_astronomy_data;
            if let Err(err) = configuration.validate(needs_astronomy) {
                return write_error(req, 400, &err.to_string());
            }

            queue_command(&commands, ControlCommand::Configure(configuration.clone()))?;
            write_json(req, 200, &configuration)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/enabled", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(enabled) = query_param(&uri, "value").and_then(|value| parse_flag(&value))
            else {
                return write_error(req, 400, "Missing or invalid 'value' parameter");
            };
            queue_command(&commands, ControlCommand::SetEnabled(enabled))?;
            write_accepted(req)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/home-only", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(enabled) = query_param(&uri, "value").and_then(|value| parse_flag(&value))
            else {
                return write_error(req, 400, "Missing or invalid 'value' parameter");
            };
            queue_command(&commands, ControlCommand::SetHomeOnly(enabled))?;
            write_accepted(req)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/presence/home", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(id) = query_param(&uri, "id").filter(|id| !id.trim().is_empty()) else {
                return write_error(req, 400, "Missing 'id' parameter");
            };
            queue_command(&commands, ControlCommand::MarkPresent(id.trim().to_string()))?;
            write_accepted(req)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/presence/away", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(id) = query_param(&uri, "id").filter(|id| !id.trim().is_empty()) else {
                return write_error(req, 400, "Missing 'id' parameter");
            };
            queue_command(&commands, ControlCommand::MarkAway(id.trim().to_string()))?;
            write_accepted(req)
        })?;
    }

    {
        let commands = commands.clone();
        server.fn_handler("/api/presence/reset", Method::Post, move |req| {
            queue_command(&commands, ControlCommand::ResetPresence)?;
            write_accepted(req)
        })?;
    }

    {
        let status = status.clone();
        server.fn_handler("/api/tasks", Method::Get, move |req| {
            write_json(req, 200, &snapshot(&status).tasks)
        })?;
    }

    server.fn_handler("/api/tasks", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let task = match serde_json::from_slice::<TaskConfig>(&body) {
            Ok(task) => task,
            Err(err) => return write_error(req, 400, &format!("Invalid JSON: {err}")),
        };
        if let Err(err) = task.validate() {
            return write_error(req, 400, &err.to_string());
        }
        queue_command(&commands, ControlCommand::AddTask(task.clone()))?;
        write_json(req, 202, &task)
    })?;

    Ok(server)
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

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    write_json(req, status_code, &ErrorBody { error: message })
}

fn write_accepted(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<()> {
    req.into_status_response(202)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn queue_command(commands: &Sender<ControlCommand>, command: ControlCommand) -> anyhow::Result<()> {
    commands
        .send(command)
        .map_err(|_| anyhow!("control loop is not running"))
}

fn snapshot(status: &Mutex<SchedulerStatus>) -> SchedulerStatus {
    status
        .lock()
        .map(|status| status.clone())
        .unwrap_or_default()
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if !has_station_credentials(network) {
        return Err(anyhow!("wifi credentials missing; set WIFI_SSID/WIFI_PASS"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("switch-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let topics = [
        TOPIC_CMD_PRESENCE_HOME,
        TOPIC_CMD_PRESENCE_AWAY,
        TOPIC_CMD_PRESENCE_RESET,
        TOPIC_CMD_ENABLED,
        TOPIC_CMD_HOME_ONLY,
    ];

    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }

    Ok(())
}

fn spawn_mqtt_receiver(
    commands: Sender<ControlCommand>,
    connected: Arc<AtomicBool>,
    mut conn: EspMqttConnection,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    connected.store(true, Ordering::Relaxed);

                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        // Only complete payloads are handled.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        let Ok(message) = core::str::from_utf8(data) else {
                            continue;
                        };
                        if let Some(command) = ControlCommand::from_mqtt(topic, message) {
                            if commands.send(command).is_err() {
                                warn!("control loop is gone; stopping mqtt receiver");
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;

    Ok(())
}

/// Builds and owns the engine. Everything the engine touches stays on this
/// thread; other threads only send commands and read status snapshots.
fn spawn_control_loop(
    runtime: RuntimeConfig,
    tz: Tz,
    nvs_store: NvsStore,
    mqtt: SharedMqtt,
    commands: Receiver<ControlCommand>,
    status: Arc<Mutex<SchedulerStatus>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = run_control_loop(runtime, tz, nvs_store, mqtt, commands, status) {
                warn!("control loop stopped: {err:#}");
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn run_control_loop(
    runtime: RuntimeConfig,
    tz: Tz,
    nvs_store: NvsStore,
    mqtt: SharedMqtt,
    commands: Receiver<ControlCommand>,
    status: Arc<Mutex<SchedulerStatus>>,
) -> anyhow::Result<()> {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    wait_for_time_sync(&sntp);

    let switch = Rc::new(RefCell::new(SwitchPin::new(&runtime.switch, mqtt.clone())?));
    let callback = || -> EdgeCallback {
        let switch = switch.clone();
        Box::new(move |event: EventKind| switch.borrow_mut().set(SwitchState::from(event)))
    };

    let mut engine = SchedulerEngine::new(
        runtime.engine,
        EspClock { tz, sntp },
        EspFetch,
        EspHost::default(),
    );
    for task in runtime.tasks {
        ControlCommand::AddTask(task).apply(&mut engine, callback);
    }
    if let Some(configuration) = runtime.scheduler {
        engine.configure(configuration);
    }
    info!("control loop started with {} tasks", engine.task_count());

    let mut last_state_publish_ms = 0_u64;

    loop {
        engine.host_mut().network_maintenance();
        let now_ms = monotonic_ms();

        loop {
            match commands.try_recv() {
                Ok(command) => {
                    debug!("applying command {command:?}");
                    let persist_after = command.touches_configuration();
                    command.apply(&mut engine, callback);
                    if persist_after {
                        if let Some(configuration) = engine.configuration() {
                            if let Err(err) =
                                nvs_store.save_scheduler_configuration(configuration.clone())
                            {
                                warn!("failed to persist scheduler configuration: {err:#}");
                            }
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(anyhow!("command channel closed"));
                }
            }
        }

        engine.tick();

        let current = engine.status();
        if now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_INTERVAL_MS {
            last_state_publish_ms = now_ms;
            if let Err(err) = publish_status(&mqtt, &current) {
                warn!("scheduler state publish failed: {err:#}");
            }
        }
        if let Ok(mut shared) = status.lock() {
            *shared = current;
        }

        thread::sleep(Duration::from_millis(CONTROL_LOOP_IDLE_MS));
    }
}

fn wait_for_time_sync(sntp: &EspSntp<'static>) {
    for _ in 0..TIME_SYNC_WAIT_SECS {
        if sntp.get_sync_status() == SyncStatus::Completed {
            info!("SNTP time synchronized");
            return;
        }
        feed_watchdog();
        thread::sleep(Duration::from_secs(1));
    }
    warn!("SNTP not synchronized after {TIME_SYNC_WAIT_SECS}s; continuing with system time");
}

fn publish_status(mqtt: &SharedMqtt, status: &SchedulerStatus) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(status)?;
    let mut client = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    client.publish(TOPIC_SCHEDULER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }

    fn save_scheduler_configuration(
        &self,
        configuration: SchedulerConfiguration,
    ) -> anyhow::Result<()> {
        let mut runtime = self.load_runtime_config().unwrap_or_default();
        runtime.scheduler = Some(configuration);
        self.save_runtime_config(&runtime)
    }
}

impl Clock for EspClock {
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

    /// SNTP re-syncs in the background; this only reports where it stands.
    fn sync_from_network(&mut self) {
        match self.sntp.get_sync_status() {
            SyncStatus::Completed => info!("SNTP time is synchronized"),
            other => warn!("SNTP sync not complete: {other:?}"),
        }
    }
}

impl Fetch for EspFetch {
    fn get(&mut self, host: &str, path: &str) -> Result<FetchResponse, FetchError> {
        http_get(&format!("http://{host}{path}"))
            .map_err(|err| FetchError::Transport(format!("{err:#}")))
    }
}

fn http_get(url: &str) -> anyhow::Result<FetchResponse> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(FETCH_TIMEOUT_SECS)),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
    let status = response.status();

    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_FETCH_BODY {
            return Err(anyhow!("response body exceeds {MAX_FETCH_BODY} bytes"));
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok(FetchResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

impl EspHost {
    fn check_wifi(&mut self) {
        let now_ms = monotonic_ms();
        if is_wifi_station_connected() {
            self.wifi_disconnected_since_ms = None;
            return;
        }

        let since_ms = *self.wifi_disconnected_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

impl Host for EspHost {
    fn delay(&mut self, duration: Duration) {
        feed_watchdog();
        self.check_wifi();
        thread::sleep(duration);
    }

    fn network_maintenance(&mut self) {
        feed_watchdog();
        self.check_wifi();
    }
}

impl SwitchPin {
    fn new(config: &SwitchOutputConfig, mqtt: SharedMqtt) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(unsafe { AnyOutputPin::new(config.gpio_pin) })
            .with_context(|| format!("switch output unavailable on GPIO{}", config.gpio_pin))?;
        if config.active_high {
            pin.set_low()?;
        } else {
            pin.set_high()?;
        }
        Ok(Self {
            pin,
            active_high: config.active_high,
            mqtt,
        })
    }

    fn set(&mut self, state: SwitchState) {
        let level_high = (state == SwitchState::On) == self.active_high;
        let result = if level_high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        match result {
            Ok(()) => info!("switch output {}", state.as_str()),
            Err(err) => warn!("failed to drive switch output: {err}"),
        }

        match self.mqtt.lock() {
            Ok(mut client) => {
                let payload = state.as_str().as_bytes();
                if let Err(err) = client.publish(TOPIC_SWITCH_STATE, QoS::AtLeastOnce, true, payload) {
                    warn!("switch state publish failed: {err:?}");
                }
            }
            Err(_) => warn!("mqtt client lock poisoned; switch state not published"),
        }
    }
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
