use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use growbox_common::{
    handle_display_event, prepare_store, update_queue, vp::default_hostname, AcquireStep,
    AutomationEngine, ClockHandle, ControllerConfig, DisplayDriver, DisplayError, DisplayEvent,
    HmiDispatcher, NetworkLink, NetworkTask, OutputError, PersistError, Persistence,
    RelayOutputs, SharedStore, TimeBackend, TimeSource, TimeSyncError, UpdateRequest,
    UpdateSender, VpAddress, VpKind, VpStore, VpValue,
};

#[derive(Clone)]
struct AppState {
    store: SharedStore,
    updates: UpdateSender,
    clock: ClockHandle,
    panel: VirtualPanel,
    relays: LoggedRelays,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct EntryView {
    address: String,
    name: &'static str,
    value: VpValue,
}

#[derive(Debug, Deserialize)]
struct PanelInput {
    #[serde(default)]
    value: Option<u16>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct PanelInputResponse {
    changed: bool,
    entry: EntryView,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    queued: bool,
    #[serde(rename = "droppedUpdates")]
    dropped_updates: usize,
}

#[derive(Debug, Serialize)]
struct PanelView {
    cells: Vec<PanelCellView>,
    relays: BTreeMap<u8, bool>,
}

#[derive(Debug, Serialize)]
struct PanelCellView {
    address: String,
    shown: PanelCell,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    state: &'static str,
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    clock: Option<String>,
    #[serde(rename = "utcOffsetMinutes")]
    utc_offset_minutes: i32,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("GROWBOX_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.growbox"));
    let mut config = load_config(&data_dir.join("controller.json")).unwrap_or_else(|err| {
        warn!("failed to load controller config: {err:#}");
        ControllerConfig::default()
    });
    if let Some(offset) = env_parse::<i32>("GROWBOX_UTC_OFFSET_MIN") {
        config.utc_offset_minutes = offset;
    }
    config.sanitize();

    let device_id = env_parse::<u32>("GROWBOX_DEVICE_ID").unwrap_or(0x0001);
    let persistence = JsonFilePersistence::open(data_dir.join("vp.json"))
        .context("failed to open VP store file")?;
    let mut store = VpStore::new(Box::new(persistence), default_hostname(device_id));
    prepare_store(&mut store, &config);
    let store = SharedStore::new(store);

    let (updates, receiver) = update_queue(config.update_queue_capacity);
    updates.enqueue(UpdateRequest::full_refresh());

    let clock = ClockHandle::new(config.utc_offset_minutes);
    let panel = VirtualPanel::default();
    let relays = LoggedRelays::default();

    let dispatcher = HmiDispatcher::new(
        store.clone(),
        updates.clone(),
        panel.clone(),
        relays.clone(),
        config.relays,
        Duration::from_millis(config.hmi_item_delay_ms),
    );
    let hmi_poll = Duration::from_millis(config.hmi_poll_ms.max(10));
    std::thread::Builder::new()
        .name("hmi".to_string())
        .spawn(move || dispatcher.run(receiver, hmi_poll))
        .context("failed to spawn HMI thread")?;

    let time = TimeSource::new(SystemClock, config.time_sync.clone(), clock.clone());
    let network = NetworkTask::new(LoopbackLink, time, store.clone(), updates.clone());
    spawn_network_loop(network, Duration::from_millis(config.network_poll_ms));

    let engine = AutomationEngine::new(store.clone(), updates.clone(), config.grace_minutes);
    spawn_sync_loop(engine, clock.clone(), Duration::from_millis(config.sync_tick_ms));

    let app_state = AppState {
        store,
        updates,
        clock,
        panel,
        relays,
    };

    let app = Router::new()
        .route("/api/vp", get(handle_get_entries))
        .route(
            "/api/vp/{addr}",
            get(handle_get_entry).post(handle_post_entry),
        )
        .route("/api/refresh", post(handle_refresh))
        .route("/api/panel", get(handle_get_panel))
        .route("/api/time", get(handle_get_time))
        .with_state(app_state);

    let port = env_parse::<u16>("GROWBOX_HTTP_PORT").unwrap_or(8080);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("growbox controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("controller stopped");
    Ok(())
}

fn spawn_network_loop(mut network: NetworkTask<LoopbackLink, SystemClock>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(mode) = network.poll(monotonic_ms()) else {
                continue;
            };

            let time = network.time_mut();
            time.begin(mode);
            loop {
                match time.step(monotonic_ms()) {
                    AcquireStep::Synchronized | AcquireStep::GaveUp => break,
                    AcquireStep::RetryAfter(delay) => tokio::time::sleep(delay).await,
                }
            }
        }
    });
}

fn spawn_sync_loop(mut engine: AutomationEngine, clock: ClockHandle, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let report = engine.tick(&clock.sample());
            if !report.triggered.is_empty() {
                debug!("sync tick triggered {:?}", report.triggered);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received, shutting down");
}

async fn handle_get_entries(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<EntryView> = state
        .store
        .snapshot()
        .into_iter()
        .map(|(address, value)| entry_view(address, value))
        .collect();
    Json(entries)
}

async fn handle_get_entry(
    State(state): State<AppState>,
    UrlPath(addr): UrlPath<String>,
) -> impl IntoResponse {
    let Some(address) = parse_address(&addr) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown VP address");
    };
    Json(entry_view(address, state.store.get(address))).into_response()
}

async fn handle_post_entry(
    State(state): State<AppState>,
    UrlPath(addr): UrlPath<String>,
    Json(input): Json<PanelInput>,
) -> impl IntoResponse {
    let Some(address) = parse_address(&addr) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown VP address");
    };

    let event = match (address.kind(), input) {
        (VpKind::Uint8, PanelInput { value: Some(value), .. }) => {
            DisplayEvent::value(address.raw(), value)
        }
        (VpKind::Text { .. }, PanelInput { text: Some(text), .. }) => {
            DisplayEvent::text(address.raw(), text)
        }
        (VpKind::Uint8, _) => {
            return error_response(StatusCode::BAD_REQUEST, "Numeric entry needs 'value'")
        }
        (VpKind::Text { .. }, _) => {
            return error_response(StatusCode::BAD_REQUEST, "Text entry needs 'text'")
        }
    };

    let changed = handle_display_event(&state.store, &state.updates, &event);
    Json(PanelInputResponse {
        changed,
        entry: entry_view(address, state.store.get(address)),
    })
    .into_response()
}

async fn handle_refresh(State(state): State<AppState>) -> impl IntoResponse {
    let queued = state.updates.enqueue(UpdateRequest::full_refresh());
    Json(RefreshResponse {
        queued,
        dropped_updates: state.updates.dropped(),
    })
}

async fn handle_get_panel(State(state): State<AppState>) -> impl IntoResponse {
    let cells = state
        .panel
        .snapshot()
        .into_iter()
        .map(|(address, shown)| PanelCellView {
            address: format!("{address:#06X}"),
            shown,
        })
        .collect();
    Json(PanelView {
        cells,
        relays: state.relays.snapshot(),
    })
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let sample = state.clock.sample();
    Json(TimeStatus {
        state: state.clock.state().as_str(),
        time_synced: sample.is_synchronized,
        clock: sample.is_synchronized.then(|| sample.clock_text()),
        utc_offset_minutes: state.clock.offset().local_minus_utc() / 60,
    })
}

fn entry_view(address: VpAddress, value: VpValue) -> EntryView {
    EntryView {
        address: format!("{:#06X}", address.raw()),
        name: address.as_str(),
        value,
    }
}

/// Accepts `1100`, `0x1100` or an entry name such as `light_state`.
fn parse_address(raw: &str) -> Option<VpAddress> {
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u16::from_str_radix(hex, 16)
        .ok()
        .and_then(VpAddress::from_raw)
        .or_else(|| VpAddress::all().find(|address| address.as_str() == raw))
}

fn load_config(path: &Path) -> anyhow::Result<ControllerConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid config in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(ControllerConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// One JSON object keyed by storage key, rewritten on every save.
struct JsonFilePersistence {
    path: PathBuf,
    entries: BTreeMap<String, VpValue>,
}

impl JsonFilePersistence {
    fn open(path: PathBuf) -> Result<Self, PersistError> {
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&mut self, key: &str, kind: VpKind) -> Result<Option<VpValue>, PersistError> {
        match self.entries.get(key) {
            Some(value) if !value.matches(kind) => Err(PersistError::KindMismatch {
                key: key.to_string(),
            }),
            other => Ok(other.cloned()),
        }
    }

    fn save(&mut self, key: &str, value: &VpValue) -> Result<(), PersistError> {
        self.entries.insert(key.to_string(), value.clone());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
enum PanelCell {
    Value(u8),
    Text(String),
}

/// Stand-in for the touch panel: remembers what each address currently shows.
#[derive(Clone, Default)]
struct VirtualPanel {
    cells: Arc<Mutex<HashMap<u16, PanelCell>>>,
}

impl VirtualPanel {
    fn snapshot(&self) -> BTreeMap<u16, PanelCell> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    fn show(&self, address: u16, cell: PanelCell) {
        debug!("panel {address:#06X} <- {cell:?}");
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, cell);
    }
}

impl DisplayDriver for VirtualPanel {
    fn set_value(&mut self, address: u16, value: u8) -> Result<(), DisplayError> {
        self.show(address, PanelCell::Value(value));
        Ok(())
    }

    fn set_text(&mut self, address: u16, text: &str) -> Result<(), DisplayError> {
        self.show(address, PanelCell::Text(text.to_string()));
        Ok(())
    }
}

/// Relay outputs that only log level changes.
#[derive(Clone, Default)]
struct LoggedRelays {
    levels: Arc<Mutex<BTreeMap<u8, bool>>>,
}

impl LoggedRelays {
    fn snapshot(&self) -> BTreeMap<u8, bool> {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RelayOutputs for LoggedRelays {
    fn write(&mut self, pin: u8, on: bool) -> Result<(), OutputError> {
        let previous = self
            .levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, on);
        if previous != Some(on) {
            info!("relay GPIO{pin} -> {}", if on { "ON" } else { "OFF" });
        }
        Ok(())
    }
}

/// The host clock is trusted as soon as the process starts.
struct SystemClock;

impl TimeBackend for SystemClock {
    fn sync_once(&mut self) -> Result<(), TimeSyncError> {
        Ok(())
    }
}

struct LoopbackLink;

impl NetworkLink for LoopbackLink {
    fn is_associated(&self) -> bool {
        true
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::LOCALHOST)
    }

    fn signal_dbm(&self) -> Option<i8> {
        None
    }
}
