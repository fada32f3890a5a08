use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    cpu::Core,
    delay::NON_BLOCK,
    gpio::{AnyInputPin, AnyOutputPin, Output, PinDriver},
    task::thread::ThreadSpawnConfiguration,
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use growbox_common::{
    prepare_store, station_wanted, update_queue, vp::default_hostname, AutomationEngine,
    ClockHandle, ControllerConfig, DisplayDriver, DisplayError, DisplayEvent, HmiDispatcher,
    NetworkLink, NetworkTask, OutputError, PersistError, Persistence, RelayOutputs, SharedStore,
    TimeBackend, TimeSource, TimeSyncError, UpdateRequest, VpAddress, VpKind, VpStore, VpValue,
};

use crate::dwin::{self, FrameDecoder};

const NVS_NAMESPACE: &str = "vp-flash";
const DWIN_BAUD: u32 = 115_200;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_INTERVAL_MS: u64 = 30_000;
const UART_READ_CHUNK: usize = 64;

struct TaskSpec {
    name: &'static str,
    c_name: &'static [u8],
    priority: u8,
    core: Core,
    stack_size: usize,
}

const HMI_TASK: TaskSpec = TaskSpec {
    name: "hmi",
    c_name: b"hmi\0",
    priority: 3,
    core: Core::Core1,
    stack_size: 8 * 1024,
};

const NETWORK_TASK: TaskSpec = TaskSpec {
    name: "network",
    c_name: b"network\0",
    priority: 2,
    core: Core::Core0,
    stack_size: 8 * 1024,
};

const SYNC_TASK: TaskSpec = TaskSpec {
    name: "sync",
    c_name: b"sync\0",
    priority: 1,
    core: Core::Core1,
    stack_size: 8 * 1024,
};

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = ControllerConfig::default();
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, uart2, pins, ..
    } = Peripherals::take()?;

    let persistence = NvsPersistence::open(nvs_partition.clone())
        .context("failed to open VP namespace in NVS")?;
    let mut store = VpStore::new(Box::new(persistence), default_hostname(device_id()));
    prepare_store(&mut store, &config);
    let credentials = WifiCredentials {
        wanted: station_wanted(&store),
        ssid: store.get_string(VpAddress::WifiSsid).to_string(),
        password: store.get_string(VpAddress::WifiPassword).to_string(),
    };
    let store = SharedStore::new(store);

    let uart = UartDriver::new(
        uart2,
        pins.gpio17,
        pins.gpio16,
        AnyInputPin::none(),
        AnyOutputPin::none(),
        &UartConfig::new().baudrate(Hertz(DWIN_BAUD)),
    )
    .context("failed to open DWIN UART")?;
    let display = DwinDisplay::new(uart);
    let relays = GpioRelays::new(&config.relays.all()).context("failed to claim relay pins")?;
    info!(
        "DWIN panel on UART2 @ {DWIN_BAUD}; relays on GPIO {:?}",
        config.relays.all()
    );

    let (updates, receiver) = update_queue(config.update_queue_capacity);
    updates.enqueue(UpdateRequest::full_refresh());

    let dispatcher = HmiDispatcher::new(
        store.clone(),
        updates.clone(),
        display,
        relays,
        config.relays,
        Duration::from_millis(config.hmi_item_delay_ms),
    );
    let hmi_poll = Duration::from_millis(config.hmi_poll_ms);
    spawn_task(&HMI_TASK, move || dispatcher.run(receiver, hmi_poll))?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &credentials)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let clock = ClockHandle::new(config.utc_offset_minutes);
    let time = TimeSource::new(
        SntpBackend { sntp },
        config.time_sync.clone(),
        clock.clone(),
    );
    let link = WifiLink {
        wifi,
        store: store.clone(),
        has_credentials: credentials.is_usable(),
        last_reconnect_ms: 0,
    };
    let mut network = NetworkTask::new(link, time, store.clone(), updates.clone());
    let network_poll = Duration::from_millis(config.network_poll_ms);
    spawn_task(&NETWORK_TASK, move || loop {
        network.poll_blocking(monotonic_ms, thread::sleep);
        network.link_mut().maybe_reconnect(monotonic_ms());
        thread::sleep(network_poll);
    })?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mut engine = AutomationEngine::new(store, updates, config.grace_minutes);
    let sync_tick = Duration::from_millis(config.sync_tick_ms);
    spawn_task(&SYNC_TASK, move || {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("failed to register sync task with watchdog: {err:#}");
        }
        loop {
            feed_watchdog();
            engine.tick(&clock.sample());
            thread::sleep(sync_tick);
        }
    })?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Spawns a std thread with the FreeRTOS priority and core affinity of `task`.
fn spawn_task<F>(task: &TaskSpec, body: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    ThreadSpawnConfiguration {
        name: Some(task.c_name),
        stack_size: task.stack_size,
        priority: task.priority,
        pin_to_core: Some(task.core),
        ..Default::default()
    }
    .set()
    .with_context(|| format!("failed to configure {} task", task.name))?;

    let spawned = thread::Builder::new()
        .name(task.name.to_string())
        .stack_size(task.stack_size)
        .spawn(body);

    ThreadSpawnConfiguration::default()
        .set()
        .context("failed to reset thread spawn configuration")?;
    spawned.with_context(|| format!("failed to spawn {} task", task.name))?;
    info!(
        "{} task started (priority {}, {:?})",
        task.name, task.priority, task.core
    );
    Ok(())
}

struct NvsPersistence {
    nvs: EspNvs<NvsDefault>,
}

impl NvsPersistence {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
        })
    }
}

impl Persistence for NvsPersistence {
    fn load(&mut self, key: &str, kind: VpKind) -> Result<Option<VpValue>, PersistError> {
        let loaded = match kind {
            VpKind::Uint8 => self.nvs.get_u8(key).map(|value| value.map(VpValue::Uint)),
            VpKind::Text { capacity } => {
                let mut buffer = vec![0_u8; capacity + 1];
                self.nvs
                    .get_str(key, &mut buffer)
                    .map(|value| value.map(|text| VpValue::Text(text.to_string())))
            }
        };
        loaded.map_err(|err| PersistError::Backend(format!("load `{key}`: {err}")))
    }

    fn save(&mut self, key: &str, value: &VpValue) -> Result<(), PersistError> {
        let saved = match value {
            VpValue::Uint(value) => self.nvs.set_u8(key, *value),
            VpValue::Text(text) => self.nvs.set_str(key, text),
        };
        saved.map_err(|err| PersistError::Backend(format!("save `{key}`: {err}")))
    }
}

/// DWIN DGUS panel on a UART: writes VP frames and decodes touch uploads.
struct DwinDisplay {
    uart: UartDriver<'static>,
    decoder: FrameDecoder,
}

impl DwinDisplay {
    fn new(uart: UartDriver<'static>) -> Self {
        Self {
            uart,
            decoder: FrameDecoder::default(),
        }
    }

    fn write_frame(&mut self, address: u16, frame: &[u8]) -> Result<(), DisplayError> {
        let mut remaining = frame;
        while !remaining.is_empty() {
            let written = self.uart.write(remaining).map_err(|err| DisplayError::Write {
                address,
                reason: err.to_string(),
            })?;
            remaining = &remaining[written..];
        }
        Ok(())
    }
}

impl DisplayDriver for DwinDisplay {
    fn set_value(&mut self, address: u16, value: u8) -> Result<(), DisplayError> {
        let frame = dwin::encode_value(address, value);
        self.write_frame(address, &frame)
    }

    fn set_text(&mut self, address: u16, text: &str) -> Result<(), DisplayError> {
        let frame = dwin::encode_text(address, text).map_err(|err| DisplayError::Write {
            address,
            reason: err.to_string(),
        })?;
        self.write_frame(address, &frame)
    }

    fn poll_events(&mut self) -> Vec<DisplayEvent> {
        let mut events = Vec::new();
        let mut chunk = [0_u8; UART_READ_CHUNK];
        loop {
            match self.uart.read(&mut chunk, NON_BLOCK) {
                Ok(0) => break,
                Ok(read) => events.extend(self.decoder.feed(&chunk[..read])),
                Err(err) => {
                    warn!("DWIN UART read failed: {err}");
                    break;
                }
            }
        }
        events
    }
}

struct GpioRelays {
    outputs: Vec<(u8, PinDriver<'static, AnyOutputPin, Output>)>,
}

impl GpioRelays {
    fn new(pins: &[u8]) -> anyhow::Result<Self> {
        let mut outputs = Vec::with_capacity(pins.len());
        for &pin in pins {
            let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(pin))) }
                .with_context(|| format!("failed to drive GPIO{pin}"))?;
            driver.set_low()?;
            outputs.push((pin, driver));
        }
        Ok(Self { outputs })
    }
}

impl RelayOutputs for GpioRelays {
    fn write(&mut self, pin: u8, on: bool) -> Result<(), OutputError> {
        let (_, driver) = self
            .outputs
            .iter_mut()
            .find(|(candidate, _)| *candidate == pin)
            .ok_or(OutputError::UnknownPin { pin })?;
        let result = if on {
            driver.set_high()
        } else {
            driver.set_low()
        };
        result.map_err(|err| OutputError::Write {
            pin,
            reason: err.to_string(),
        })
    }
}

/// SNTP runs in the background; an attempt succeeds once it reports a completed sync.
struct SntpBackend {
    sntp: EspSntp<'static>,
}

impl TimeBackend for SntpBackend {
    fn sync_once(&mut self) -> Result<(), TimeSyncError> {
        match self.sntp.get_sync_status() {
            SyncStatus::Completed => Ok(()),
            status => Err(TimeSyncError::Attempt(format!("SNTP status {status:?}"))),
        }
    }
}

struct WifiCredentials {
    /// Panel switch on and an SSID stored.
    wanted: bool,
    ssid: String,
    password: String,
}

impl WifiCredentials {
    fn is_usable(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

struct WifiLink {
    wifi: EspWifi<'static>,
    store: SharedStore,
    has_credentials: bool,
    last_reconnect_ms: u64,
}

impl WifiLink {
    fn ap_record() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
    }

    /// Asks the driver to re-associate, at most once per reconnect interval, while the
    /// station switch is on.
    fn maybe_reconnect(&mut self, now_ms: u64) {
        if !self.has_credentials || self.is_associated() {
            return;
        }
        if !self.store.with(|store| station_wanted(store)) {
            return;
        }
        if now_ms.saturating_sub(self.last_reconnect_ms) < WIFI_RECONNECT_INTERVAL_MS {
            return;
        }
        self.last_reconnect_ms = now_ms;
        info!("wifi station disconnected, reconnecting");
        if let Err(err) = self.wifi.connect() {
            warn!("wifi reconnect request failed: {err}");
        }
    }
}

impl NetworkLink for WifiLink {
    fn is_associated(&self) -> bool {
        Self::ap_record().is_some()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn signal_dbm(&self) -> Option<i8> {
        Self::ap_record().map(|record| record.rssi)
    }
}

/// Starts the station and, when the panel's station switch is on, tries the stored
/// credentials. A failed association is not fatal:
/// the network task keeps retrying and the panel shows the link as down.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: &WifiCredentials,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !credentials.is_usable() {
        warn!("no wifi credentials stored; running offline");
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        return Ok(esp_wifi);
    }

    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
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

    wifi.start()?;
    if !credentials.wanted {
        warn!("wifi station switched off on the panel; not associating");
        return Ok(esp_wifi);
    }
    info!("wifi started, connecting to `{}`", credentials.ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; continuing offline");
    Ok(esp_wifi)
}

/// Low 16 bits of the factory MAC, used for the default hostname.
fn device_id() -> u32 {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC (code {rc})");
        return 0;
    }
    u32::from(u16::from_be_bytes([mac[4], mac[5]]))
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
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
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
