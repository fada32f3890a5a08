use serde::{Deserialize, Serialize};

/// Every configuration field the panel and the controller share. Discriminants index [`VP_TABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VpAddress {
    Time,
    Hostname,
    PlantId,
    TotalCycle,
    GrowthDay,
    GrowthBar,
    GrowthText,
    FirmwareVersion,
    HardwareVersion,

    LightState,
    LightAuto,
    LightOnHour,
    LightOnMinute,
    LightOffHour,
    LightOffMinute,

    WaterState,
    WaterAuto,
    WaterOnHour,
    WaterOnMinute,
    WaterOffHour,
    WaterOffMinute,
    WaterIntervalHours,
    WaterDurationSeconds,

    FanState,
    FanAuto,
    FanOnHour,
    FanOnMinute,
    FanOffHour,
    FanOffMinute,

    WifiState,
    WifiApState,
    WifiSsid,
    WifiPassword,
    IpAddress,
    PasswordOrSignal,

    HolderSsid,
    HolderIp,
    HolderSignal,
    HolderHostname,
    HolderFirmware,
    HolderHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpKind {
    Uint8,
    /// Capacity includes the terminator slot, so at most `capacity - 1` bytes are stored.
    Text { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpItem {
    pub address: VpAddress,
    pub raw: u16,
    pub kind: VpKind,
}

const fn uint(address: VpAddress, raw: u16) -> VpItem {
    VpItem {
        address,
        raw,
        kind: VpKind::Uint8,
    }
}

const fn text(address: VpAddress, raw: u16, capacity: usize) -> VpItem {
    VpItem {
        address,
        raw,
        kind: VpKind::Text { capacity },
    }
}

pub const VP_TABLE: [VpItem; 41] = [
    text(VpAddress::Time, 0x1000, 6),
    text(VpAddress::Hostname, 0x1010, 7),
    uint(VpAddress::PlantId, 0x1020),
    uint(VpAddress::TotalCycle, 0x1030),
    uint(VpAddress::GrowthDay, 0x1040),
    uint(VpAddress::GrowthBar, 0x1050),
    text(VpAddress::GrowthText, 0x1060, 6),
    text(VpAddress::FirmwareVersion, 0x1070, 7),
    text(VpAddress::HardwareVersion, 0x1080, 7),
    uint(VpAddress::LightState, 0x1100),
    uint(VpAddress::LightAuto, 0x1110),
    uint(VpAddress::LightOnHour, 0x1120),
    uint(VpAddress::LightOnMinute, 0x1130),
    uint(VpAddress::LightOffHour, 0x1140),
    uint(VpAddress::LightOffMinute, 0x1150),
    uint(VpAddress::WaterState, 0x1200),
    uint(VpAddress::WaterAuto, 0x1210),
    uint(VpAddress::WaterOnHour, 0x1220),
    uint(VpAddress::WaterOnMinute, 0x1230),
    uint(VpAddress::WaterOffHour, 0x1240),
    uint(VpAddress::WaterOffMinute, 0x1250),
    uint(VpAddress::WaterIntervalHours, 0x1260),
    uint(VpAddress::WaterDurationSeconds, 0x1270),
    uint(VpAddress::FanState, 0x1300),
    uint(VpAddress::FanAuto, 0x1310),
    uint(VpAddress::FanOnHour, 0x1320),
    uint(VpAddress::FanOnMinute, 0x1330),
    uint(VpAddress::FanOffHour, 0x1340),
    uint(VpAddress::FanOffMinute, 0x1350),
    uint(VpAddress::WifiState, 0x1400),
    uint(VpAddress::WifiApState, 0x1410),
    text(VpAddress::WifiSsid, 0x1420, 32),
    text(VpAddress::WifiPassword, 0x1430, 32),
    text(VpAddress::IpAddress, 0x1440, 16),
    text(VpAddress::PasswordOrSignal, 0x1450, 16),
    text(VpAddress::HolderSsid, 0x1500, 16),
    text(VpAddress::HolderIp, 0x1510, 16),
    text(VpAddress::HolderSignal, 0x1520, 16),
    text(VpAddress::HolderHostname, 0x1530, 16),
    text(VpAddress::HolderFirmware, 0x1540, 7),
    text(VpAddress::HolderHardware, 0x1550, 7),
];

impl VpAddress {
    pub fn item(self) -> &'static VpItem {
        &VP_TABLE[self as usize]
    }

    pub fn raw(self) -> u16 {
        self.item().raw
    }

    pub fn kind(self) -> VpKind {
        self.item().kind
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        VP_TABLE
            .iter()
            .find(|item| item.raw == raw)
            .map(|item| item.address)
    }

    /// Persistence key: the address as four upper-case hex digits.
    pub fn storage_key(self) -> String {
        format!("{:04X}", self.raw())
    }

    pub fn all() -> impl Iterator<Item = VpAddress> {
        VP_TABLE.iter().map(|item| item.address)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Hostname => "hostname",
            Self::PlantId => "plant_id",
            Self::TotalCycle => "total_cycle",
            Self::GrowthDay => "growth_day",
            Self::GrowthBar => "growth_bar",
            Self::GrowthText => "growth_text",
            Self::FirmwareVersion => "fw_version",
            Self::HardwareVersion => "hw_version",
            Self::LightState => "light_state",
            Self::LightAuto => "light_auto",
            Self::LightOnHour => "light_on_hr",
            Self::LightOnMinute => "light_on_min",
            Self::LightOffHour => "light_off_hr",
            Self::LightOffMinute => "light_off_min",
            Self::WaterState => "water_state",
            Self::WaterAuto => "water_auto",
            Self::WaterOnHour => "water_on_hr",
            Self::WaterOnMinute => "water_on_min",
            Self::WaterOffHour => "water_off_hr",
            Self::WaterOffMinute => "water_off_min",
            Self::WaterIntervalHours => "water_interval_hr",
            Self::WaterDurationSeconds => "water_duration_sec",
            Self::FanState => "fan_state",
            Self::FanAuto => "fan_auto",
            Self::FanOnHour => "fan_on_hr",
            Self::FanOnMinute => "fan_on_min",
            Self::FanOffHour => "fan_off_hr",
            Self::FanOffMinute => "fan_off_min",
            Self::WifiState => "wifi_state",
            Self::WifiApState => "wifi_ap_state",
            Self::WifiSsid => "wifi_ssid",
            Self::WifiPassword => "wifi_password",
            Self::IpAddress => "ip_address",
            Self::PasswordOrSignal => "password_or_signal",
            Self::HolderSsid => "holder_ssid",
            Self::HolderIp => "holder_ip",
            Self::HolderSignal => "holder_signal",
            Self::HolderHostname => "holder_hostname",
            Self::HolderFirmware => "holder_fw_version",
            Self::HolderHardware => "holder_hw_version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VpValue {
    Uint(u8),
    Text(String),
}

impl VpValue {
    pub fn default_for(kind: VpKind) -> Self {
        match kind {
            VpKind::Uint8 => Self::Uint(0),
            VpKind::Text { .. } => Self::Text(String::new()),
        }
    }

    pub fn matches(&self, kind: VpKind) -> bool {
        matches!(
            (self, kind),
            (Self::Uint(_), VpKind::Uint8) | (Self::Text(_), VpKind::Text { .. })
        )
    }
}

/// Truncates `value` to what a field of `capacity` bytes can hold (`capacity - 1` bytes).
/// Anything after an embedded NUL is dropped, as the panel would.
pub fn fit_text(value: &str, capacity: usize) -> String {
    let value = value.split('\0').next().unwrap_or_default();
    let limit = capacity.saturating_sub(1);
    if value.len() <= limit {
        return value.to_string();
    }

    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Space-pads (or truncates) `value` to exactly `width` bytes for a fixed-width panel field.
pub fn pad_text(value: &str, width: usize) -> String {
    let mut padded = fit_text(value, width.saturating_add(1));
    while padded.len() < width {
        padded.push(' ');
    }
    padded
}

/// Boot-time hostname placeholder derived from the device id.
pub fn default_hostname(device_id: u32) -> String {
    format!("GB{:04X}", device_id & 0xFFFF)
}
