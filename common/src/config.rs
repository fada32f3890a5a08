use serde::{Deserialize, Serialize};

use crate::vp::VpAddress;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSyncConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub refresh_interval_ms: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            refresh_interval_ms: 3_600_000,
        }
    }
}

impl TimeSyncConfig {
    pub fn sanitize(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.base_delay_ms = self.base_delay_ms.clamp(100, 60_000);
        self.max_delay_ms = self.max_delay_ms.max(self.base_delay_ms);
        self.refresh_interval_ms = self.refresh_interval_ms.max(60_000);
    }
}

/// GPIO numbers driven by each channel's state address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayPins {
    pub light: u8,
    pub water: u8,
    pub fan: u8,
}

impl Default for RelayPins {
    fn default() -> Self {
        Self {
            light: 23,
            water: 22,
            fan: 21,
        }
    }
}

impl RelayPins {
    pub fn pin_for(&self, address: VpAddress) -> Option<u8> {
        match address {
            VpAddress::LightState => Some(self.light),
            VpAddress::WaterState => Some(self.water),
            VpAddress::FanState => Some(self.fan),
            _ => None,
        }
    }

    pub fn all(&self) -> [u8; 3] {
        [self.light, self.water, self.fan]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub sync_tick_ms: u64,
    pub grace_minutes: u16,
    pub update_queue_capacity: usize,
    pub hmi_item_delay_ms: u64,
    pub hmi_poll_ms: u64,
    pub network_poll_ms: u64,
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub time_sync: TimeSyncConfig,
    #[serde(default)]
    pub relays: RelayPins,
    pub firmware_version: String,
    pub hardware_version: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_tick_ms: 500,
            grace_minutes: 5,
            update_queue_capacity: 32,
            hmi_item_delay_ms: 30,
            hmi_poll_ms: 1,
            network_poll_ms: 100,
            utc_offset_minutes: 0,
            time_sync: TimeSyncConfig::default(),
            relays: RelayPins::default(),
            firmware_version: "v1.0.5".to_string(),
            hardware_version: "v1.0.0".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.sync_tick_ms = self.sync_tick_ms.clamp(100, 5_000);
        self.grace_minutes = self.grace_minutes.clamp(1, 60);
        self.update_queue_capacity = self.update_queue_capacity.clamp(4, 256);
        self.hmi_item_delay_ms = self.hmi_item_delay_ms.min(500);
        self.hmi_poll_ms = self.hmi_poll_ms.clamp(1, 100);
        self.network_poll_ms = self.network_poll_ms.clamp(10, 10_000);
        self.utc_offset_minutes = self.utc_offset_minutes.clamp(-12 * 60, 14 * 60);
        self.time_sync.sanitize();
    }
}
