use log::info;

use crate::{
    config::ControllerConfig,
    schedule::clamp_schedule_field,
    store::VpStore,
    vp::{VpAddress, VpValue},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootSummary {
    /// Entries that came from persistent storage rather than defaults.
    pub loaded: usize,
    /// Entries rewritten during preparation (versions, clock placeholder, clamped schedule).
    pub corrected: usize,
}

/// Loads the store and brings it into a state the tasks can run against. Call before the
/// store is shared.
pub fn prepare_store(store: &mut VpStore, config: &ControllerConfig) -> BootSummary {
    let loaded = store.load_all();
    let mut corrected = 0;
    let mut fix = |store: &mut VpStore, address: VpAddress, value: VpValue| {
        if store.sync(address, value) {
            corrected += 1;
        }
    };

    fix(
        store,
        VpAddress::FirmwareVersion,
        VpValue::Text(config.firmware_version.clone()),
    );
    fix(
        store,
        VpAddress::HardwareVersion,
        VpValue::Text(config.hardware_version.clone()),
    );
    if store.get_string(VpAddress::Time).is_empty() {
        fix(store, VpAddress::Time, VpValue::Text("00:00".to_string()));
    }

    for address in VpAddress::all() {
        if clamp_schedule_field(store, address) {
            corrected += 1;
        }
    }

    let summary = BootSummary { loaded, corrected };
    info!(
        "store ready: {} loaded, {} corrected; hostname `{}`, fw {}, hw {}; light={} water={} fan={}",
        summary.loaded,
        summary.corrected,
        store.get_string(VpAddress::Hostname),
        store.get_string(VpAddress::FirmwareVersion),
        store.get_string(VpAddress::HardwareVersion),
        store.get_uint(VpAddress::LightState),
        store.get_uint(VpAddress::WaterState),
        store.get_uint(VpAddress::FanState),
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryPersistence;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_device_gets_versions_clock_and_valid_duty_cycle() {
        let persistence = MemoryPersistence::default();
        let mut store = VpStore::new(Box::new(persistence.clone()), "GB00A1".to_string());

        let summary = prepare_store(&mut store, &ControllerConfig::default());

        assert_eq!(summary.loaded, 0);
        assert_eq!(summary.corrected, 5);
        assert_eq!(store.get_string(VpAddress::FirmwareVersion), "v1.0.5");
        assert_eq!(store.get_string(VpAddress::HardwareVersion), "v1.0.0");
        assert_eq!(store.get_string(VpAddress::Time), "00:00");
        assert_eq!(store.get_uint(VpAddress::WaterIntervalHours), 1);
        assert_eq!(store.get_uint(VpAddress::WaterDurationSeconds), 1);
        assert_eq!(persistence.save_count(), 5);
    }

    #[test]
    fn stored_values_are_clamped_and_kept() {
        let persistence = MemoryPersistence::default();
        persistence.insert("1070", VpValue::Text("v1.0.5".to_string()));
        persistence.insert("1080", VpValue::Text("v0.9.0".to_string()));
        persistence.insert("1000", VpValue::Text("13:37".to_string()));
        persistence.insert("1120", VpValue::Uint(31));
        persistence.insert("1260", VpValue::Uint(4));
        persistence.insert("1270", VpValue::Uint(150));
        let mut store = VpStore::new(Box::new(persistence.clone()), "GB00A1".to_string());

        let summary = prepare_store(&mut store, &ControllerConfig::default());

        assert_eq!(summary.loaded, 6);
        assert_eq!(summary.corrected, 3);
        assert_eq!(store.get_string(VpAddress::HardwareVersion), "v1.0.0");
        assert_eq!(store.get_string(VpAddress::Time), "13:37");
        assert_eq!(store.get_uint(VpAddress::LightOnHour), 23);
        assert_eq!(store.get_uint(VpAddress::WaterIntervalHours), 4);
        assert_eq!(store.get_uint(VpAddress::WaterDurationSeconds), 99);
    }
}
