use log::{debug, info, warn};

use crate::{
    schedule::{clamp_schedule_field, schedule_range},
    store::{SharedStore, VpStore},
    types::Channel,
    update::{UpdateRequest, UpdateSender},
    vp::{VpAddress, VpKind, VpValue},
};

/// A user-initiated change reported by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEvent {
    pub address: u16,
    pub numeric: u16,
    pub text: String,
}

impl DisplayEvent {
    pub fn value(address: u16, numeric: u16) -> Self {
        Self {
            address,
            numeric,
            text: String::new(),
        }
    }

    pub fn text(address: u16, text: impl Into<String>) -> Self {
        Self {
            address,
            numeric: 0,
            text: text.into(),
        }
    }
}

/// Growth progress on the panel's 20-segment bar. Always at least one segment.
pub fn growth_bar(day: u8, total: u8) -> u8 {
    if total == 0 {
        return 1;
    }
    let bar = (f32::from(day) / f32::from(total) * 20.0).round();
    bar.clamp(1.0, 20.0) as u8
}

pub fn growth_text(day: u8, total: u8) -> String {
    format!("{day}/{total}")
}

/// Applies a panel event to the store through `sync` and queues the follow-up refreshes.
/// Returns whether the store changed.
pub fn handle_display_event(
    store: &SharedStore,
    updates: &UpdateSender,
    event: &DisplayEvent,
) -> bool {
    let Some(address) = VpAddress::from_raw(event.address) else {
        debug!("ignoring panel event for unknown address {:#06X}", event.address);
        return false;
    };

    let value = match address.kind() {
        VpKind::Uint8 => VpValue::Uint((event.numeric & 0xFF) as u8),
        VpKind::Text { .. } => VpValue::Text(event.text.clone()),
    };

    let follow_ups = store.with(|store| {
        if !store.sync(address, value) {
            return None;
        }
        Some(follow_ups_for(store, address))
    });

    let Some(follow_ups) = follow_ups else {
        return false;
    };

    debug!("panel changed {}", address.as_str());
    for request in follow_ups {
        updates.enqueue(request);
    }
    true
}

fn follow_ups_for(store: &mut VpStore, address: VpAddress) -> Vec<UpdateRequest> {
    if schedule_range(address).is_some() {
        // The evaluators reject out-of-range values, so they never reach a tick.
        if clamp_schedule_field(store, address) {
            warn!(
                "{} from panel out of range, stored {}",
                address.as_str(),
                store.get_uint(address)
            );
            return vec![UpdateRequest::value(address)];
        }
        return Vec::new();
    }

    match address {
        VpAddress::TotalCycle | VpAddress::GrowthDay => {
            let day = store.get_uint(VpAddress::GrowthDay);
            let total = store.get_uint(VpAddress::TotalCycle);
            let mut requests = Vec::with_capacity(2);
            if store.sync(VpAddress::GrowthBar, VpValue::Uint(growth_bar(day, total))) {
                requests.push(UpdateRequest::value(VpAddress::GrowthBar));
            }
            if store.sync(VpAddress::GrowthText, VpValue::Text(growth_text(day, total))) {
                requests.push(UpdateRequest::text(VpAddress::GrowthText));
            }
            requests
        }
        _ => match Channel::from_state_address(address) {
            Some(channel) => {
                info!(
                    "{} switched {} from panel",
                    channel.as_str(),
                    if store.get_uint(address) != 0 { "on" } else { "off" }
                );
                vec![UpdateRequest::value(address)]
            }
            None => Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::shared_store, update::update_queue};
    use pretty_assertions::assert_eq;

    #[test]
    fn growth_bar_is_clamped_to_segments() {
        assert_eq!(growth_bar(0, 0), 1);
        assert_eq!(growth_bar(0, 90), 1);
        assert_eq!(growth_bar(45, 90), 10);
        assert_eq!(growth_bar(89, 90), 20);
        assert_eq!(growth_bar(200, 90), 20);
    }

    #[test]
    fn growth_day_change_updates_bar_and_text() {
        let (store, persistence) = shared_store();
        let (tx, rx) = update_queue(8);
        store.sync(VpAddress::TotalCycle, VpValue::Uint(60));

        assert!(handle_display_event(
            &store,
            &tx,
            &DisplayEvent::value(0x1040, 15)
        ));

        assert_eq!(store.get_uint(VpAddress::GrowthBar), 5);
        assert_eq!(store.get_string(VpAddress::GrowthText), "15/60");
        assert_eq!(persistence.stored("1050"), Some(VpValue::Uint(5)));
        assert_eq!(
            rx.drain(),
            vec![
                UpdateRequest::value(VpAddress::GrowthBar),
                UpdateRequest::text(VpAddress::GrowthText),
            ]
        );
    }

    #[test]
    fn relay_state_change_queues_output_refresh() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(8);

        assert!(handle_display_event(&store, &tx, &DisplayEvent::value(0x1300, 1)));
        assert_eq!(rx.drain(), vec![UpdateRequest::value(VpAddress::FanState)]);

        // Repeating the same press is a no-op.
        assert!(!handle_display_event(&store, &tx, &DisplayEvent::value(0x1300, 1)));
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn text_event_is_truncated_to_capacity() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(8);

        assert!(handle_display_event(
            &store,
            &tx,
            &DisplayEvent::text(0x1010, "greenhouse-7")
        ));
        assert_eq!(store.get_string(VpAddress::Hostname), "greenh");
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn growth_refresh_skips_unchanged_entries() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(8);
        store.sync(VpAddress::TotalCycle, VpValue::Uint(60));
        assert!(handle_display_event(&store, &tx, &DisplayEvent::value(0x1040, 15)));
        rx.drain();

        // 16/60 still rounds to five segments; only the text moves.
        assert!(handle_display_event(&store, &tx, &DisplayEvent::value(0x1040, 16)));

        assert_eq!(store.get_uint(VpAddress::GrowthBar), 5);
        assert_eq!(rx.drain(), vec![UpdateRequest::text(VpAddress::GrowthText)]);
    }

    #[test]
    fn out_of_range_schedule_input_is_clamped() {
        let (store, persistence) = shared_store();
        let (tx, rx) = update_queue(8);
        store.sync(VpAddress::WaterDurationSeconds, VpValue::Uint(30));
        store.sync(VpAddress::WaterIntervalHours, VpValue::Uint(2));

        let cases = [
            (0x1270, 0, VpAddress::WaterDurationSeconds, 1),
            (0x1270, 100, VpAddress::WaterDurationSeconds, 99),
            (0x1260, 0, VpAddress::WaterIntervalHours, 1),
            (0x1260, 13, VpAddress::WaterIntervalHours, 12),
            (0x1120, 30, VpAddress::LightOnHour, 23),
            (0x1350, 75, VpAddress::FanOffMinute, 59),
        ];
        for (raw, input, address, stored) in cases {
            assert!(handle_display_event(&store, &tx, &DisplayEvent::value(raw, input)));
            assert_eq!(store.get_uint(address), stored);
            assert_eq!(
                persistence.stored(&address.storage_key()),
                Some(VpValue::Uint(stored))
            );
            assert_eq!(rx.drain(), vec![UpdateRequest::value(address)]);
        }
    }

    #[test]
    fn in_range_schedule_input_is_stored_as_is() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(8);

        assert!(handle_display_event(&store, &tx, &DisplayEvent::value(0x1270, 45)));

        assert_eq!(store.get_uint(VpAddress::WaterDurationSeconds), 45);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn unknown_address_is_ignored() {
        let (store, persistence) = shared_store();
        let (tx, rx) = update_queue(8);

        assert!(!handle_display_event(&store, &tx, &DisplayEvent::value(0x2000, 1)));
        assert_eq!(persistence.save_count(), 0);
        assert!(rx.drain().is_empty());
    }
}
