use crate::{store::VpStore, vp::VpAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Light,
    Water,
    Fan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// On/off window with grace-period debounce.
    Window,
    /// Interval spraying inside an active window.
    DutyCycle,
}

/// The VP fields that make up one channel's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddresses {
    pub state: VpAddress,
    pub auto: VpAddress,
    pub on_hour: VpAddress,
    pub on_minute: VpAddress,
    pub off_hour: VpAddress,
    pub off_minute: VpAddress,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Self::Light, Self::Water, Self::Fan];
    pub const WINDOW: [Channel; 2] = [Self::Light, Self::Fan];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Water => "water",
            Self::Fan => "fan",
        }
    }

    pub fn kind(self) -> ChannelKind {
        match self {
            Self::Light | Self::Fan => ChannelKind::Window,
            Self::Water => ChannelKind::DutyCycle,
        }
    }

    pub fn addresses(self) -> ChannelAddresses {
        match self {
            Self::Light => ChannelAddresses {
                state: VpAddress::LightState,
                auto: VpAddress::LightAuto,
                on_hour: VpAddress::LightOnHour,
                on_minute: VpAddress::LightOnMinute,
                off_hour: VpAddress::LightOffHour,
                off_minute: VpAddress::LightOffMinute,
            },
            Self::Water => ChannelAddresses {
                state: VpAddress::WaterState,
                auto: VpAddress::WaterAuto,
                on_hour: VpAddress::WaterOnHour,
                on_minute: VpAddress::WaterOnMinute,
                off_hour: VpAddress::WaterOffHour,
                off_minute: VpAddress::WaterOffMinute,
            },
            Self::Fan => ChannelAddresses {
                state: VpAddress::FanState,
                auto: VpAddress::FanAuto,
                on_hour: VpAddress::FanOnHour,
                on_minute: VpAddress::FanOnMinute,
                off_hour: VpAddress::FanOffHour,
                off_minute: VpAddress::FanOffMinute,
            },
        }
    }

    pub fn state_address(self) -> VpAddress {
        self.addresses().state
    }

    pub fn from_state_address(address: VpAddress) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.state_address() == address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub current_state: bool,
    pub on_hour: u8,
    pub on_minute: u8,
    pub off_hour: u8,
    pub off_minute: u8,
}

impl ChannelConfig {
    pub fn load(store: &VpStore, channel: Channel) -> Self {
        let addresses = channel.addresses();
        Self {
            enabled: store.get_uint(addresses.auto) != 0,
            current_state: store.get_uint(addresses.state) != 0,
            on_hour: store.get_uint(addresses.on_hour),
            on_minute: store.get_uint(addresses.on_minute),
            off_hour: store.get_uint(addresses.off_hour),
            off_minute: store.get_uint(addresses.off_minute),
        }
    }

    pub fn sanitize(&mut self) {
        self.on_hour = self.on_hour.min(23);
        self.on_minute = self.on_minute.min(59);
        self.off_hour = self.off_hour.min(23);
        self.off_minute = self.off_minute.min(59);
    }

    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleConfig {
    pub channel: ChannelConfig,
    pub interval_hours: u8,
    pub duration_seconds: u8,
}

impl DutyCycleConfig {
    pub fn load(store: &VpStore) -> Self {
        Self {
            channel: ChannelConfig::load(store, Channel::Water),
            interval_hours: store.get_uint(VpAddress::WaterIntervalHours),
            duration_seconds: store.get_uint(VpAddress::WaterDurationSeconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::shared_store, vp::VpValue};
    use pretty_assertions::assert_eq;

    #[test]
    fn state_addresses_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(
                Channel::from_state_address(channel.state_address()),
                Some(channel)
            );
        }
        assert_eq!(Channel::from_state_address(VpAddress::LightAuto), None);
    }

    #[test]
    fn loads_window_view_from_store() {
        let (store, _) = shared_store();
        store.sync(VpAddress::FanAuto, VpValue::Uint(1));
        store.sync(VpAddress::FanOnHour, VpValue::Uint(30));
        store.sync(VpAddress::FanOffMinute, VpValue::Uint(15));

        let config = store.with(|store| ChannelConfig::load(store, Channel::Fan));
        assert!(config.enabled);
        assert!(!config.current_state);
        assert_eq!(config.on_hour, 30);

        let config = config.sanitized();
        assert_eq!(config.on_hour, 23);
        assert_eq!(config.off_minute, 15);
    }
}
