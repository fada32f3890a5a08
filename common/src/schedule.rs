use std::ops::RangeInclusive;

use crate::{
    error::ScheduleError,
    store::VpStore,
    time_source::TimeSample,
    types::{ChannelConfig, DutyCycleConfig},
    vp::{VpAddress, VpValue},
};

pub const MINUTES_PER_DAY: i32 = 24 * 60;
pub const SECONDS_PER_DAY: u32 = 24 * 3600;
pub const DURATION_RANGE: RangeInclusive<u8> = 1..=99;
pub const INTERVAL_RANGE: RangeInclusive<u8> = 1..=12;

/// Range a stored schedule field must stay in. `None` for entries that are not schedule fields.
pub fn schedule_range(address: VpAddress) -> Option<RangeInclusive<u8>> {
    use VpAddress::*;
    match address {
        LightOnHour | LightOffHour | WaterOnHour | WaterOffHour | FanOnHour | FanOffHour => {
            Some(0..=23)
        }
        LightOnMinute | LightOffMinute | WaterOnMinute | WaterOffMinute | FanOnMinute
        | FanOffMinute => Some(0..=59),
        WaterIntervalHours => Some(INTERVAL_RANGE),
        WaterDurationSeconds => Some(DURATION_RANGE),
        _ => None,
    }
}

/// Clamps a schedule field back into [`schedule_range`] through `sync`.
/// Returns whether the stored value had to change.
pub fn clamp_schedule_field(store: &mut VpStore, address: VpAddress) -> bool {
    let Some(range) = schedule_range(address) else {
        return false;
    };
    let value = store.get_uint(address).clamp(*range.start(), *range.end());
    store.sync(address, VpValue::Uint(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Periodic evaluation: only reacts within the grace period after an edge.
    Continuous,
    /// One-shot evaluation at startup: state follows window membership directly.
    BootCorrect,
}

impl WindowMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::BootCorrect => "boot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub would_trigger: bool,
    pub desired: bool,
}

impl Decision {
    fn keep(current: bool) -> Self {
        Self {
            would_trigger: false,
            desired: current,
        }
    }

    fn toward(current: bool, desired: bool) -> Self {
        Self {
            would_trigger: current != desired,
            desired,
        }
    }
}

/// An on/off window in minutes of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// `on == off`: the channel has nothing to do.
    Degenerate,
    SameDay { on: i32, off: i32 },
    Overnight { on: i32, off: i32 },
}

impl Window {
    pub fn from_config(config: &ChannelConfig) -> Self {
        let config = config.sanitized();
        let on = minute_of_day(config.on_hour.into(), config.on_minute.into());
        let off = minute_of_day(config.off_hour.into(), config.off_minute.into());

        if on == off {
            Self::Degenerate
        } else if on < off {
            Self::SameDay { on, off }
        } else {
            Self::Overnight { on, off }
        }
    }

    /// Half-open membership: `[on, off)`, wrapping midnight for overnight windows.
    pub fn contains(&self, minute: i32) -> bool {
        match *self {
            Self::Degenerate => false,
            Self::SameDay { on, off } => minute >= on && minute < off,
            Self::Overnight { on, off } => minute >= on || minute < off,
        }
    }
}

pub fn minute_of_day(hour: i32, minute: i32) -> i32 {
    hour.clamp(0, 23) * 60 + minute.clamp(0, 59)
}

fn minutes_since(now: i32, edge: i32) -> i32 {
    (now - edge + MINUTES_PER_DAY).rem_euclid(MINUTES_PER_DAY)
}

/// Decides the state of a window channel at `now_hour:now_minute`.
pub fn evaluate_window(
    config: &ChannelConfig,
    now_hour: i32,
    now_minute: i32,
    grace_minutes: u16,
    mode: WindowMode,
) -> Decision {
    let current = config.current_state;
    if !config.enabled {
        return Decision::keep(current);
    }

    let window = Window::from_config(config);
    let (on, off) = match window {
        Window::Degenerate => return Decision::keep(current),
        Window::SameDay { on, off } | Window::Overnight { on, off } => (on, off),
    };
    let now = minute_of_day(now_hour, now_minute);

    match mode {
        WindowMode::BootCorrect => Decision::toward(current, window.contains(now)),
        WindowMode::Continuous => {
            let grace = i32::from(grace_minutes);
            if !current && minutes_since(now, on) <= grace {
                Decision::toward(current, true)
            } else if current && minutes_since(now, off) <= grace {
                Decision::toward(current, false)
            } else {
                Decision::keep(current)
            }
        }
    }
}

/// Seconds-of-day at which the duty-cycle channel last changed state inside its window.
/// Zero means no spray since the last window exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SprayTimer {
    pub last_spray_epoch: u32,
}

impl SprayTimer {
    pub fn is_idle(&self) -> bool {
        self.last_spray_epoch == 0
    }
}

/// Decides the duty-cycle channel state and advances `timer`.
///
/// Out-of-range duration or interval is rejected without touching `timer`.
pub fn evaluate_interval(
    config: &DutyCycleConfig,
    now: &TimeSample,
    timer: &mut SprayTimer,
) -> Result<Decision, ScheduleError> {
    if !DURATION_RANGE.contains(&config.duration_seconds) {
        return Err(ScheduleError::DurationOutOfRange(config.duration_seconds));
    }
    if !INTERVAL_RANGE.contains(&config.interval_hours) {
        return Err(ScheduleError::IntervalOutOfRange(config.interval_hours));
    }

    let current = config.channel.current_state;
    if !config.channel.enabled {
        return Ok(Decision::keep(current));
    }

    let window = Window::from_config(&config.channel);
    if !window.contains(now.minute_of_day()) {
        timer.last_spray_epoch = 0;
        return Ok(Decision::toward(current, false));
    }

    let now_epoch = now.second_of_day();
    if timer.is_idle() {
        // Zero marks an idle timer, so a start at exactly midnight is recorded at 00:00:01.
        timer.last_spray_epoch = now_epoch.max(1);
        return Ok(Decision::toward(current, true));
    }

    let last = timer.last_spray_epoch;
    let elapsed = if now_epoch >= last {
        now_epoch - last
    } else {
        (SECONDS_PER_DAY - last) + now_epoch
    };

    if current && elapsed >= u32::from(config.duration_seconds) {
        timer.last_spray_epoch = now_epoch;
        Ok(Decision::toward(current, false))
    } else if !current && elapsed >= u32::from(config.interval_hours) * 3600 {
        timer.last_spray_epoch = now_epoch;
        Ok(Decision::toward(current, true))
    } else {
        Ok(Decision::keep(current))
    }
}
