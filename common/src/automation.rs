use log::{debug, info, warn};

use crate::{
    error::ScheduleError,
    schedule::{evaluate_interval, evaluate_window, Decision, SprayTimer, WindowMode},
    store::{SharedStore, VpStore},
    time_source::TimeSample,
    types::{Channel, ChannelConfig, DutyCycleConfig},
    update::{UpdateRequest, UpdateSender},
    vp::{VpAddress, VpValue},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The clock was not synchronized; nothing was evaluated.
    pub skipped: bool,
    pub triggered: Vec<(Channel, bool)>,
    pub clock_updated: bool,
    pub interval_error: Option<ScheduleError>,
}

/// The sync task's state: drives the schedulers against the store once per tick.
pub struct AutomationEngine {
    store: SharedStore,
    updates: UpdateSender,
    grace_minutes: u16,
    boot_pending: bool,
    last_minute: Option<i32>,
    spray: SprayTimer,
    last_interval_error: Option<ScheduleError>,
}

impl AutomationEngine {
    pub fn new(store: SharedStore, updates: UpdateSender, grace_minutes: u16) -> Self {
        Self {
            store,
            updates,
            grace_minutes,
            boot_pending: true,
            last_minute: None,
            spray: SprayTimer::default(),
            last_interval_error: None,
        }
    }

    pub fn spray_timer(&self) -> SprayTimer {
        self.spray
    }

    pub fn tick(&mut self, now: &TimeSample) -> TickReport {
        let mut report = TickReport::default();
        if !now.is_synchronized {
            report.skipped = true;
            return report;
        }

        let minute = now.minute_of_day();
        let new_minute = self.last_minute != Some(minute);
        self.last_minute = Some(minute);

        if new_minute {
            report.clock_updated = self.update_clock(now);
        }

        if self.boot_pending {
            self.boot_pending = false;
            info!("boot correction at {}", now.clock_text());
            self.evaluate_windows(now, WindowMode::BootCorrect, &mut report);
        } else if new_minute {
            self.evaluate_windows(now, WindowMode::Continuous, &mut report);
        }

        self.evaluate_duty_cycle(now, &mut report);
        report
    }

    fn update_clock(&self, now: &TimeSample) -> bool {
        let changed = self
            .store
            .sync(VpAddress::Time, VpValue::Text(now.clock_text()));
        if changed {
            self.updates.enqueue(UpdateRequest::text(VpAddress::Time));
        }
        changed
    }

    fn evaluate_windows(&mut self, now: &TimeSample, mode: WindowMode, report: &mut TickReport) {
        for channel in Channel::WINDOW {
            let grace = self.grace_minutes;
            let decision = self.store.with(|store| {
                let config = ChannelConfig::load(store, channel);
                let decision = evaluate_window(&config, now.hours, now.minutes, grace, mode);
                apply(store, channel, decision)
            });

            if let Some(desired) = decision {
                info!(
                    "{} turned {} ({} schedule)",
                    channel.as_str(),
                    on_off(desired),
                    mode.as_str()
                );
                self.updates
                    .enqueue(UpdateRequest::value(channel.state_address()));
                report.triggered.push((channel, desired));
            }
        }
    }

    fn evaluate_duty_cycle(&mut self, now: &TimeSample, report: &mut TickReport) {
        let spray = &mut self.spray;
        let result = self.store.with(|store| {
            let config = DutyCycleConfig::load(store);
            evaluate_interval(&config, now, spray)
                .map(|decision| apply(store, Channel::Water, decision))
        });

        match result {
            Ok(Some(desired)) => {
                self.last_interval_error = None;
                info!(
                    "{} turned {} (interval schedule)",
                    Channel::Water.as_str(),
                    on_off(desired)
                );
                self.updates
                    .enqueue(UpdateRequest::value(Channel::Water.state_address()));
                report.triggered.push((Channel::Water, desired));
            }
            Ok(None) => self.last_interval_error = None,
            Err(err) => {
                if self.last_interval_error != Some(err) {
                    warn!("irrigation schedule skipped: {err}");
                } else {
                    debug!("irrigation schedule still invalid: {err}");
                }
                self.last_interval_error = Some(err);
                report.interval_error = Some(err);
            }
        }
    }
}

/// Writes a triggered decision through `sync`. Returns the new state when the store changed.
fn apply(store: &mut VpStore, channel: Channel, decision: Decision) -> Option<bool> {
    if !decision.would_trigger {
        return None;
    }
    store
        .sync(
            channel.state_address(),
            VpValue::Uint(u8::from(decision.desired)),
        )
        .then_some(decision.desired)
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}
