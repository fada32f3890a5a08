use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Timelike, Utc};
use log::{info, warn};

use crate::{config::TimeSyncConfig, error::TimeSyncError};

/// Wall-clock snapshot handed to the schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub hours: i32,
    pub minutes: i32,
    pub seconds: i32,
    pub is_synchronized: bool,
}

impl TimeSample {
    pub fn unsynchronized() -> Self {
        Self {
            hours: 0,
            minutes: 0,
            seconds: 0,
            is_synchronized: false,
        }
    }

    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            hours: now.hour() as i32,
            minutes: now.minute() as i32,
            seconds: now.second() as i32,
            is_synchronized: true,
        }
    }

    pub fn minute_of_day(&self) -> i32 {
        self.hours * 60 + self.minutes
    }

    pub fn second_of_day(&self) -> u32 {
        let seconds = self.hours * 3600 + self.minutes * 60 + self.seconds;
        seconds.clamp(0, 86_399) as u32
    }

    /// `HH:MM`, as shown in the panel's clock field.
    pub fn clock_text(&self) -> String {
        format!("{:02}:{:02}", self.hours, self.minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Unsynchronized = 0,
    Synchronizing = 1,
    Synchronized = 2,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Synchronized,
            1 => Self::Synchronizing,
            _ => Self::Unsynchronized,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsynchronized => "unsynchronized",
            Self::Synchronizing => "synchronizing",
            Self::Synchronized => "synchronized",
        }
    }
}

/// One synchronization attempt against the platform clock service (SNTP, host clock).
pub trait TimeBackend: Send {
    fn sync_once(&mut self) -> Result<(), TimeSyncError>;
}

struct ClockInner {
    state: AtomicU8,
    valid: AtomicBool,
    offset_seconds: AtomicI32,
}

/// Read side of the time source, cheap to clone into every task.
///
/// Samples stay synchronized while a periodic refresh is in flight; only an initial
/// acquisition or a forced resync that gives up invalidates them.
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<ClockInner>,
}

impl ClockHandle {
    pub fn new(utc_offset_minutes: i32) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                state: AtomicU8::new(SyncState::Unsynchronized as u8),
                valid: AtomicBool::new(false),
                offset_seconds: AtomicI32::new(utc_offset_minutes.saturating_mul(60)),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_synchronized(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> FixedOffset {
        let seconds = self.inner.offset_seconds.load(Ordering::Relaxed);
        FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
    }

    pub fn sample(&self) -> TimeSample {
        self.sample_at(Utc::now())
    }

    pub fn sample_at(&self, now: DateTime<Utc>) -> TimeSample {
        if !self.is_synchronized() {
            return TimeSample::unsynchronized();
        }
        TimeSample::from_datetime(&now.with_timezone(&self.offset()))
    }

    fn set_state(&self, state: SyncState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn set_valid(&self, valid: bool) {
        self.inner.valid.store(valid, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Initial,
    Refresh,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStep {
    Synchronized,
    RetryAfter(Duration),
    GaveUp,
}

/// `min(base * 2^(attempt - 1), max)` for a 1-based attempt number.
pub fn backoff_delay(config: &TimeSyncConfig, attempt: u32) -> Duration {
    let factor = 1_u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(
        config
            .base_delay_ms
            .saturating_mul(factor)
            .min(config.max_delay_ms),
    )
}

/// Write side of the time source: a bounded retry state machine around a [`TimeBackend`].
///
/// [`TimeSource::begin`] and [`TimeSource::step`] never sleep, so a caller can drive them with
/// whatever delay primitive its runtime offers. [`TimeSource::run_blocking`] does the loop with
/// an injected sleep.
pub struct TimeSource<B> {
    backend: B,
    config: TimeSyncConfig,
    clock: ClockHandle,
    mode: AcquireMode,
    attempt: u32,
    last_success_ms: Option<u64>,
    last_attempt_ms: Option<u64>,
}

impl<B: TimeBackend> TimeSource<B> {
    pub fn new(backend: B, config: TimeSyncConfig, clock: ClockHandle) -> Self {
        Self {
            backend,
            config,
            clock,
            mode: AcquireMode::Initial,
            attempt: 0,
            last_success_ms: None,
            last_attempt_ms: None,
        }
    }

    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    pub fn begin(&mut self, mode: AcquireMode) {
        self.mode = mode;
        self.attempt = 0;
        self.clock.set_state(SyncState::Synchronizing);
    }

    /// Runs one attempt and says what to do next.
    pub fn step(&mut self, now_ms: u64) -> AcquireStep {
        self.attempt += 1;
        self.last_attempt_ms = Some(now_ms);

        match self.backend.sync_once() {
            Ok(()) => {
                self.last_success_ms = Some(now_ms);
                self.clock.set_valid(true);
                self.clock.set_state(SyncState::Synchronized);
                info!(
                    "time synchronized after {} attempt(s) ({:?})",
                    self.attempt, self.mode
                );
                AcquireStep::Synchronized
            }
            Err(err) if self.attempt >= self.config.max_attempts => {
                warn!(
                    "time sync gave up after {} attempt(s): {err}",
                    self.attempt
                );
                if self.mode == AcquireMode::Refresh && self.clock.is_synchronized() {
                    self.clock.set_state(SyncState::Synchronized);
                } else {
                    self.clock.set_valid(false);
                    self.clock.set_state(SyncState::Unsynchronized);
                }
                AcquireStep::GaveUp
            }
            Err(err) => {
                let delay = backoff_delay(&self.config, self.attempt);
                warn!(
                    "time sync attempt {}/{} failed: {err}; retrying in {}ms",
                    self.attempt,
                    self.config.max_attempts,
                    delay.as_millis()
                );
                AcquireStep::RetryAfter(delay)
            }
        }
    }

    /// Loops [`TimeSource::step`] until it settles. Returns whether the clock is synchronized.
    pub fn run_blocking(
        &mut self,
        mode: AcquireMode,
        now_ms: impl Fn() -> u64,
        mut sleep: impl FnMut(Duration),
    ) -> bool {
        self.begin(mode);
        loop {
            match self.step(now_ms()) {
                AcquireStep::Synchronized => return true,
                AcquireStep::GaveUp => return false,
                AcquireStep::RetryAfter(delay) => sleep(delay),
            }
        }
    }

    /// True when a synchronized clock is due for its periodic refresh. Measured from the last
    /// attempt, so a failing refresh is not retried on every poll.
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        if !self.clock.is_synchronized() {
            return false;
        }
        let since = self.last_attempt_ms.or(self.last_success_ms).unwrap_or(0);
        now_ms.saturating_sub(since) >= self.config.refresh_interval_ms
    }

    /// What the owning task should run next, if anything: a periodic refresh for a synchronized
    /// clock, or another acquisition once `max_delay_ms` has passed since a failed one.
    pub fn due(&self, now_ms: u64) -> Option<AcquireMode> {
        if self.clock.is_synchronized() {
            return self.needs_refresh(now_ms).then_some(AcquireMode::Refresh);
        }
        match self.last_attempt_ms {
            None => Some(AcquireMode::Initial),
            Some(at) if now_ms.saturating_sub(at) >= self.config.max_delay_ms => {
                Some(AcquireMode::Initial)
            }
            Some(_) => None,
        }
    }

    pub fn acquire(&mut self, now_ms: impl Fn() -> u64, sleep: impl FnMut(Duration)) -> bool {
        self.run_blocking(AcquireMode::Initial, now_ms, sleep)
    }

    pub fn refresh(&mut self, now_ms: impl Fn() -> u64, sleep: impl FnMut(Duration)) -> bool {
        self.run_blocking(AcquireMode::Refresh, now_ms, sleep)
    }

    pub fn force_resync(&mut self, now_ms: impl Fn() -> u64, sleep: impl FnMut(Duration)) -> bool {
        self.run_blocking(AcquireMode::Forced, now_ms, sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of attempt outcomes, then keeps failing.
    struct SteppedBackend {
        outcomes: VecDeque<bool>,
    }

    impl SteppedBackend {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: outcomes.iter().copied().collect(),
            }
        }
    }

    impl TimeBackend for SteppedBackend {
        fn sync_once(&mut self) -> Result<(), TimeSyncError> {
            match self.outcomes.pop_front() {
                Some(true) => Ok(()),
                _ => Err(TimeSyncError::Attempt("no response".to_string())),
            }
        }
    }

    fn source(outcomes: &[bool]) -> TimeSource<SteppedBackend> {
        TimeSource::new(
            SteppedBackend::new(outcomes),
            TimeSyncConfig::default(),
            ClockHandle::new(0),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = TimeSyncConfig {
            max_attempts: 10,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            refresh_interval_ms: 3_600_000,
        };
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| backoff_delay(&config, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff_delay(&config, 80), Duration::from_millis(30_000));
    }

    #[test]
    fn succeeds_on_third_attempt_after_two_backoffs() {
        let mut source = source(&[false, false, true]);
        let mut delays = Vec::new();

        let synced = source.acquire(|| 0, |delay| delays.push(delay));

        assert!(synced);
        assert_eq!(
            delays,
            vec![Duration::from_millis(2_000), Duration::from_millis(4_000)]
        );
        assert_eq!(source.clock().state(), SyncState::Synchronized);
        assert!(source.clock().is_synchronized());
    }

    #[test]
    fn exhausted_retries_leave_clock_unsynchronized() {
        let mut source = source(&[false, false, false, true]);
        let mut delays = Vec::new();

        assert!(!source.acquire(|| 0, |delay| delays.push(delay)));

        assert_eq!(delays.len(), 2);
        assert_eq!(source.attempt_count(), 3);
        assert_eq!(source.clock().state(), SyncState::Unsynchronized);
        assert_eq!(
            source.clock().sample_at(Utc::now()),
            TimeSample::unsynchronized()
        );
    }

    #[test]
    fn step_reports_synchronizing_between_attempts() {
        let mut source = source(&[false, true]);
        source.begin(AcquireMode::Initial);

        assert_eq!(
            source.step(0),
            AcquireStep::RetryAfter(Duration::from_millis(2_000))
        );
        assert_eq!(source.clock().state(), SyncState::Synchronizing);
        assert_eq!(source.step(2_000), AcquireStep::Synchronized);
    }

    #[test]
    fn failed_refresh_keeps_clock_valid() {
        let mut source = source(&[true]);
        assert!(source.acquire(|| 0, |_| {}));

        assert!(!source.needs_refresh(3_599_999));
        assert!(source.needs_refresh(3_600_000));

        assert!(!source.refresh(|| 3_600_000, |_| {}));
        assert_eq!(source.clock().state(), SyncState::Synchronized);
        assert!(source.clock().is_synchronized());
        // The failed refresh restarts the countdown.
        assert!(!source.needs_refresh(3_600_001));
    }

    #[test]
    fn forced_resync_that_gives_up_invalidates_clock() {
        let mut source = source(&[true]);
        assert!(source.acquire(|| 0, |_| {}));

        assert!(!source.force_resync(|| 10, |_| {}));

        assert_eq!(source.clock().state(), SyncState::Unsynchronized);
        assert!(!source.clock().is_synchronized());
        assert!(!source.needs_refresh(u64::MAX));
    }

    #[test]
    fn due_schedules_retry_and_refresh() {
        let mut source = source(&[false, false, false, true]);
        assert_eq!(source.due(0), Some(AcquireMode::Initial));

        assert!(!source.acquire(|| 1_000, |_| {}));
        assert_eq!(source.due(20_000), None);
        assert_eq!(source.due(31_000), Some(AcquireMode::Initial));

        assert!(source.acquire(|| 31_000, |_| {}));
        assert_eq!(source.due(31_001), None);
        assert_eq!(source.due(3_631_000), Some(AcquireMode::Refresh));
    }

    #[test]
    fn samples_apply_fixed_offset() {
        let clock = ClockHandle::new(90);
        let mut source = TimeSource::new(
            SteppedBackend::new(&[true]),
            TimeSyncConfig::default(),
            clock.clone(),
        );
        assert!(source.acquire(|| 0, |_| {}));

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 23, 45, 12).unwrap();
        let sample = clock.sample_at(now);

        assert_eq!(
            sample,
            TimeSample {
                hours: 1,
                minutes: 15,
                seconds: 12,
                is_synchronized: true,
            }
        );
        assert_eq!(sample.clock_text(), "01:15");
        assert_eq!(sample.second_of_day(), 4_512);
    }
}
