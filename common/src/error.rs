use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode stored entries: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stored value for `{key}` has the wrong kind")]
    KindMismatch { key: String },
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display write to {address:#06X} failed: {reason}")]
    Write { address: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("relay pin {pin} is not configured")]
    UnknownPin { pin: u8 },
    #[error("relay pin {pin} write failed: {reason}")]
    Write { pin: u8, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("spray duration {0}s is outside 1-99 seconds")]
    DurationOutOfRange(u8),
    #[error("spray interval {0}h is outside 1-12 hours")]
    IntervalOutOfRange(u8),
}

#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("time sync attempt failed: {0}")]
    Attempt(String),
}
