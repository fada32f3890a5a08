pub mod automation;
pub mod boot;
pub mod config;
pub mod error;
pub mod events;
pub mod hmi;
pub mod network;
pub mod schedule;
pub mod store;
pub mod time_source;
pub mod types;
pub mod update;
pub mod vp;

#[cfg(test)]
pub(crate) mod testing;

pub use automation::{AutomationEngine, TickReport};
pub use boot::{prepare_store, BootSummary};
pub use config::{ControllerConfig, RelayPins, TimeSyncConfig};
pub use error::{DisplayError, OutputError, PersistError, ScheduleError, TimeSyncError};
pub use events::{handle_display_event, DisplayEvent};
pub use hmi::{DisplayDriver, HmiDispatcher, RelayOutputs};
pub use network::{station_wanted, LinkChange, NetworkLink, NetworkMonitor, NetworkTask};
pub use schedule::{Decision, SprayTimer, Window, WindowMode};
pub use store::{Persistence, SharedStore, VpStore};
pub use time_source::{
    AcquireMode, AcquireStep, ClockHandle, SyncState, TimeBackend, TimeSample, TimeSource,
};
pub use types::{Channel, ChannelConfig, ChannelKind, DutyCycleConfig};
pub use update::{update_queue, UpdateKind, UpdateReceiver, UpdateRequest, UpdateSender};
pub use vp::{VpAddress, VpKind, VpValue};
