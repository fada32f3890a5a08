use std::{net::Ipv4Addr, time::Duration};

use log::{info, warn};

use crate::{
    store::{SharedStore, VpStore},
    time_source::{AcquireMode, TimeBackend, TimeSource},
    update::{UpdateRequest, UpdateSender},
    vp::{VpAddress, VpValue},
};

/// The station interface as far as the controller cares.
pub trait NetworkLink {
    fn is_associated(&self) -> bool;
    fn local_address(&self) -> Option<Ipv4Addr>;
    fn signal_dbm(&self) -> Option<i8>;
}

/// Whether the station should associate: the panel switch is on and an SSID is stored.
pub fn station_wanted(store: &VpStore) -> bool {
    store.get_uint(VpAddress::WifiState) != 0
        && !store.get_string(VpAddress::WifiSsid).trim().is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    Unchanged,
    Connected,
    Disconnected,
}

/// Mirrors link state into the IP and signal fields of the store.
#[derive(Debug, Default)]
pub struct NetworkMonitor {
    associated: Option<bool>,
    drops: u32,
}

impl NetworkMonitor {
    pub fn drops(&self) -> u32 {
        self.drops
    }

    pub fn poll(
        &mut self,
        link: &impl NetworkLink,
        store: &SharedStore,
        updates: &UpdateSender,
    ) -> LinkChange {
        let associated = link.is_associated();
        let change = match (self.associated, associated) {
            (Some(true), true) | (Some(false), false) => LinkChange::Unchanged,
            (_, true) => LinkChange::Connected,
            (None, false) | (Some(true), false) => LinkChange::Disconnected,
        };
        if change == LinkChange::Disconnected && self.associated == Some(true) {
            self.drops += 1;
        }
        self.associated = Some(associated);

        let mut fields = Vec::with_capacity(2);
        if associated {
            let ip = link
                .local_address()
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
                .to_string();
            fields.push((VpAddress::IpAddress, ip));
            if change == LinkChange::Connected {
                let signal = match link.signal_dbm() {
                    Some(rssi) => format!("RSSI: {rssi} dBm"),
                    None => "Connected".to_string(),
                };
                fields.push((VpAddress::PasswordOrSignal, signal));
            }
        } else if change == LinkChange::Disconnected {
            fields.push((VpAddress::IpAddress, Ipv4Addr::UNSPECIFIED.to_string()));
            fields.push((VpAddress::PasswordOrSignal, "Disconnected".to_string()));
        }

        let changed: Vec<VpAddress> = store.with(|store| {
            fields
                .into_iter()
                .filter(|(address, text)| store.sync(*address, VpValue::Text(text.clone())))
                .map(|(address, _)| address)
                .collect()
        });
        for address in changed {
            updates.enqueue(UpdateRequest::text(address));
        }

        match change {
            LinkChange::Connected => info!("network up: {}", store.get_string(VpAddress::IpAddress)),
            LinkChange::Disconnected => warn!("network down"),
            LinkChange::Unchanged => {}
        }
        change
    }
}

/// The network task body shared by both runtimes: link monitoring plus time-source upkeep.
pub struct NetworkTask<L, B> {
    link: L,
    monitor: NetworkMonitor,
    time: TimeSource<B>,
    store: SharedStore,
    updates: UpdateSender,
}

impl<L: NetworkLink, B: TimeBackend> NetworkTask<L, B> {
    pub fn new(link: L, time: TimeSource<B>, store: SharedStore, updates: UpdateSender) -> Self {
        Self {
            link,
            monitor: NetworkMonitor::default(),
            time,
            store,
            updates,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn time_mut(&mut self) -> &mut TimeSource<B> {
        &mut self.time
    }

    /// Updates the store from the link and returns the time work to run, if any.
    /// A link that comes back after a drop forces a resync of a clock that was valid.
    pub fn poll(&mut self, now_ms: u64) -> Option<AcquireMode> {
        let change = self.monitor.poll(&self.link, &self.store, &self.updates);
        if !self.link.is_associated() {
            return None;
        }
        if change == LinkChange::Connected
            && self.monitor.drops() > 0
            && self.time.clock().is_synchronized()
        {
            return Some(AcquireMode::Forced);
        }
        self.time.due(now_ms)
    }

    /// [`NetworkTask::poll`] followed by any due time work, sleeping between retries.
    pub fn poll_blocking(&mut self, now_ms: impl Fn() -> u64, sleep: impl FnMut(Duration)) {
        if let Some(mode) = self.poll(now_ms()) {
            self.time.run_blocking(mode, now_ms, sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TimeSyncConfig,
        error::TimeSyncError,
        testing::shared_store,
        time_source::ClockHandle,
        update::update_queue,
    };
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, rc::Rc};

    #[derive(Clone, Default)]
    struct FakeLink {
        up: Rc<Cell<bool>>,
        rssi: Option<i8>,
    }

    impl NetworkLink for FakeLink {
        fn is_associated(&self) -> bool {
            self.up.get()
        }

        fn local_address(&self) -> Option<Ipv4Addr> {
            self.up.get().then(|| Ipv4Addr::new(192, 168, 4, 20))
        }

        fn signal_dbm(&self) -> Option<i8> {
            self.rssi
        }
    }

    struct AlwaysOk;

    impl TimeBackend for AlwaysOk {
        fn sync_once(&mut self) -> Result<(), TimeSyncError> {
            Ok(())
        }
    }

    #[test]
    fn connect_and_drop_update_status_fields() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(8);
        let link = FakeLink {
            up: Rc::new(Cell::new(true)),
            rssi: Some(-61),
        };
        let mut monitor = NetworkMonitor::default();

        assert_eq!(monitor.poll(&link, &store, &tx), LinkChange::Connected);
        assert_eq!(store.get_string(VpAddress::IpAddress), "192.168.4.20");
        assert_eq!(store.get_string(VpAddress::PasswordOrSignal), "RSSI: -61 dBm");
        assert_eq!(rx.drain().len(), 2);

        assert_eq!(monitor.poll(&link, &store, &tx), LinkChange::Unchanged);
        assert!(rx.drain().is_empty());

        link.up.set(false);
        assert_eq!(monitor.poll(&link, &store, &tx), LinkChange::Disconnected);
        assert_eq!(store.get_string(VpAddress::IpAddress), "0.0.0.0");
        assert_eq!(store.get_string(VpAddress::PasswordOrSignal), "Disconnected");
        assert_eq!(
            rx.drain(),
            vec![
                UpdateRequest::text(VpAddress::IpAddress),
                UpdateRequest::text(VpAddress::PasswordOrSignal),
            ]
        );
        assert_eq!(monitor.drops(), 1);
    }

    #[test]
    fn reconnect_after_drop_forces_resync() {
        let (store, _) = shared_store();
        let (tx, _rx) = update_queue(8);
        let link = FakeLink {
            up: Rc::new(Cell::new(true)),
            rssi: None,
        };
        let time = TimeSource::new(AlwaysOk, TimeSyncConfig::default(), ClockHandle::new(0));
        let mut task = NetworkTask::new(link.clone(), time, store.clone(), tx);

        assert_eq!(task.poll(0), Some(AcquireMode::Initial));
        task.time_mut().run_blocking(AcquireMode::Initial, || 0, |_| {});
        assert_eq!(task.poll(100), None);
        assert_eq!(store.get_string(VpAddress::PasswordOrSignal), "Connected");

        link.up.set(false);
        assert_eq!(task.poll(200), None);
        link.up.set(true);
        assert_eq!(task.poll(300), Some(AcquireMode::Forced));
    }

    #[test]
    fn station_needs_switch_and_ssid() {
        let (store, _) = shared_store();
        assert!(!store.with(|store| station_wanted(store)));

        store.sync(VpAddress::WifiSsid, VpValue::Text("greenhouse".to_string()));
        assert!(!store.with(|store| station_wanted(store)));

        store.sync(VpAddress::WifiState, VpValue::Uint(1));
        assert!(store.with(|store| station_wanted(store)));

        store.sync(VpAddress::WifiSsid, VpValue::Text("   ".to_string()));
        assert!(!store.with(|store| station_wanted(store)));
    }
}
