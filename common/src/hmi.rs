use std::{thread, time::Duration};

use log::{debug, info, warn};

use crate::{
    config::RelayPins,
    error::{DisplayError, OutputError},
    events::{handle_display_event, DisplayEvent},
    store::SharedStore,
    update::{UpdateKind, UpdateReceiver, UpdateRequest, UpdateSender},
    vp::{pad_text, VpAddress, VpKind},
};

/// The panel the controller mirrors its store onto.
pub trait DisplayDriver: Send {
    fn set_value(&mut self, address: u16, value: u8) -> Result<(), DisplayError>;
    fn set_text(&mut self, address: u16, text: &str) -> Result<(), DisplayError>;

    /// Changes the user made on the panel since the last poll.
    fn poll_events(&mut self) -> Vec<DisplayEvent> {
        Vec::new()
    }
}

/// Digital outputs addressed by GPIO number.
pub trait RelayOutputs: Send {
    fn write(&mut self, pin: u8, on: bool) -> Result<(), OutputError>;
}

/// What one request resolved to, read under the store lock and applied after it is released.
enum Push {
    Value(u8),
    Text(String),
}

/// Drains the update queue onto the panel and the relays, and feeds panel events back into
/// the store. Owns the display and output drivers exclusively.
pub struct HmiDispatcher<D, R> {
    store: SharedStore,
    updates: UpdateSender,
    display: D,
    relays: R,
    pins: RelayPins,
    item_delay: Duration,
}

impl<D: DisplayDriver, R: RelayOutputs> HmiDispatcher<D, R> {
    pub fn new(
        store: SharedStore,
        updates: UpdateSender,
        display: D,
        relays: R,
        pins: RelayPins,
        item_delay: Duration,
    ) -> Self {
        Self {
            store,
            updates,
            display,
            relays,
            pins,
            item_delay,
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn handle(&mut self, request: UpdateRequest) {
        match request.kind {
            UpdateKind::FullRefresh => self.full_refresh(),
            UpdateKind::Value | UpdateKind::Text => self.push(request.address),
        }
    }

    /// Pushes every entry in address order, pausing between items for the panel to keep up.
    pub fn full_refresh(&mut self) {
        info!("refreshing panel and outputs from store");
        for address in VpAddress::all() {
            self.push(address);
            if !self.item_delay.is_zero() {
                thread::sleep(self.item_delay);
            }
        }
    }

    /// Handles pending panel events. Returns how many changed the store.
    pub fn poll_panel(&mut self) -> usize {
        self.display
            .poll_events()
            .iter()
            .filter(|event| handle_display_event(&self.store, &self.updates, event))
            .count()
    }

    /// One loop iteration: wait up to `poll` for a request, then service the panel.
    /// Returns false once every producer is gone.
    pub fn run_once(&mut self, receiver: &UpdateReceiver, poll: Duration) -> bool {
        let open = match receiver.recv_timeout(poll) {
            Ok(Some(request)) => {
                self.handle(request);
                while let Some(request) = receiver.try_recv() {
                    self.handle(request);
                }
                true
            }
            Ok(None) => true,
            Err(()) => false,
        };
        self.poll_panel();
        open
    }

    pub fn run(mut self, receiver: UpdateReceiver, poll: Duration) {
        info!("HMI dispatcher started");
        while self.run_once(&receiver, poll) {}
        warn!("update queue closed, HMI dispatcher stopping");
    }

    fn push(&mut self, address: VpAddress) {
        let push = match address.kind() {
            VpKind::Uint8 => Push::Value(self.store.get_uint(address)),
            VpKind::Text { capacity } => {
                Push::Text(pad_text(&self.store.get_string(address), capacity))
            }
        };

        match push {
            Push::Value(value) => {
                if let Err(err) = self.display.set_value(address.raw(), value) {
                    warn!("{err}");
                }
                if let Some(pin) = self.pins.pin_for(address) {
                    debug!("driving pin {pin} {}", if value != 0 { "high" } else { "low" });
                    if let Err(err) = self.relays.write(pin, value != 0) {
                        warn!("{err}");
                    }
                }
            }
            Push::Text(text) => {
                if let Err(err) = self.display.set_text(address.raw(), &text) {
                    warn!("{err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{shared_store, PanelWrite, RecordingDisplay, RecordingRelays},
        update::update_queue,
        vp::{VpValue, VP_TABLE},
    };
    use pretty_assertions::assert_eq;

    fn dispatcher(
        store: &SharedStore,
        updates: UpdateSender,
    ) -> (
        HmiDispatcher<RecordingDisplay, RecordingRelays>,
        RecordingDisplay,
        RecordingRelays,
    ) {
        let display = RecordingDisplay::default();
        let relays = RecordingRelays::default();
        let dispatcher = HmiDispatcher::new(
            store.clone(),
            updates,
            display.clone(),
            relays.clone(),
            RelayPins::default(),
            Duration::ZERO,
        );
        (dispatcher, display, relays)
    }

    #[test]
    fn value_request_drives_panel_and_mapped_pin() {
        let (store, _) = shared_store();
        let (tx, _rx) = update_queue(4);
        let (mut hmi, display, relays) = dispatcher(&store, tx);
        store.sync(VpAddress::WaterState, VpValue::Uint(1));

        hmi.handle(UpdateRequest::value(VpAddress::WaterState));
        hmi.handle(UpdateRequest::value(VpAddress::WaterAuto));

        assert_eq!(
            display.take(),
            vec![PanelWrite::Value(0x1200, 1), PanelWrite::Value(0x1210, 0)]
        );
        assert_eq!(relays.take(), vec![(22, true)]);
    }

    #[test]
    fn text_request_is_space_padded_to_capacity() {
        let (store, _) = shared_store();
        let (tx, _rx) = update_queue(4);
        let (mut hmi, display, _) = dispatcher(&store, tx);
        store.sync(VpAddress::Time, VpValue::Text("07:05".to_string()));

        hmi.handle(UpdateRequest::text(VpAddress::Time));
        hmi.handle(UpdateRequest::text(VpAddress::WifiSsid));

        assert_eq!(
            display.take(),
            vec![
                PanelWrite::Text(0x1000, "07:05 ".to_string()),
                PanelWrite::Text(0x1420, " ".repeat(32)),
            ]
        );
    }

    #[test]
    fn full_refresh_walks_every_entry_in_order() {
        let (store, _) = shared_store();
        let (tx, _rx) = update_queue(4);
        let (mut hmi, display, relays) = dispatcher(&store, tx);

        hmi.handle(UpdateRequest::full_refresh());

        let addresses: Vec<u16> = display
            .take()
            .into_iter()
            .map(|write| match write {
                PanelWrite::Value(address, _) | PanelWrite::Text(address, _) => address,
            })
            .collect();
        let expected: Vec<u16> = VP_TABLE.iter().map(|item| item.raw).collect();
        assert_eq!(addresses, expected);
        assert_eq!(relays.take(), vec![(23, false), (22, false), (21, false)]);
    }

    #[test]
    fn display_failure_does_not_block_relay() {
        let (store, _) = shared_store();
        let (tx, _rx) = update_queue(4);
        let relays = RecordingRelays::default();
        let mut hmi = HmiDispatcher::new(
            store.clone(),
            tx,
            RecordingDisplay {
                fail: true,
                ..Default::default()
            },
            relays.clone(),
            RelayPins::default(),
            Duration::ZERO,
        );
        store.sync(VpAddress::LightState, VpValue::Uint(1));

        hmi.handle(UpdateRequest::value(VpAddress::LightState));

        assert_eq!(relays.take(), vec![(23, true)]);
    }

    #[test]
    fn run_once_drains_queue_in_order() {
        let (store, _) = shared_store();
        let (tx, rx) = update_queue(4);
        let (mut hmi, display, _) = dispatcher(&store, tx.clone());
        tx.enqueue(UpdateRequest::value(VpAddress::FanAuto));
        tx.enqueue(UpdateRequest::value(VpAddress::PlantId));

        assert!(hmi.run_once(&rx, Duration::from_millis(1)));

        assert_eq!(
            display.take(),
            vec![PanelWrite::Value(0x1310, 0), PanelWrite::Value(0x1020, 0)]
        );
    }
}
