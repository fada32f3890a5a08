use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError},
        Arc,
    },
    time::Duration,
};

use log::warn;

use crate::vp::{VpAddress, VpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Value,
    Text,
    FullRefresh,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Text => "text",
            Self::FullRefresh => "full_refresh",
        }
    }
}

/// A request for the HMI task to push one store entry (or all of them) out to the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub kind: UpdateKind,
    /// Ignored for [`UpdateKind::FullRefresh`].
    pub address: VpAddress,
}

impl UpdateRequest {
    pub fn value(address: VpAddress) -> Self {
        Self {
            kind: UpdateKind::Value,
            address,
        }
    }

    pub fn text(address: VpAddress) -> Self {
        Self {
            kind: UpdateKind::Text,
            address,
        }
    }

    pub fn full_refresh() -> Self {
        Self {
            kind: UpdateKind::FullRefresh,
            address: VpAddress::Time,
        }
    }

    /// Picks `Value` or `Text` from the address kind.
    pub fn for_address(address: VpAddress) -> Self {
        match address.kind() {
            VpKind::Uint8 => Self::value(address),
            VpKind::Text { .. } => Self::text(address),
        }
    }
}

/// Bounded FIFO with a single consumer. Producers never block.
pub fn update_queue(capacity: usize) -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        UpdateSender {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        UpdateReceiver { rx },
    )
}

#[derive(Clone)]
pub struct UpdateSender {
    tx: SyncSender<UpdateRequest>,
    dropped: Arc<AtomicUsize>,
}

impl UpdateSender {
    /// Best-effort enqueue: a full queue drops the request and logs it.
    pub fn enqueue(&self, request: UpdateRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "update queue full, dropped {} for {} ({dropped} dropped so far)",
                    request.kind.as_str(),
                    request.address.as_str()
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("update queue closed, HMI task is gone");
                false
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct UpdateReceiver {
    rx: Receiver<UpdateRequest>,
}

impl UpdateReceiver {
    /// Blocks until a request arrives. `None` once every sender is gone.
    pub fn recv(&self) -> Option<UpdateRequest> {
        self.rx.recv().ok()
    }

    /// `Ok(None)` on timeout, `Err(())` once every sender is gone.
    #[allow(clippy::result_unit_err)]
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<UpdateRequest>, ()> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => Ok(Some(request)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }

    pub fn try_recv(&self) -> Option<UpdateRequest> {
        match self.rx.try_recv() {
            Ok(request) => Some(request),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything currently queued, in order.
    pub fn drain(&self) -> Vec<UpdateRequest> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preserves_fifo_order() {
        let (tx, rx) = update_queue(8);
        tx.enqueue(UpdateRequest::value(VpAddress::LightState));
        tx.enqueue(UpdateRequest::text(VpAddress::Time));
        tx.enqueue(UpdateRequest::value(VpAddress::LightState));

        assert_eq!(
            rx.drain(),
            vec![
                UpdateRequest::value(VpAddress::LightState),
                UpdateRequest::text(VpAddress::Time),
                UpdateRequest::value(VpAddress::LightState),
            ]
        );
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (tx, rx) = update_queue(2);
        assert!(tx.enqueue(UpdateRequest::value(VpAddress::FanState)));
        assert!(tx.enqueue(UpdateRequest::value(VpAddress::WaterState)));
        assert!(!tx.enqueue(UpdateRequest::value(VpAddress::LightState)));
        assert_eq!(tx.dropped(), 1);

        assert_eq!(rx.drain().len(), 2);
        assert!(tx.enqueue(UpdateRequest::value(VpAddress::LightState)));
    }

    #[test]
    fn receiver_reports_closed_queue() {
        let (tx, rx) = update_queue(2);
        drop(tx);
        assert_eq!(rx.recv(), None);
        assert_eq!(rx.recv_timeout(Duration::from_millis(1)), Err(()));
    }

    #[test]
    fn request_kind_follows_address_kind() {
        assert_eq!(
            UpdateRequest::for_address(VpAddress::GrowthBar).kind,
            UpdateKind::Value
        );
        assert_eq!(
            UpdateRequest::for_address(VpAddress::GrowthText).kind,
            UpdateKind::Text
        );
    }
}
