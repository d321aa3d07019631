use std::sync::{Arc, Mutex, PoisonError};

use bosun_core::{DeviceEvent, DeviceId, EventKind};
use tokio::sync::broadcast;

/// Per-device append-only event log.
///
/// Recording never fails and never blocks on consumers: the log is the source
/// of truth for test assertions and export, the broadcast channel is a
/// convenience so callers can await threshold events instead of polling.
pub struct EventRecorder {
    device_id: DeviceId,
    log: Arc<Mutex<Vec<DeviceEvent>>>,
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventRecorder {
    pub fn new(device_id: DeviceId) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            device_id,
            log: Arc::new(Mutex::new(Vec::new())),
            tx,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Append an event and fan it out to any subscribers.
    pub fn record(&self, kind: EventKind, payload: serde_json::Value) -> DeviceEvent {
        let event = DeviceEvent::new(self.device_id.clone(), kind, payload);
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        let _ = self.tx.send(event.clone());
        event
    }

    /// Full ordered snapshot of the log.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, in order.
    pub fn events_of(&self, kind: EventKind) -> Vec<DeviceEvent> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Subscribe to events recorded after this call. Lagging receivers drop
    /// the oldest events (broadcast semantics); the log itself never drops.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}

impl Clone for EventRecorder {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            log: Arc::clone(&self.log),
            tx: self.tx.clone(),
        }
    }
}
