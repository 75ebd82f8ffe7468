//! Characteristic change events.
//!
//! Every value change is published into the accessory root's event bus; the
//! notification pipeline decides which subscribed connections are told.

use crate::pairing::ConnectionId;
use hap_core::{HapType, HapValue};
use tokio::sync::mpsc;

/// Why a characteristic value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A read handler returned a value differing from the cached one.
    Read,
    /// A write (controller or accessory code) stored a new value.
    Write,
    /// Accessory code explicitly requested an event push.
    Explicit,
}

/// Context carried through a read/write into the resulting event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeContext {
    /// Connection that caused the change, if any. The originator never
    /// receives its own echo.
    pub originator: Option<ConnectionId>,
    /// Suppresses forwarding of the resulting event entirely.
    pub suppress_notification: bool,
}

impl ChangeContext {
    /// Change driven by accessory-side code.
    pub fn internal() -> Self {
        Self::default()
    }

    /// Change driven by a controller connection.
    pub fn from_connection(id: ConnectionId) -> Self {
        Self {
            originator: Some(id),
            suppress_notification: false,
        }
    }

    /// Same context with notifications suppressed.
    pub fn suppressed(mut self) -> Self {
        self.suppress_notification = true;
        self
    }
}

/// A change event bubbling from a characteristic to the accessory root.
#[derive(Debug, Clone)]
pub struct CharacteristicEvent {
    pub aid: u64,
    pub iid: u64,
    pub characteristic_type: HapType,
    pub reason: ChangeReason,
    pub old_value: HapValue,
    pub new_value: HapValue,
    pub originator: Option<ConnectionId>,
    pub suppress_notification: bool,
}

/// Sending half of the accessory root's event bus, installed into every
/// characteristic at publish time.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<CharacteristicEvent>,
}

impl EventPublisher {
    pub fn new(tx: mpsc::UnboundedSender<CharacteristicEvent>) -> Self {
        Self { tx }
    }

    /// Publish an event. A closed bus (pipeline shut down) drops the event.
    pub fn publish(&self, event: CharacteristicEvent) {
        let _ = self.tx.send(event);
    }
}
