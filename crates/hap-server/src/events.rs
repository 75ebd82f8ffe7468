//! Change-notification pipeline.
//!
//! Characteristics publish every stored change onto the accessory root's
//! event bus; this pipeline decides which changes are worth pushing and to
//! whom. A change is forwarded only when ids are assigned, the context did
//! not suppress notification, and the change is observable (explicit push,
//! a differing value, or a stateless-event type that always notifies).

use crate::subscriptions::SubscriptionRegistry;
use async_trait::async_trait;
use hap_accessory::{ChangeReason, CharacteristicEvent, ConnectionId};
use hap_core::hap_type::characteristic as char_type;
use hap_core::{HapType, HapValue};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Stateless-event types that must notify even when the value is unchanged.
/// Protocol compatibility constants.
pub const ALWAYS_NOTIFY_TYPES: [HapType; 2] = [
    char_type::PROGRAMMABLE_SWITCH_EVENT,
    char_type::BUTTON_EVENT,
];

/// Types whose notifications are delivered immediately and unbatched;
/// everything else may be coalesced by the transport. Protocol
/// compatibility constants.
pub const IMMEDIATE_DELIVERY_TYPES: [HapType; 4] = [
    char_type::MOTION_DETECTED,
    char_type::CONTACT_SENSOR_STATE,
    char_type::PROGRAMMABLE_SWITCH_EVENT,
    char_type::BUTTON_EVENT,
];

/// An event as pushed to one subscribed connection.
#[derive(Debug, Clone, Serialize)]
pub struct PushedEvent {
    pub aid: u64,
    pub iid: u64,
    pub value: HapValue,
}

/// Transport-side consumer of pushed events (enables mocking in tests).
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Deliver one event to one connection. `immediate` asks the transport
    /// to flush this event unbatched.
    async fn deliver(&self, connection: ConnectionId, event: PushedEvent, immediate: bool);
}

/// Filters bus events and fans them out to subscribed connections.
pub struct NotificationPipeline {
    subscriptions: Arc<SubscriptionRegistry>,
    sink: Arc<dyn EventSink>,
}

impl NotificationPipeline {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            subscriptions,
            sink,
        }
    }

    /// Consume the accessory root's event bus until it closes.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<CharacteristicEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(event).await;
            }
        })
    }

    /// Whether an event clears the forwarding filter.
    pub fn should_forward(event: &CharacteristicEvent) -> bool {
        if event.aid == 0 || event.iid == 0 {
            // Ids not assigned yet; nothing addressable to notify about
            return false;
        }
        if event.suppress_notification {
            return false;
        }
        event.reason == ChangeReason::Explicit
            || event.old_value != event.new_value
            || ALWAYS_NOTIFY_TYPES.contains(&event.characteristic_type)
    }

    async fn handle(&self, event: CharacteristicEvent) {
        if !Self::should_forward(&event) {
            trace!(aid = event.aid, iid = event.iid, "event filtered");
            return;
        }

        let immediate = IMMEDIATE_DELIVERY_TYPES.contains(&event.characteristic_type);
        for connection in self.subscriptions.subscribers((event.aid, event.iid)) {
            // The writer already knows the outcome; don't echo it back
            if event.originator == Some(connection) {
                continue;
            }
            self.sink
                .deliver(
                    connection,
                    PushedEvent {
                        aid: event.aid,
                        iid: event.iid,
                        value: event.new_value.clone(),
                    },
                    immediate,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(reason: ChangeReason) -> CharacteristicEvent {
        CharacteristicEvent {
            aid: 1,
            iid: 9,
            characteristic_type: char_type::ON,
            reason,
            old_value: HapValue::Bool(false),
            new_value: HapValue::Bool(true),
            originator: None,
            suppress_notification: false,
        }
    }

    mod filtering {
        use super::*;

        #[test]
        fn changed_value_forwards() {
            assert!(NotificationPipeline::should_forward(&event(
                ChangeReason::Write
            )));
        }

        #[test]
        fn unchanged_value_is_filtered() {
            let mut ev = event(ChangeReason::Write);
            ev.new_value = ev.old_value.clone();
            assert!(!NotificationPipeline::should_forward(&ev));
        }

        #[test]
        fn explicit_reason_forwards_even_when_unchanged() {
            let mut ev = event(ChangeReason::Explicit);
            ev.new_value = ev.old_value.clone();
            assert!(NotificationPipeline::should_forward(&ev));
        }

        #[test]
        fn stateless_event_types_always_forward() {
            let mut ev = event(ChangeReason::Write);
            ev.characteristic_type = char_type::PROGRAMMABLE_SWITCH_EVENT;
            ev.old_value = HapValue::UInt(0);
            ev.new_value = HapValue::UInt(0);
            assert!(NotificationPipeline::should_forward(&ev));
        }

        #[test]
        fn suppressed_context_is_filtered() {
            let mut ev = event(ChangeReason::Explicit);
            ev.suppress_notification = true;
            assert!(!NotificationPipeline::should_forward(&ev));
        }

        #[test]
        fn unassigned_ids_are_filtered() {
            let mut ev = event(ChangeReason::Explicit);
            ev.aid = 0;
            ev.iid = 0;
            assert!(!NotificationPipeline::should_forward(&ev));
        }
    }

    mod delivery {
        use super::*;

        /// Records deliveries for assertions.
        struct RecordingSink {
            delivered: Mutex<Vec<(ConnectionId, PushedEvent, bool)>>,
        }

        impl RecordingSink {
            fn new() -> Arc<Self> {
                Arc::new(Self {
                    delivered: Mutex::new(Vec::new()),
                })
            }
        }

        #[async_trait]
        impl EventSink for RecordingSink {
            async fn deliver(&self, connection: ConnectionId, event: PushedEvent, immediate: bool) {
                self.delivered
                    .lock()
                    .unwrap()
                    .push((connection, event, immediate));
            }
        }

        fn pipeline_with_sink() -> (
            Arc<SubscriptionRegistry>,
            Arc<RecordingSink>,
            mpsc::UnboundedSender<CharacteristicEvent>,
            JoinHandle<()>,
        ) {
            let subscriptions = Arc::new(SubscriptionRegistry::new());
            let sink = RecordingSink::new();
            let pipeline = NotificationPipeline::new(
                Arc::clone(&subscriptions),
                Arc::clone(&sink) as Arc<dyn EventSink>,
            );
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = pipeline.spawn(rx);
            (subscriptions, sink, tx, handle)
        }

        #[tokio::test]
        async fn delivers_to_subscribers_except_originator() {
            let (subscriptions, sink, tx, handle) = pipeline_with_sink();
            subscriptions.subscribe(ConnectionId(1), (1, 9));
            subscriptions.subscribe(ConnectionId(2), (1, 9));

            let mut ev = event(ChangeReason::Write);
            ev.originator = Some(ConnectionId(1));
            tx.send(ev).unwrap();
            drop(tx);
            handle.await.unwrap();

            let delivered = sink.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].0, ConnectionId(2));
            assert_eq!(delivered[0].1.value, HapValue::Bool(true));
        }

        #[tokio::test]
        async fn immediate_flag_follows_type_allowlist() {
            let (subscriptions, sink, tx, handle) = pipeline_with_sink();
            subscriptions.subscribe(ConnectionId(1), (1, 9));

            let mut motion = event(ChangeReason::Write);
            motion.characteristic_type = char_type::MOTION_DETECTED;
            tx.send(motion).unwrap();
            tx.send(event(ChangeReason::Write)).unwrap();
            drop(tx);
            handle.await.unwrap();

            let delivered = sink.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 2);
            assert!(delivered[0].2, "motion events deliver immediately");
            assert!(!delivered[1].2, "ordinary events may be coalesced");
        }

        #[tokio::test]
        async fn unsubscribed_connections_receive_nothing() {
            let (_subscriptions, sink, tx, handle) = pipeline_with_sink();
            tx.send(event(ChangeReason::Write)).unwrap();
            drop(tx);
            handle.await.unwrap();
            assert!(sink.delivered.lock().unwrap().is_empty());
        }
    }
}
