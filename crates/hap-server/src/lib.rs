//! # hap-server
//!
//! The request-dispatch side of the accessory engine: bulk characteristic
//! reads and writes with timeout governance, the per-connection
//! subscription registry, the change-notification pipeline, and the
//! accessory server facade tying the capability tree to persistence and
//! advertisement.

pub mod dispatch;
pub mod events;
pub mod server;
pub mod subscriptions;

pub use dispatch::{
    Dispatcher, ReadFlags, ReadItem, ReadResult, WriteItem, WriteRequest, WriteResult,
    RESPONSE_DEADLINE, SLOW_RESPONSE_THRESHOLD,
};
pub use events::{EventSink, NotificationPipeline, PushedEvent};
pub use server::{AccessoryServer, AdvertisedState, Advertiser, REPUBLISH_DEBOUNCE};
pub use subscriptions::SubscriptionRegistry;
