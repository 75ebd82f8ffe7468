//! # hap-accessory
//!
//! The addressable capability tree and its supporting state: accessories,
//! services, characteristics, stable identifier assignment, pairing records,
//! and the access-control checks applied to every characteristic operation.
//!
//! This crate provides:
//! - `Accessory`/`Service`/`Characteristic` graph with structural invariants
//! - Stable aid/iid assignment through a persisted `IdentifierCache`
//! - Async read/write characteristic handler traits
//! - Change events published toward the notification pipeline
//! - Pairing records with admin/user permission checks

pub mod accessory;
pub mod characteristic;
pub mod event;
pub mod iid_cache;
pub mod pairing;
pub mod service;
pub mod storage;

pub use accessory::{Accessory, Category, CharacteristicIndex};
pub use characteristic::{AuthChallenge, Characteristic, OnRead, OnWrite};
pub use event::{ChangeContext, ChangeReason, CharacteristicEvent, EventPublisher};
pub use iid_cache::IdentifierCache;
pub use pairing::{
    AccessDecision, ConnectionContext, ConnectionId, PairingEntry, PairingStore, Permission,
};
pub use service::Service;
pub use storage::{MemoryStorage, Storage};
