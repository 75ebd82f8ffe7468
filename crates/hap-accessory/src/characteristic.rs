//! Characteristic: one addressable property of a service.
//!
//! Characteristics carry a permission set, value constraints, a cached
//! value, and optional async read/write handlers supplied by
//! device-implementation code. Every stored change publishes an event
//! toward the accessory root's notification pipeline.

use crate::event::{ChangeContext, ChangeReason, CharacteristicEvent, EventPublisher};
use crate::pairing::ConnectionId;
use async_trait::async_trait;
use hap_core::{AdminGates, Constraints, Format, HapStatus, HapType, HapValue, Perms, Unit};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Async read handler supplied by device code. May suspend.
#[async_trait]
pub trait OnRead: Send + Sync {
    async fn read(&self) -> Result<HapValue, HapStatus>;
}

/// Async write handler supplied by device code. May suspend.
///
/// `originator` is the connection behind a controller write, None for
/// accessory-side writes. A returned echo value replaces the written value
/// as the characteristic's new value (write-response semantics).
#[async_trait]
pub trait OnWrite: Send + Sync {
    async fn write(
        &self,
        value: HapValue,
        originator: Option<ConnectionId>,
    ) -> Result<Option<HapValue>, HapStatus>;
}

/// Opaque challenge handler for additional-authorization writes.
///
/// Returns whether the supplied authorization data admits the write; a
/// panic inside the handler is treated as a denial, not a fault.
pub trait AuthChallenge: Send + Sync {
    fn authorize(&self, auth_data: Option<&[u8]>) -> bool;
}

/// One property of a service.
pub struct Characteristic {
    hap_type: HapType,
    format: Format,
    perms: Perms,
    admin_gates: AdminGates,
    unit: Option<Unit>,
    constraints: Constraints,
    aid: AtomicU64,
    iid: AtomicU64,
    value: RwLock<HapValue>,
    read_handler: RwLock<Option<Arc<dyn OnRead>>>,
    write_handler: RwLock<Option<Arc<dyn OnWrite>>>,
    auth_handler: RwLock<Option<Arc<dyn AuthChallenge>>>,
    publisher: RwLock<Option<EventPublisher>>,
}

impl Characteristic {
    /// Create a characteristic with the format's default value.
    pub fn new(hap_type: HapType, format: Format, perms: Perms) -> Self {
        Self {
            hap_type,
            format,
            perms,
            admin_gates: AdminGates::none(),
            unit: None,
            constraints: Constraints::none(),
            aid: AtomicU64::new(0),
            iid: AtomicU64::new(0),
            value: RwLock::new(HapValue::default_for(format)),
            read_handler: RwLock::new(None),
            write_handler: RwLock::new(None),
            auth_handler: RwLock::new(None),
            publisher: RwLock::new(None),
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_admin_gates(mut self, gates: AdminGates) -> Self {
        self.admin_gates = gates;
        self
    }

    pub fn with_initial_value(self, value: HapValue) -> Self {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        self
    }

    /// Install the read handler.
    pub fn on_read(&self, handler: Arc<dyn OnRead>) {
        *self
            .read_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Install the write handler.
    pub fn on_write(&self, handler: Arc<dyn OnWrite>) {
        *self
            .write_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Install the additional-authorization challenge handler.
    pub fn on_authorize(&self, handler: Arc<dyn AuthChallenge>) {
        *self
            .auth_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn hap_type(&self) -> HapType {
        self.hap_type
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn admin_gates(&self) -> AdminGates {
        self.admin_gates
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Assigned (aid, iid), zero before assignment.
    pub fn ids(&self) -> (u64, u64) {
        (self.aid.load(Ordering::Relaxed), self.iid.load(Ordering::Relaxed))
    }

    pub fn set_ids(&self, aid: u64, iid: u64) {
        self.aid.store(aid, Ordering::Relaxed);
        self.iid.store(iid, Ordering::Relaxed);
    }

    pub fn ids_assigned(&self) -> bool {
        let (aid, iid) = self.ids();
        aid != 0 && iid != 0
    }

    /// Connect this characteristic to the accessory root's event bus.
    pub fn set_publisher(&self, publisher: EventPublisher) {
        *self
            .publisher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(publisher);
    }

    pub fn clear_publisher(&self) {
        *self
            .publisher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The cached value.
    pub fn value(&self) -> HapValue {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Serve a read: invoke the read handler when present, falling back to
    /// the cached value. A handler result differing from the cache updates
    /// it and publishes a read-reason event.
    pub async fn read_value(&self, ctx: ChangeContext) -> Result<HapValue, HapStatus> {
        let handler = self
            .read_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(handler) = handler else {
            return Ok(self.value());
        };

        let fresh = handler.read().await?;
        let old = self.value();
        if fresh != old {
            self.store_and_emit(fresh.clone(), ChangeReason::Read, ctx);
        }
        Ok(fresh)
    }

    /// Serve a write: validate format and constraints, invoke the write
    /// handler when present, store the value, and publish a write-reason
    /// event. A handler echo replaces the written value as the stored one
    /// and is returned for write-response requests.
    pub async fn write_value(
        &self,
        value: HapValue,
        ctx: ChangeContext,
    ) -> Result<Option<HapValue>, HapStatus> {
        if !value.matches_format(self.format) {
            debug!(
                characteristic = %self.hap_type,
                "rejecting write with mismatched format"
            );
            return Err(HapStatus::InvalidValue);
        }
        if !self.constraints.validate(&value) {
            debug!(
                characteristic = %self.hap_type,
                "rejecting write outside constraints"
            );
            return Err(HapStatus::InvalidValue);
        }

        let handler = self
            .write_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let echo = match handler {
            Some(handler) => handler.write(value.clone(), ctx.originator).await?,
            None => None,
        };

        let stored = echo.clone().unwrap_or(value);
        self.store_and_emit(stored, ChangeReason::Write, ctx);
        Ok(echo)
    }

    /// Accessory-side value update (does not invoke the write handler).
    pub fn update_value(&self, value: HapValue) {
        self.store_and_emit(value, ChangeReason::Write, ChangeContext::internal());
    }

    /// Explicitly push an event with this value, bypassing the
    /// changed-value filter downstream.
    pub fn send_event(&self, value: HapValue) {
        self.store_and_emit(value, ChangeReason::Explicit, ChangeContext::internal());
    }

    /// Run the additional-authorization challenge. Absent handler admits
    /// the write; a handler panic denies it.
    pub fn verify_authorization(&self, auth_data: Option<&[u8]>) -> bool {
        let handler = self
            .auth_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                catch_unwind(AssertUnwindSafe(|| handler.authorize(auth_data))).unwrap_or(false)
            }
            None => true,
        }
    }

    fn store_and_emit(&self, new_value: HapValue, reason: ChangeReason, ctx: ChangeContext) {
        let old_value = {
            let mut value = self.value.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *value, new_value.clone())
        };

        let publisher = self
            .publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(publisher) = publisher {
            let (aid, iid) = self.ids();
            publisher.publish(CharacteristicEvent {
                aid,
                iid,
                characteristic_type: self.hap_type,
                reason,
                old_value,
                new_value,
                originator: ctx.originator,
                suppress_notification: ctx.suppress_notification,
            });
        }
    }
}
