//! Bulk characteristic read/write dispatch.
//!
//! Every batch fans out into independently-suspended handler invocations
//! joined by a completion/timeout race: the response goes out the moment
//! every item has a result, outstanding items are flagged as slow at
//! [`SLOW_RESPONSE_THRESHOLD`], and at [`RESPONSE_DEADLINE`] whatever is
//! still outstanding is forcibly resolved to operation-timed-out. Per-item
//! failures never abort a batch; only duplicate requested addresses reject
//! a batch outright, before any handler runs.

use crate::subscriptions::SubscriptionRegistry;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{FuturesUnordered, StreamExt};
use hap_accessory::{
    ChangeContext, Characteristic, CharacteristicIndex, ConnectionContext, ConnectionId,
    PairingStore,
};
use hap_core::{HapStatus, HapValue, Operation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

/// Outstanding items are reported as slow after this long. Protocol
/// compatibility constant.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_millis(3000);

/// Outstanding items are forcibly timed out and the response sent after
/// this long. Protocol compatibility constant.
pub const RESPONSE_DEADLINE: Duration = Duration::from_millis(9000);

/// One requested address in a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReadItem {
    pub aid: u64,
    pub iid: u64,
}

/// Optional response decorations requested alongside a bulk read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// Include value metadata (format, unit, constraints).
    pub meta: bool,
    /// Include the permission strings.
    pub perms: bool,
    /// Include the characteristic type.
    pub hap_type: bool,
    /// Include this connection's event-subscription state.
    pub ev: bool,
}

/// One item of a bulk read response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadResult {
    pub aid: u64,
    pub iid: u64,
    pub status: HapStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<HapValue>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub hap_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perms: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(rename = "minStep", skip_serializing_if = "Option::is_none")]
    pub min_step: Option<f64>,
    #[serde(rename = "maxLen", skip_serializing_if = "Option::is_none")]
    pub max_len: Option<u32>,
}

impl ReadResult {
    fn status_only(key: (u64, u64), status: HapStatus) -> Self {
        Self {
            aid: key.0,
            iid: key.1,
            status,
            value: None,
            hap_type: None,
            perms: None,
            ev: None,
            format: None,
            unit: None,
            min_value: None,
            max_value: None,
            min_step: None,
            max_len: None,
        }
    }

    fn success(
        key: (u64, u64),
        value: HapValue,
        characteristic: &Characteristic,
        flags: ReadFlags,
        ev: Option<bool>,
    ) -> Self {
        let constraints = characteristic.constraints();
        Self {
            aid: key.0,
            iid: key.1,
            status: HapStatus::Success,
            value: Some(value),
            hap_type: flags.hap_type.then(|| characteristic.hap_type().to_wire()),
            perms: flags.perms.then(|| characteristic.perms().to_wire()),
            ev,
            format: flags.meta.then(|| characteristic.format().to_wire()),
            unit: flags
                .meta
                .then(|| characteristic.unit().map(|u| u.to_wire()))
                .flatten(),
            min_value: flags.meta.then_some(constraints.min).flatten(),
            max_value: flags.meta.then_some(constraints.max).flatten(),
            min_step: flags.meta.then_some(constraints.step).flatten(),
            max_len: flags.meta.then_some(constraints.max_len).flatten(),
        }
    }
}

/// One item of a bulk write.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteItem {
    pub aid: u64,
    pub iid: u64,
    /// Value to write, absent for subscription-only items.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Event-subscription toggle, handled independently of the value.
    #[serde(default)]
    pub ev: Option<bool>,
    /// Base64 additional-authorization data.
    #[serde(default, rename = "authData")]
    pub auth_data: Option<String>,
    /// Request the handler's echo value in the response.
    #[serde(default, rename = "r")]
    pub write_response: bool,
}

/// A bulk write batch with its optional timed-write transaction token.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub characteristics: Vec<WriteItem>,
    #[serde(default)]
    pub pid: Option<u64>,
}

/// One item of a bulk write response.
#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub aid: u64,
    pub iid: u64,
    pub status: HapStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<HapValue>,
}

impl WriteResult {
    fn status_only(key: (u64, u64), status: HapStatus) -> Self {
        Self {
            aid: key.0,
            iid: key.1,
            status,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PreparedWrite {
    pid: u64,
    expires_at: Instant,
}

/// Bulk read/write dispatcher for one accessory root.
pub struct Dispatcher {
    index: Arc<RwLock<CharacteristicIndex>>,
    pairings: Arc<RwLock<PairingStore>>,
    subscriptions: Arc<SubscriptionRegistry>,
    prepared: Mutex<HashMap<ConnectionId, PreparedWrite>>,
}

impl Dispatcher {
    pub fn new(
        index: Arc<RwLock<CharacteristicIndex>>,
        pairings: Arc<RwLock<PairingStore>>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            index,
            pairings,
            subscriptions,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a timed-write transaction token for a connection. A new token
    /// replaces any previous one.
    pub fn prepare_timed_write(&self, connection: ConnectionId, pid: u64, ttl: Duration) {
        debug!(%connection, pid, ?ttl, "prepared timed write");
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        prepared.insert(
            connection,
            PreparedWrite {
                pid,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop any prepared timed-write token for a closing connection.
    pub fn connection_closed(&self, connection: ConnectionId) {
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        prepared.remove(&connection);
    }

    /// Consume the connection's prepared token if it matches and is not
    /// expired.
    fn take_timed_write_authorization(&self, connection: ConnectionId, pid: Option<u64>) -> bool {
        let Some(pid) = pid else { return false };
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        match prepared.get(&connection) {
            Some(entry) if entry.pid == pid && entry.expires_at > Instant::now() => {
                prepared.remove(&connection);
                true
            }
            Some(entry) if entry.expires_at <= Instant::now() => {
                prepared.remove(&connection);
                false
            }
            _ => false,
        }
    }

    /// Serve a bulk read.
    ///
    /// Rejects the whole batch with invalid-value on duplicate addresses;
    /// otherwise every requested address appears exactly once in the
    /// response, in completion order.
    pub async fn read(
        &self,
        ctx: &ConnectionContext,
        items: &[ReadItem],
        flags: ReadFlags,
    ) -> Result<Vec<ReadResult>, HapStatus> {
        if has_duplicate_addresses(items.iter().map(|i| (i.aid, i.iid))) {
            warn!(%ctx.id, "rejecting read batch with duplicate addresses");
            return Err(HapStatus::InvalidValue);
        }

        let (mut results, tasks) = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let pairings = self.pairings.read().unwrap_or_else(PoisonError::into_inner);

            let mut results = Vec::with_capacity(items.len());
            let mut tasks: Vec<((u64, u64), JoinHandle<ReadResult>)> = Vec::new();

            for item in items {
                let key = (item.aid, item.iid);
                let Some(characteristic) = index.get(&key) else {
                    results.push(ReadResult::status_only(key, HapStatus::UnknownResource));
                    continue;
                };
                if !characteristic.perms().readable() {
                    results.push(ReadResult::status_only(key, HapStatus::WriteOnly));
                    continue;
                }
                let decision =
                    pairings.check_operation(characteristic.admin_gates(), Operation::Read, ctx);
                if !decision.is_allowed() {
                    results.push(ReadResult::status_only(
                        key,
                        HapStatus::InsufficientPrivileges,
                    ));
                    continue;
                }

                let characteristic = Arc::clone(characteristic);
                let ev = flags
                    .ev
                    .then(|| self.subscriptions.is_subscribed(ctx.id, key));
                let read_ctx = ChangeContext::from_connection(ctx.id);
                tasks.push((
                    key,
                    tokio::spawn(async move {
                        match characteristic.read_value(read_ctx).await {
                            Ok(value) => {
                                ReadResult::success(key, value, &characteristic, flags, ev)
                            }
                            Err(status) => ReadResult::status_only(key, status),
                        }
                    }),
                ));
            }
            (results, tasks)
        };

        results.extend(drive_batch(tasks, ReadResult::status_only).await);
        Ok(results)
    }

    /// Serve a bulk write.
    ///
    /// Value writes and subscription toggles in one item are handled
    /// independently; timed-write-flagged characteristics require the
    /// batch's transaction token to match an unexpired prepared one.
    pub async fn write(
        &self,
        ctx: &ConnectionContext,
        request: &WriteRequest,
    ) -> Result<Vec<WriteResult>, HapStatus> {
        if has_duplicate_addresses(request.characteristics.iter().map(|i| (i.aid, i.iid))) {
            warn!(%ctx.id, "rejecting write batch with duplicate addresses");
            return Err(HapStatus::InvalidValue);
        }

        let timed_write_authorized = self.take_timed_write_authorization(ctx.id, request.pid);

        let (mut results, tasks) = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let pairings = self.pairings.read().unwrap_or_else(PoisonError::into_inner);

            let mut results = Vec::with_capacity(request.characteristics.len());
            let mut tasks: Vec<((u64, u64), JoinHandle<WriteResult>)> = Vec::new();

            for item in &request.characteristics {
                let key = (item.aid, item.iid);
                let Some(characteristic) = index.get(&key) else {
                    results.push(WriteResult::status_only(key, HapStatus::UnknownResource));
                    continue;
                };

                // Subscription toggle: independent of the value write
                let ev_status = item.ev.map(|enable| {
                    self.toggle_subscription(ctx, characteristic, key, enable, &pairings)
                });

                let Some(raw_value) = &item.value else {
                    let status = ev_status.unwrap_or(HapStatus::Success);
                    results.push(WriteResult::status_only(key, status));
                    continue;
                };

                match self.check_write_gates(
                    ctx,
                    characteristic,
                    item,
                    timed_write_authorized,
                    &pairings,
                ) {
                    Ok(()) => {}
                    Err(status) => {
                        results.push(WriteResult::status_only(key, status));
                        continue;
                    }
                }

                let Some(value) = HapValue::from_json(raw_value, characteristic.format()) else {
                    results.push(WriteResult::status_only(key, HapStatus::InvalidValue));
                    continue;
                };

                let characteristic = Arc::clone(characteristic);
                let write_ctx = ChangeContext::from_connection(ctx.id);
                let wants_echo =
                    item.write_response && characteristic.perms().supports_write_response();
                tasks.push((
                    key,
                    tokio::spawn(async move {
                        match characteristic.write_value(value, write_ctx).await {
                            Ok(echo) => WriteResult {
                                aid: key.0,
                                iid: key.1,
                                status: ev_status.unwrap_or(HapStatus::Success),
                                value: if wants_echo { echo } else { None },
                            },
                            Err(status) => WriteResult::status_only(key, status),
                        }
                    }),
                ));
            }
            (results, tasks)
        };

        results.extend(drive_batch(tasks, WriteResult::status_only).await);
        Ok(results)
    }

    fn toggle_subscription(
        &self,
        ctx: &ConnectionContext,
        characteristic: &Characteristic,
        key: (u64, u64),
        enable: bool,
        pairings: &PairingStore,
    ) -> HapStatus {
        if !characteristic.perms().notifiable() {
            return HapStatus::NotificationUnsupported;
        }
        let decision = pairings.check_operation(characteristic.admin_gates(), Operation::Notify, ctx);
        if !decision.is_allowed() {
            return HapStatus::InsufficientPrivileges;
        }
        // Only an actual state change does anything
        if enable {
            self.subscriptions.subscribe(ctx.id, key);
        } else {
            self.subscriptions.unsubscribe(ctx.id, key);
        }
        HapStatus::Success
    }

    fn check_write_gates(
        &self,
        ctx: &ConnectionContext,
        characteristic: &Characteristic,
        item: &WriteItem,
        timed_write_authorized: bool,
        pairings: &PairingStore,
    ) -> Result<(), HapStatus> {
        if !characteristic.perms().writable() {
            return Err(HapStatus::ReadOnly);
        }
        let decision = pairings.check_operation(characteristic.admin_gates(), Operation::Write, ctx);
        if !decision.is_allowed() {
            return Err(HapStatus::InsufficientPrivileges);
        }
        if characteristic.perms().requires_timed_write() && !timed_write_authorized {
            return Err(HapStatus::InvalidValue);
        }
        if characteristic.perms().requires_additional_authorization() {
            let auth_data = match &item.auth_data {
                Some(encoded) => match STANDARD.decode(encoded) {
                    Ok(data) => Some(data),
                    Err(_) => return Err(HapStatus::InvalidValue),
                },
                None => None,
            };
            if !characteristic.verify_authorization(auth_data.as_deref()) {
                return Err(HapStatus::InsufficientAuthorization);
            }
        }
        Ok(())
    }
}

fn has_duplicate_addresses(keys: impl Iterator<Item = (u64, u64)>) -> bool {
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return true;
        }
    }
    false
}

/// Race the batch's handler tasks against the slow/timeout schedule.
///
/// Returns as soon as every task has produced a result. A task that panics
/// resolves its item to service-communication-failure; at the deadline,
/// still-outstanding tasks are aborted and resolved to operation-timed-out.
async fn drive_batch<T: Send + 'static>(
    tasks: Vec<((u64, u64), JoinHandle<T>)>,
    on_failure: fn((u64, u64), HapStatus) -> T,
) -> Vec<T> {
    let mut outstanding: HashSet<(u64, u64)> = tasks.iter().map(|(key, _)| *key).collect();
    let aborts: Vec<_> = tasks
        .iter()
        .map(|(key, handle)| (*key, handle.abort_handle()))
        .collect();
    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|(key, handle)| async move { (key, handle.await) })
        .collect();

    let mut results = Vec::new();
    let slow = time::sleep(SLOW_RESPONSE_THRESHOLD);
    tokio::pin!(slow);
    let deadline = time::sleep(RESPONSE_DEADLINE);
    tokio::pin!(deadline);
    let mut slow_logged = false;

    while !pending.is_empty() {
        tokio::select! {
            Some((key, joined)) = pending.next() => {
                outstanding.remove(&key);
                match joined {
                    Ok(item) => results.push(item),
                    Err(err) => {
                        error!(aid = key.0, iid = key.1, %err, "characteristic handler failed unexpectedly");
                        results.push(on_failure(key, HapStatus::ServiceCommunicationFailure));
                    }
                }
            }
            _ = &mut slow, if !slow_logged => {
                slow_logged = true;
                for key in &outstanding {
                    warn!(aid = key.0, iid = key.1, "characteristic operation is slow");
                }
            }
            _ = &mut deadline => {
                warn!(outstanding = outstanding.len(), "batch deadline reached, forcing timeouts");
                for (key, abort) in &aborts {
                    if outstanding.contains(key) {
                        abort.abort();
                    }
                }
                for key in outstanding.drain() {
                    results.push(on_failure(key, HapStatus::OperationTimedOut));
                }
                break;
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hap_accessory::{OnRead, OnWrite};
    use hap_core::hap_type::characteristic as char_type;
    use hap_core::{AdminGates, Format, Perms};
    use hap_accessory::{PairingEntry, Permission};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowRead {
        delay: Duration,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OnRead for SlowRead {
        async fn read(&self) -> Result<HapValue, HapStatus> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.delay == Duration::MAX {
                std::future::pending::<()>().await;
            } else {
                time::sleep(self.delay).await;
            }
            Ok(HapValue::Bool(true))
        }
    }

    struct PanickingRead;

    #[async_trait]
    impl OnRead for PanickingRead {
        async fn read(&self) -> Result<HapValue, HapStatus> {
            panic!("handler bug")
        }
    }

    struct CountingWrite {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OnWrite for CountingWrite {
        async fn write(
            &self,
            value: HapValue,
            _originator: Option<ConnectionId>,
        ) -> Result<Option<HapValue>, HapStatus> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(Some(value))
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        index: Arc<RwLock<CharacteristicIndex>>,
    }

    impl Fixture {
        fn new() -> Self {
            let index = Arc::new(RwLock::new(CharacteristicIndex::new()));
            let mut pairings = PairingStore::new("root");
            pairings.add(PairingEntry {
                identifier: "admin".to_string(),
                public_key: vec![1; 32],
                permission: Permission::Admin,
            });
            pairings.add(PairingEntry {
                identifier: "user".to_string(),
                public_key: vec![2; 32],
                permission: Permission::User,
            });
            let dispatcher = Dispatcher::new(
                Arc::clone(&index),
                Arc::new(RwLock::new(pairings)),
                Arc::new(SubscriptionRegistry::new()),
            );
            Self { dispatcher, index }
        }

        fn install(&self, aid: u64, iid: u64, characteristic: Characteristic) -> Arc<Characteristic> {
            characteristic.set_ids(aid, iid);
            let characteristic = Arc::new(characteristic);
            self.index
                .write()
                .unwrap()
                .insert((aid, iid), Arc::clone(&characteristic));
            characteristic
        }
    }

    fn on_char() -> Characteristic {
        Characteristic::new(char_type::ON, Format::Bool, Perms::read_write_notify())
    }

    fn user_ctx() -> ConnectionContext {
        ConnectionContext::authenticated(ConnectionId(1), "user")
    }

    fn admin_ctx() -> ConnectionContext {
        ConnectionContext::authenticated(ConnectionId(2), "admin")
    }

    fn keys_of_read(results: &[ReadResult]) -> HashSet<(u64, u64)> {
        results.iter().map(|r| (r.aid, r.iid)).collect()
    }

    mod reads {
        use super::*;

        #[tokio::test]
        async fn duplicate_addresses_reject_batch_without_invoking_handlers() {
            let fixture = Fixture::new();
            let invocations = Arc::new(AtomicUsize::new(0));
            let c = fixture.install(1, 9, on_char());
            c.on_read(Arc::new(SlowRead {
                delay: Duration::ZERO,
                invocations: Arc::clone(&invocations),
            }));

            let items = [ReadItem { aid: 1, iid: 9 }, ReadItem { aid: 1, iid: 9 }];
            let err = fixture
                .dispatcher
                .read(&user_ctx(), &items, ReadFlags::default())
                .await
                .unwrap_err();
            assert_eq!(err, HapStatus::InvalidValue);
            assert_eq!(invocations.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn response_covers_exactly_the_requested_addresses() {
            let fixture = Fixture::new();
            fixture.install(1, 9, on_char());

            let items = [ReadItem { aid: 1, iid: 9 }, ReadItem { aid: 1, iid: 99 }];
            let results = fixture
                .dispatcher
                .read(&user_ctx(), &items, ReadFlags::default())
                .await
                .unwrap();

            assert_eq!(keys_of_read(&results), HashSet::from([(1, 9), (1, 99)]));
            let missing = results.iter().find(|r| r.iid == 99).unwrap();
            assert_eq!(missing.status, HapStatus::UnknownResource);
            let found = results.iter().find(|r| r.iid == 9).unwrap();
            assert_eq!(found.status, HapStatus::Success);
            assert_eq!(found.value, Some(HapValue::Bool(false)));
        }

        #[tokio::test]
        async fn write_only_characteristic_reads_as_write_only() {
            let fixture = Fixture::new();
            fixture.install(
                1,
                2,
                Characteristic::new(char_type::IDENTIFY, Format::Bool, Perms::write_only()),
            );

            let results = fixture
                .dispatcher
                .read(&user_ctx(), &[ReadItem { aid: 1, iid: 2 }], ReadFlags::default())
                .await
                .unwrap();
            assert_eq!(results[0].status, HapStatus::WriteOnly);
        }

        #[tokio::test]
        async fn admin_gated_read_denied_for_user_and_unauthenticated() {
            let fixture = Fixture::new();
            fixture.install(
                1,
                9,
                on_char().with_admin_gates(AdminGates {
                    read: true,
                    ..AdminGates::none()
                }),
            );

            for ctx in [
                user_ctx(),
                ConnectionContext::unauthenticated(ConnectionId(3)),
            ] {
                let results = fixture
                    .dispatcher
                    .read(&ctx, &[ReadItem { aid: 1, iid: 9 }], ReadFlags::default())
                    .await
                    .unwrap();
                assert_eq!(results[0].status, HapStatus::InsufficientPrivileges);
            }

            let results = fixture
                .dispatcher
                .read(&admin_ctx(), &[ReadItem { aid: 1, iid: 9 }], ReadFlags::default())
                .await
                .unwrap();
            assert_eq!(results[0].status, HapStatus::Success);
        }

        #[tokio::test(start_paused = true)]
        async fn stuck_handler_times_out_while_sibling_keeps_its_result() {
            let fixture = Fixture::new();
            let invocations = Arc::new(AtomicUsize::new(0));

            let stuck = fixture.install(1, 9, on_char());
            stuck.on_read(Arc::new(SlowRead {
                delay: Duration::MAX,
                invocations: Arc::clone(&invocations),
            }));
            let _brightness = fixture.install(
                1,
                10,
                Characteristic::new(char_type::BRIGHTNESS, Format::UInt8, Perms::read_notify())
                    .with_initial_value(HapValue::UInt(40)),
            );

            let started = Instant::now();
            let items = [ReadItem { aid: 1, iid: 9 }, ReadItem { aid: 1, iid: 10 }];
            let results = fixture
                .dispatcher
                .read(&user_ctx(), &items, ReadFlags::default())
                .await
                .unwrap();

            assert_eq!(started.elapsed(), RESPONSE_DEADLINE);
            let timed_out = results.iter().find(|r| r.iid == 9).unwrap();
            assert_eq!(timed_out.status, HapStatus::OperationTimedOut);
            let fast = results.iter().find(|r| r.iid == 10).unwrap();
            assert_eq!(fast.status, HapStatus::Success);
            assert_eq!(fast.value, Some(HapValue::UInt(40)));
        }

        #[tokio::test(start_paused = true)]
        async fn fast_batch_returns_before_any_timer() {
            let fixture = Fixture::new();
            fixture.install(1, 9, on_char());

            let started = Instant::now();
            let results = fixture
                .dispatcher
                .read(&user_ctx(), &[ReadItem { aid: 1, iid: 9 }], ReadFlags::default())
                .await
                .unwrap();
            assert!(started.elapsed() < SLOW_RESPONSE_THRESHOLD);
            assert_eq!(results[0].status, HapStatus::Success);
        }

        #[tokio::test]
        async fn panicking_handler_becomes_service_communication_failure() {
            let fixture = Fixture::new();
            let c = fixture.install(1, 9, on_char());
            c.on_read(Arc::new(PanickingRead));

            let results = fixture
                .dispatcher
                .read(&user_ctx(), &[ReadItem { aid: 1, iid: 9 }], ReadFlags::default())
                .await
                .unwrap();
            assert_eq!(results[0].status, HapStatus::ServiceCommunicationFailure);
        }

        #[tokio::test]
        async fn flags_control_response_decorations() {
            let fixture = Fixture::new();
            fixture.install(
                1,
                9,
                Characteristic::new(char_type::BRIGHTNESS, Format::UInt8, Perms::read_write_notify())
                    .with_constraints(hap_core::Constraints::stepped(0.0, 100.0, 1.0)),
            );

            let flags = ReadFlags {
                meta: true,
                perms: true,
                hap_type: true,
                ev: true,
            };
            let results = fixture
                .dispatcher
                .read(&user_ctx(), &[ReadItem { aid: 1, iid: 9 }], flags)
                .await
                .unwrap();

            let r = &results[0];
            assert_eq!(r.format, Some("uint8"));
            assert_eq!(r.min_value, Some(0.0));
            assert_eq!(r.max_value, Some(100.0));
            assert_eq!(r.min_step, Some(1.0));
            assert_eq!(r.perms, Some(vec!["pr", "pw", "ev"]));
            assert_eq!(r.hap_type, Some("8".to_string()));
            assert_eq!(r.ev, Some(false));

            let bare = fixture
                .dispatcher
                .read(&user_ctx(), &[ReadItem { aid: 1, iid: 9 }], ReadFlags::default())
                .await
                .unwrap();
            assert_eq!(bare[0].format, None);
            assert_eq!(bare[0].perms, None);
            assert_eq!(bare[0].ev, None);
        }
    }

    mod writes {
        use super::*;

        fn write_item(aid: u64, iid: u64, value: serde_json::Value) -> WriteItem {
            WriteItem {
                aid,
                iid,
                value: Some(value),
                ev: None,
                auth_data: None,
                write_response: false,
            }
        }

        #[tokio::test]
        async fn write_stores_value() {
            let fixture = Fixture::new();
            let c = fixture.install(1, 9, on_char());

            let request = WriteRequest {
                characteristics: vec![write_item(1, 9, serde_json::json!(true))],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::Success);
            assert_eq!(c.value(), HapValue::Bool(true));
        }

        #[tokio::test]
        async fn read_only_characteristic_rejects_write() {
            let fixture = Fixture::new();
            let c = fixture.install(
                1,
                9,
                Characteristic::new(char_type::MOTION_DETECTED, Format::Bool, Perms::read_notify()),
            );

            let request = WriteRequest {
                characteristics: vec![write_item(1, 9, serde_json::json!(true))],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::ReadOnly);
            assert_eq!(c.value(), HapValue::Bool(false));
        }

        #[tokio::test]
        async fn admin_gated_write_by_user_is_denied_and_value_unchanged() {
            let fixture = Fixture::new();
            let c = fixture.install(
                1,
                9,
                on_char().with_admin_gates(AdminGates {
                    write: true,
                    ..AdminGates::none()
                }),
            );

            let request = WriteRequest {
                characteristics: vec![write_item(1, 9, serde_json::json!(true))],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::InsufficientPrivileges);
            assert_eq!(c.value(), HapValue::Bool(false));

            let results = fixture.dispatcher.write(&admin_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::Success);
            assert_eq!(c.value(), HapValue::Bool(true));
        }

        #[tokio::test]
        async fn mistyped_value_is_invalid_without_handler_invocation() {
            let fixture = Fixture::new();
            let invocations = Arc::new(AtomicUsize::new(0));
            let c = fixture.install(1, 9, on_char());
            c.on_write(Arc::new(CountingWrite {
                invocations: Arc::clone(&invocations),
            }));

            let request = WriteRequest {
                characteristics: vec![write_item(1, 9, serde_json::json!("not-a-bool"))],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::InvalidValue);
            assert_eq!(invocations.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn subscription_toggle_rides_alongside_value() {
            let fixture = Fixture::new();
            fixture.install(1, 9, on_char());

            let mut item = write_item(1, 9, serde_json::json!(true));
            item.ev = Some(true);
            let request = WriteRequest {
                characteristics: vec![item],
                pid: None,
            };
            let ctx = user_ctx();
            let results = fixture.dispatcher.write(&ctx, &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::Success);
            assert!(fixture.dispatcher.subscriptions.is_subscribed(ctx.id, (1, 9)));
        }

        #[tokio::test]
        async fn subscription_toggle_on_non_notifiable_characteristic() {
            let fixture = Fixture::new();
            fixture.install(
                1,
                9,
                Characteristic::new(
                    char_type::ON,
                    Format::Bool,
                    Perms::from_raw(Perms::PAIRED_READ | Perms::PAIRED_WRITE),
                ),
            );

            let request = WriteRequest {
                characteristics: vec![WriteItem {
                    aid: 1,
                    iid: 9,
                    value: None,
                    ev: Some(true),
                    auth_data: None,
                    write_response: false,
                }],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::NotificationUnsupported);
        }

        #[tokio::test]
        async fn write_response_echo_requires_request_and_permission() {
            let fixture = Fixture::new();
            let c = fixture.install(
                1,
                9,
                Characteristic::new(
                    char_type::ON,
                    Format::Bool,
                    Perms::from_raw(
                        Perms::PAIRED_READ
                            | Perms::PAIRED_WRITE
                            | Perms::EVENTS
                            | Perms::WRITE_RESPONSE,
                    ),
                ),
            );
            c.on_write(Arc::new(CountingWrite {
                invocations: Arc::new(AtomicUsize::new(0)),
            }));

            let mut item = write_item(1, 9, serde_json::json!(true));
            item.write_response = true;
            let request = WriteRequest {
                characteristics: vec![item],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].value, Some(HapValue::Bool(true)));

            // Without the request flag the echo stays out of the response
            let request = WriteRequest {
                characteristics: vec![write_item(1, 9, serde_json::json!(false))],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].value, None);
        }
    }

    mod timed_writes {
        use super::*;
        use self::writes_helpers::*;

        mod writes_helpers {
            use super::*;

            pub fn timed_char() -> Characteristic {
                Characteristic::new(
                    char_type::ON,
                    Format::Bool,
                    Perms::from_raw(
                        Perms::PAIRED_READ
                            | Perms::PAIRED_WRITE
                            | Perms::EVENTS
                            | Perms::TIMED_WRITE,
                    ),
                )
            }

            pub fn write_request(pid: Option<u64>) -> WriteRequest {
                WriteRequest {
                    characteristics: vec![
                        WriteItem {
                            aid: 1,
                            iid: 9,
                            value: Some(serde_json::json!(true)),
                            ev: None,
                            auth_data: None,
                            write_response: false,
                        },
                        WriteItem {
                            aid: 1,
                            iid: 10,
                            value: Some(serde_json::json!(true)),
                            ev: None,
                            auth_data: None,
                            write_response: false,
                        },
                    ],
                    pid,
                }
            }
        }

        #[tokio::test]
        async fn matching_token_authorizes_flagged_items() {
            let fixture = Fixture::new();
            fixture.install(1, 9, timed_char());
            fixture.install(1, 10, on_char());

            let ctx = user_ctx();
            fixture
                .dispatcher
                .prepare_timed_write(ctx.id, 77, Duration::from_secs(5));
            let results = fixture
                .dispatcher
                .write(&ctx, &write_request(Some(77)))
                .await
                .unwrap();
            assert!(results.iter().all(|r| r.status == HapStatus::Success));
        }

        #[tokio::test]
        async fn mismatched_token_fails_only_flagged_items() {
            let fixture = Fixture::new();
            let timed = fixture.install(1, 9, timed_char());
            let plain = fixture.install(1, 10, on_char());

            let ctx = user_ctx();
            fixture
                .dispatcher
                .prepare_timed_write(ctx.id, 77, Duration::from_secs(5));
            let results = fixture
                .dispatcher
                .write(&ctx, &write_request(Some(78)))
                .await
                .unwrap();

            let timed_result = results.iter().find(|r| r.iid == 9).unwrap();
            assert_eq!(timed_result.status, HapStatus::InvalidValue);
            assert_eq!(timed.value(), HapValue::Bool(false));

            let plain_result = results.iter().find(|r| r.iid == 10).unwrap();
            assert_eq!(plain_result.status, HapStatus::Success);
            assert_eq!(plain.value(), HapValue::Bool(true));
        }

        #[tokio::test]
        async fn absent_token_fails_flagged_items() {
            let fixture = Fixture::new();
            fixture.install(1, 9, timed_char());
            fixture.install(1, 10, on_char());

            let results = fixture
                .dispatcher
                .write(&user_ctx(), &write_request(None))
                .await
                .unwrap();
            let timed_result = results.iter().find(|r| r.iid == 9).unwrap();
            assert_eq!(timed_result.status, HapStatus::InvalidValue);
        }

        #[tokio::test(start_paused = true)]
        async fn expired_token_fails_flagged_items() {
            let fixture = Fixture::new();
            fixture.install(1, 9, timed_char());
            fixture.install(1, 10, on_char());

            let ctx = user_ctx();
            fixture
                .dispatcher
                .prepare_timed_write(ctx.id, 77, Duration::from_millis(100));
            time::sleep(Duration::from_millis(200)).await;

            let results = fixture
                .dispatcher
                .write(&ctx, &write_request(Some(77)))
                .await
                .unwrap();
            let timed_result = results.iter().find(|r| r.iid == 9).unwrap();
            assert_eq!(timed_result.status, HapStatus::InvalidValue);
        }
    }

    mod additional_authorization {
        use super::*;
        use hap_accessory::AuthChallenge;

        struct ExactToken(Vec<u8>);

        impl AuthChallenge for ExactToken {
            fn authorize(&self, auth_data: Option<&[u8]>) -> bool {
                auth_data == Some(self.0.as_slice())
            }
        }

        fn aa_char() -> Characteristic {
            Characteristic::new(
                char_type::ON,
                Format::Bool,
                Perms::from_raw(
                    Perms::PAIRED_READ
                        | Perms::PAIRED_WRITE
                        | Perms::EVENTS
                        | Perms::ADDITIONAL_AUTHORIZATION,
                ),
            )
        }

        #[tokio::test]
        async fn denied_challenge_is_insufficient_authorization() {
            let fixture = Fixture::new();
            let c = fixture.install(1, 9, aa_char());
            c.on_authorize(Arc::new(ExactToken(vec![1, 2, 3])));

            let request = WriteRequest {
                characteristics: vec![WriteItem {
                    aid: 1,
                    iid: 9,
                    value: Some(serde_json::json!(true)),
                    ev: None,
                    auth_data: Some(STANDARD.encode([9, 9])),
                    write_response: false,
                }],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::InsufficientAuthorization);
            assert_eq!(c.value(), HapValue::Bool(false));
        }

        #[tokio::test]
        async fn matching_challenge_admits_the_write() {
            let fixture = Fixture::new();
            let c = fixture.install(1, 9, aa_char());
            c.on_authorize(Arc::new(ExactToken(vec![1, 2, 3])));

            let request = WriteRequest {
                characteristics: vec![WriteItem {
                    aid: 1,
                    iid: 9,
                    value: Some(serde_json::json!(true)),
                    ev: None,
                    auth_data: Some(STANDARD.encode([1, 2, 3])),
                    write_response: false,
                }],
                pid: None,
            };
            let results = fixture.dispatcher.write(&user_ctx(), &request).await.unwrap();
            assert_eq!(results[0].status, HapStatus::Success);
            assert_eq!(c.value(), HapValue::Bool(true));
        }
    }
}
