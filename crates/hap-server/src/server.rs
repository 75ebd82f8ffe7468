//! Accessory server facade.
//!
//! Owns the capability tree, identifier cache, pairing store, dispatcher,
//! and notification pipeline for one accessory root, and keeps the external
//! advertiser told about the current configuration and pairing state.
//! Structural mutations on a published tree are coalesced through a
//! one-second debounce before the configuration version is bumped and
//! re-advertised.

use crate::dispatch::Dispatcher;
use crate::events::{EventSink, NotificationPipeline};
use crate::subscriptions::SubscriptionRegistry;
use async_trait::async_trait;
use hap_accessory::{
    Accessory, CharacteristicIndex, ConnectionId, EventPublisher, IdentifierCache, PairingEntry,
    PairingStore, Storage,
};
use hap_core::{Error, HapValue, Result, StorageError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

/// Structural changes are coalesced for this long before republishing.
pub const REPUBLISH_DEBOUNCE: Duration = Duration::from_secs(1);

/// What the external advertiser needs to know about this accessory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedState {
    pub name: String,
    pub category: u8,
    pub config_version: u32,
    pub paired: bool,
}

/// External service advertiser (mDNS etc.), told the current state after
/// every structural or pairing change.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait Advertiser: Send + Sync {
    async fn update(&self, state: AdvertisedState);
}

struct Inner {
    root_id: String,
    accessory: Mutex<Accessory>,
    storage: Arc<dyn Storage>,
    cache: Mutex<Option<IdentifierCache>>,
    pairings: Arc<RwLock<PairingStore>>,
    index: Arc<RwLock<CharacteristicIndex>>,
    subscriptions: Arc<SubscriptionRegistry>,
    advertiser: Arc<dyn Advertiser>,
    event_tx: mpsc::UnboundedSender<hap_accessory::CharacteristicEvent>,
    change_tx: mpsc::UnboundedSender<()>,
    config_version: AtomicU32,
    published: AtomicBool,
}

/// One accessory root wired into dispatch, notification, persistence, and
/// advertisement.
pub struct AccessoryServer {
    inner: Arc<Inner>,
    dispatcher: Dispatcher,
    pipeline_task: JoinHandle<()>,
    debounce_task: JoinHandle<()>,
}

impl AccessoryServer {
    /// Build the server around an accessory tree. Call [`publish`] to
    /// assign ids and go on the air.
    ///
    /// [`publish`]: AccessoryServer::publish
    pub async fn new(
        accessory: Accessory,
        storage: Arc<dyn Storage>,
        advertiser: Arc<dyn Advertiser>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let root_id = accessory.uuid().to_string();
        let pairings = Arc::new(RwLock::new(
            PairingStore::load(storage.as_ref(), &root_id).await?,
        ));
        let config_version = load_config_version(storage.as_ref(), &root_id).await?;
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let index = Arc::new(RwLock::new(CharacteristicIndex::new()));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pipeline_task =
            NotificationPipeline::new(Arc::clone(&subscriptions), sink).spawn(event_rx);

        let (change_tx, change_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            root_id,
            accessory: Mutex::new(accessory),
            storage,
            cache: Mutex::new(None),
            pairings: Arc::clone(&pairings),
            index: Arc::clone(&index),
            subscriptions: Arc::clone(&subscriptions),
            advertiser,
            event_tx,
            change_tx,
            config_version: AtomicU32::new(config_version),
            published: AtomicBool::new(false),
        });

        let debounce_task = tokio::spawn(run_debounce(Arc::clone(&inner), change_rx));
        let dispatcher = Dispatcher::new(index, pairings, subscriptions);

        Ok(Self {
            inner,
            dispatcher,
            pipeline_task,
            debounce_task,
        })
    }

    /// Assign ids, wire the tree into the event bus, and advertise.
    pub async fn publish(&self) -> Result<()> {
        let mut accessory = self.inner.accessory.lock().await;

        let mut cache =
            IdentifierCache::load(self.inner.storage.as_ref(), &self.inner.root_id).await?;
        accessory.assign_ids(&mut cache);
        verify_ids(&accessory)?;
        cache.save(self.inner.storage.as_ref()).await?;
        *self.inner.cache.lock().await = Some(cache);

        self.inner.wire_tree(&mut accessory);
        self.inner.published.store(true, Ordering::SeqCst);

        let state = self.inner.advertised_state(&accessory);
        drop(accessory);
        info!(
            name = %state.name,
            config_version = state.config_version,
            "publishing accessory"
        );
        self.inner.advertiser.update(state).await;
        Ok(())
    }

    pub fn is_published(&self) -> bool {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Current configuration version.
    pub fn config_version(&self) -> u32 {
        self.inner.config_version.load(Ordering::SeqCst)
    }

    /// The bulk read/write dispatcher for this root.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.subscriptions
    }

    /// Run a closure against the accessory tree under the single mutation
    /// context. Structural changes made here republish after the debounce.
    pub async fn with_accessory<R>(&self, f: impl FnOnce(&mut Accessory) -> R) -> R {
        let mut accessory = self.inner.accessory.lock().await;
        f(&mut accessory)
    }

    /// Add (or update) a pairing record and re-advertise.
    pub async fn add_pairing(&self, entry: PairingEntry) -> Result<()> {
        let blob = {
            let mut pairings = self
                .inner
                .pairings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            pairings.add(entry);
            pairings.to_blob()?
        };
        self.persist_pairings_and_advertise(blob).await
    }

    /// Remove a pairing record (cascading when the last admin goes) and
    /// re-advertise. Returns whether anything was removed.
    pub async fn remove_pairing(&self, identifier: &str) -> Result<bool> {
        let (removed, blob) = {
            let mut pairings = self
                .inner
                .pairings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let removed = pairings.remove(identifier);
            (removed, pairings.to_blob()?)
        };
        self.persist_pairings_and_advertise(blob).await?;
        Ok(removed)
    }

    pub fn pairings(&self) -> Vec<PairingEntry> {
        self.inner
            .pairings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
            .to_vec()
    }

    async fn persist_pairings_and_advertise(&self, blob: Vec<u8>) -> Result<()> {
        self.inner
            .storage
            .set(&PairingStore::storage_key(&self.inner.root_id), blob)
            .await?;
        let state = {
            let accessory = self.inner.accessory.lock().await;
            self.inner.advertised_state(&accessory)
        };
        self.inner.advertiser.update(state).await;
        Ok(())
    }

    /// A connection closed: drop its subscriptions and any prepared
    /// timed-write token. Camera stream teardown is the stream manager's
    /// half of this contract.
    pub fn connection_closed(&self, connection: ConnectionId) {
        self.inner.subscriptions.remove_connection(connection);
        self.dispatcher.connection_closed(connection);
    }

    /// Wipe pairings and identifier assignments, then re-advertise as
    /// unpaired.
    pub async fn factory_reset(&self) -> Result<()> {
        info!(root = %self.inner.root_id, "factory reset");
        {
            let mut pairings = self
                .inner
                .pairings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            pairings.clear();
        }
        self.inner
            .storage
            .remove(&PairingStore::storage_key(&self.inner.root_id))
            .await?;
        IdentifierCache::purge(self.inner.storage.as_ref(), &self.inner.root_id).await?;
        *self.inner.cache.lock().await = Some(IdentifierCache::new(self.inner.root_id.clone()));

        let state = {
            let accessory = self.inner.accessory.lock().await;
            self.inner.advertised_state(&accessory)
        };
        self.inner.advertiser.update(state).await;
        Ok(())
    }

    /// The full attribute database in wire shape.
    pub async fn accessory_database(&self) -> serde_json::Value {
        let accessory = self.inner.accessory.lock().await;
        let mut accessories = vec![db_accessory(&accessory)];
        for child in accessory.bridged_accessories() {
            accessories.push(db_accessory(child));
        }
        serde_json::json!({ "accessories": accessories })
    }

    /// Stop background tasks.
    pub async fn shutdown(self) {
        self.pipeline_task.abort();
        self.debounce_task.abort();
    }
}

impl Inner {
    /// Hook the tree into the event bus and change listener. Idempotent;
    /// rerun after every structural change so new entities are covered.
    fn wire_tree(&self, accessory: &mut Accessory) {
        accessory.set_change_listener(self.change_tx.clone());
        let publisher = EventPublisher::new(self.event_tx.clone());
        accessory.for_each_characteristic(&mut |c| c.set_publisher(publisher.clone()));
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = accessory.build_index();
    }

    fn advertised_state(&self, accessory: &Accessory) -> AdvertisedState {
        AdvertisedState {
            name: accessory.name().to_string(),
            category: accessory.category().as_u8(),
            config_version: self.config_version.load(Ordering::SeqCst),
            paired: self
                .pairings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_paired(),
        }
    }

    async fn republish(&self) -> Result<()> {
        if !self.published.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut accessory = self.accessory.lock().await;
        let mut cache_slot = self.cache.lock().await;
        let cache = cache_slot.as_mut().ok_or(Error::NotPublished)?;

        accessory.assign_ids(cache);
        verify_ids(&accessory)?;
        cache.save(self.storage.as_ref()).await?;
        self.wire_tree(&mut accessory);

        let version = self.config_version.fetch_add(1, Ordering::SeqCst) + 1;
        save_config_version(self.storage.as_ref(), &self.root_id, version).await?;

        let state = self.advertised_state(&accessory);
        drop(cache_slot);
        drop(accessory);
        info!(config_version = version, "republishing after structural change");
        self.advertiser.update(state).await;
        Ok(())
    }
}

async fn run_debounce(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        time::sleep(REPUBLISH_DEBOUNCE).await;
        // Coalesce the burst that accumulated while waiting
        while rx.try_recv().is_ok() {}
        if let Err(err) = inner.republish().await {
            error!(%err, "deferred republish failed");
        }
    }
}

/// Serving a tree with unassigned ids is a configuration bug: refuse,
/// don't crash.
fn verify_ids(accessory: &Accessory) -> Result<()> {
    let mut ok = true;
    accessory.for_each_characteristic(&mut |c| {
        if !c.ids_assigned() {
            ok = false;
        }
    });
    if ok && accessory.ids_assigned() {
        Ok(())
    } else {
        Err(Error::IdsUnassigned {
            aid: accessory.aid(),
        })
    }
}

fn config_version_key(root_id: &str) -> String {
    format!("config-version/{}", root_id)
}

async fn load_config_version(storage: &dyn Storage, root_id: &str) -> Result<u32> {
    let key = config_version_key(root_id);
    match storage.get(&key).await? {
        Some(blob) => {
            let version = serde_json::from_slice(&blob).map_err(|err| StorageError::Corrupt {
                key,
                reason: err.to_string(),
            })?;
            Ok(version)
        }
        None => Ok(1),
    }
}

async fn save_config_version(storage: &dyn Storage, root_id: &str, version: u32) -> Result<()> {
    let blob = serde_json::to_vec(&version).map_err(|err| StorageError::Corrupt {
        key: config_version_key(root_id),
        reason: err.to_string(),
    })?;
    storage.set(&config_version_key(root_id), blob).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct DbCharacteristic {
    iid: u64,
    #[serde(rename = "type")]
    hap_type: String,
    perms: Vec<&'static str>,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<HapValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'static str>,
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none")]
    min_value: Option<f64>,
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none")]
    max_value: Option<f64>,
    #[serde(rename = "minStep", skip_serializing_if = "Option::is_none")]
    min_step: Option<f64>,
    #[serde(rename = "maxLen", skip_serializing_if = "Option::is_none")]
    max_len: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DbService {
    iid: u64,
    #[serde(rename = "type")]
    hap_type: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    primary: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    hidden: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    linked: Vec<u64>,
    characteristics: Vec<DbCharacteristic>,
}

fn db_accessory(accessory: &Accessory) -> serde_json::Value {
    let services = accessory
        .services()
        .iter()
        .map(|service| DbService {
            iid: service.iid(),
            hap_type: service.hap_type().to_wire(),
            primary: service.is_primary(),
            hidden: service.is_hidden(),
            linked: accessory.linked_iids(service),
            characteristics: service
                .characteristics()
                .iter()
                .map(|c| {
                    let constraints = c.constraints();
                    DbCharacteristic {
                        iid: c.ids().1,
                        hap_type: c.hap_type().to_wire(),
                        perms: c.perms().to_wire(),
                        format: c.format().to_wire(),
                        value: c.perms().readable().then(|| c.value()),
                        unit: c.unit().map(|u| u.to_wire()),
                        min_value: constraints.min,
                        max_value: constraints.max,
                        min_step: constraints.step,
                        max_len: constraints.max_len,
                    }
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    serde_json::json!({ "aid": accessory.aid(), "services": services })
}
