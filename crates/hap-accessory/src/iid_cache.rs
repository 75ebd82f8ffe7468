//! Stable numeric identifier assignment.
//!
//! Controllers cache accessory and instance ids, so an id assigned to a
//! given (owner, entity UUID, subtype) must never change while the
//! underlying UUIDs are unchanged. The cache allocates on first resolve,
//! persists the full map, and only drops entries through the usage-tracking
//! bracket run around a complete assignment pass.

use crate::storage::Storage;
use hap_core::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Accessory ids for bridged accessories start here; 1 is the bridge itself.
const FIRST_BRIDGED_AID: u64 = 2;

/// Instance ids start here; 1 is reserved for the information service.
const FIRST_IID: u64 = 2;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    aids: HashMap<String, u64>,
    iids: HashMap<String, u64>,
    next_aid: u64,
    next_iid: HashMap<String, u64>,
}

/// Persisted identifier cache for one accessory root.
#[derive(Debug)]
pub struct IdentifierCache {
    root_id: String,
    state: CacheState,
    tracked: Option<HashSet<String>>,
}

impl IdentifierCache {
    /// Create an empty cache for an accessory root.
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            state: CacheState {
                next_aid: FIRST_BRIDGED_AID,
                ..CacheState::default()
            },
            tracked: None,
        }
    }

    fn storage_key(root_id: &str) -> String {
        format!("identifier-cache/{}", root_id)
    }

    /// Load the persisted cache, starting fresh when nothing is stored.
    pub async fn load(storage: &dyn Storage, root_id: &str) -> Result<Self, StorageError> {
        let key = Self::storage_key(root_id);
        match storage.get(&key).await? {
            Some(blob) => {
                let state: CacheState =
                    serde_json::from_slice(&blob).map_err(|err| StorageError::Corrupt {
                        key,
                        reason: err.to_string(),
                    })?;
                Ok(Self {
                    root_id: root_id.to_string(),
                    state,
                    tracked: None,
                })
            }
            None => Ok(Self::new(root_id)),
        }
    }

    /// Persist the full cache state.
    pub async fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let blob = serde_json::to_vec(&self.state).map_err(|err| StorageError::Corrupt {
            key: Self::storage_key(&self.root_id),
            reason: err.to_string(),
        })?;
        storage.set(&Self::storage_key(&self.root_id), blob).await
    }

    /// Remove the persisted state (factory reset).
    pub async fn purge(storage: &dyn Storage, root_id: &str) -> Result<(), StorageError> {
        storage.remove(&Self::storage_key(root_id)).await
    }

    /// Resolve the accessory id for a bridged accessory. Allocates on first
    /// use; always succeeds.
    pub fn resolve_aid(&mut self, accessory: &Uuid) -> u64 {
        let key = format!("aid|{}", accessory);
        self.mark_used(&key);
        if let Some(aid) = self.state.aids.get(&key) {
            return *aid;
        }
        let aid = self.state.next_aid.max(FIRST_BRIDGED_AID);
        self.state.next_aid = aid + 1;
        self.state.aids.insert(key, aid);
        aid
    }

    /// Resolve the instance id for an entity within an accessory.
    ///
    /// `owner_key` disambiguates the entity's owner within the accessory
    /// (empty for services, the owning service identity for
    /// characteristics). Allocation is from a per-accessory counter so ids
    /// stay unique across that accessory's services.
    pub fn resolve_iid(
        &mut self,
        accessory: &Uuid,
        owner_key: &str,
        entity: &Uuid,
        subtype: Option<&str>,
    ) -> u64 {
        let key = format!(
            "iid|{}|{}|{}|{}",
            accessory,
            owner_key,
            entity,
            subtype.unwrap_or("")
        );
        self.mark_used(&key);
        if let Some(iid) = self.state.iids.get(&key) {
            return *iid;
        }
        let counter = self
            .state
            .next_iid
            .entry(accessory.to_string())
            .or_insert(FIRST_IID);
        let iid = *counter;
        *counter += 1;
        self.state.iids.insert(key, iid);
        iid
    }

    /// Begin one usage-tracking bracket around a full assignment pass.
    pub fn begin_usage_tracking(&mut self) {
        self.tracked = Some(HashSet::new());
    }

    /// End the bracket: every entry not resolved since
    /// `begin_usage_tracking` is deleted. Allocation counters are kept so
    /// expired ids are never reissued to different entities.
    pub fn expire_unused(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            self.state.aids.retain(|key, _| tracked.contains(key));
            self.state.iids.retain(|key, _| tracked.contains(key));
        }
    }

    fn mark_used(&mut self, key: &str) {
        if let Some(tracked) = &mut self.tracked {
            tracked.insert(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    mod resolution {
        use super::*;

        #[test]
        fn aid_is_stable_across_resolves() {
            let mut cache = IdentifierCache::new("root");
            let a = cache.resolve_aid(&uuid(1));
            let b = cache.resolve_aid(&uuid(2));
            assert_eq!(a, 2);
            assert_eq!(b, 3);
            assert_eq!(cache.resolve_aid(&uuid(1)), a);
            assert_eq!(cache.resolve_aid(&uuid(2)), b);
        }

        #[test]
        fn iid_allocation_starts_after_information_service() {
            let mut cache = IdentifierCache::new("root");
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(10), None), 2);
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(11), None), 3);
        }

        #[test]
        fn iid_counters_are_per_accessory() {
            let mut cache = IdentifierCache::new("root");
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(10), None), 2);
            assert_eq!(cache.resolve_iid(&uuid(2), "", &uuid(10), None), 2);
        }

        #[test]
        fn subtype_and_owner_disambiguate() {
            let mut cache = IdentifierCache::new("root");
            let plain = cache.resolve_iid(&uuid(1), "", &uuid(10), None);
            let subtyped = cache.resolve_iid(&uuid(1), "", &uuid(10), Some("zone2"));
            let owned = cache.resolve_iid(&uuid(1), "svc-a", &uuid(10), None);
            assert_ne!(plain, subtyped);
            assert_ne!(plain, owned);
            assert_ne!(subtyped, owned);
        }
    }

    mod usage_tracking {
        use super::*;

        #[test]
        fn untouched_entries_expire() {
            let mut cache = IdentifierCache::new("root");
            let kept = cache.resolve_iid(&uuid(1), "", &uuid(10), None);
            cache.resolve_iid(&uuid(1), "", &uuid(11), None);

            cache.begin_usage_tracking();
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(10), None), kept);
            cache.expire_unused();

            // The expired entity gets a fresh id, never its old one back
            let reassigned = cache.resolve_iid(&uuid(1), "", &uuid(11), None);
            assert_ne!(reassigned, 3);
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(10), None), kept);
        }

        #[test]
        fn expired_ids_are_not_reissued() {
            let mut cache = IdentifierCache::new("root");
            cache.resolve_iid(&uuid(1), "", &uuid(10), None);
            let old = cache.resolve_iid(&uuid(1), "", &uuid(11), None);

            cache.begin_usage_tracking();
            cache.resolve_iid(&uuid(1), "", &uuid(10), None);
            cache.expire_unused();

            // A brand-new entity must not receive the expired id
            let fresh = cache.resolve_iid(&uuid(1), "", &uuid(12), None);
            assert_ne!(fresh, old);
        }

        #[test]
        fn expire_without_bracket_is_noop() {
            let mut cache = IdentifierCache::new("root");
            let iid = cache.resolve_iid(&uuid(1), "", &uuid(10), None);
            cache.expire_unused();
            assert_eq!(cache.resolve_iid(&uuid(1), "", &uuid(10), None), iid);
        }
    }

    mod persistence {
        use super::*;

        #[tokio::test]
        async fn save_and_load_preserve_assignments() {
            let storage = MemoryStorage::new();
            let mut cache = IdentifierCache::new("root");
            let aid = cache.resolve_aid(&uuid(1));
            let iid = cache.resolve_iid(&uuid(1), "", &uuid(10), Some("s"));
            cache.save(&storage).await.unwrap();

            let mut restored = IdentifierCache::load(&storage, "root").await.unwrap();
            assert_eq!(restored.resolve_aid(&uuid(1)), aid);
            assert_eq!(restored.resolve_iid(&uuid(1), "", &uuid(10), Some("s")), iid);
        }

        #[tokio::test]
        async fn load_missing_starts_fresh() {
            let storage = MemoryStorage::new();
            let mut cache = IdentifierCache::load(&storage, "root").await.unwrap();
            assert_eq!(cache.resolve_aid(&uuid(1)), 2);
        }

        #[tokio::test]
        async fn load_corrupt_reports_error() {
            let storage = MemoryStorage::new();
            storage
                .set("identifier-cache/root", b"not json".to_vec())
                .await
                .unwrap();
            let result = IdentifierCache::load(&storage, "root").await;
            assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        }

        #[tokio::test]
        async fn purge_removes_persisted_state() {
            let storage = MemoryStorage::new();
            let mut cache = IdentifierCache::new("root");
            cache.resolve_aid(&uuid(1));
            cache.save(&storage).await.unwrap();

            IdentifierCache::purge(&storage, "root").await.unwrap();
            assert_eq!(storage.get("identifier-cache/root").await.unwrap(), None);
        }
    }
}
