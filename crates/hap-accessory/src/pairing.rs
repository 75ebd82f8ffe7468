//! Pairing records and the access-control checks applied to every
//! characteristic operation.

use crate::storage::Storage;
use hap_core::{AdminGates, Operation, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Opaque identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity a request arrives with: the connection plus, once the session
/// is verified, the paired controller behind it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Pairing identifier of the verified controller, None on
    /// unauthenticated connections.
    pub controller: Option<String>,
}

impl ConnectionContext {
    pub fn unauthenticated(id: ConnectionId) -> Self {
        Self {
            id,
            controller: None,
        }
    }

    pub fn authenticated(id: ConnectionId, controller: impl Into<String>) -> Self {
        Self {
            id,
            controller: Some(controller.into()),
        }
    }
}

/// Permission level of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    User,
    Admin,
}

/// One paired controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    pub identifier: String,
    pub public_key: Vec<u8>,
    pub permission: Permission,
}

/// Outcome of an access-control check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// The pairing behind the connection lacks admin permission.
    InsufficientPrivileges,
    /// The connection carries no verified identity, so an admin gate can
    /// never be satisfied. Denied.
    Unverifiable,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        self == AccessDecision::Allow
    }
}

/// Pairing records for one accessory root.
#[derive(Debug, Default)]
pub struct PairingStore {
    root_id: String,
    entries: Vec<PairingEntry>,
}

impl PairingStore {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            entries: Vec::new(),
        }
    }

    /// Storage key for an accessory root's pairing records.
    pub fn storage_key(root_id: &str) -> String {
        format!("pairings/{}", root_id)
    }

    /// Serialize the records for persistence without touching storage, so
    /// callers can write the blob outside any lock.
    pub fn to_blob(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(&self.entries).map_err(|err| StorageError::Corrupt {
            key: Self::storage_key(&self.root_id),
            reason: err.to_string(),
        })
    }

    /// Load persisted pairings, empty when nothing is stored.
    pub async fn load(storage: &dyn Storage, root_id: &str) -> Result<Self, StorageError> {
        let key = Self::storage_key(root_id);
        let entries = match storage.get(&key).await? {
            Some(blob) => serde_json::from_slice(&blob).map_err(|err| StorageError::Corrupt {
                key,
                reason: err.to_string(),
            })?,
            None => Vec::new(),
        };
        Ok(Self {
            root_id: root_id.to_string(),
            entries,
        })
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let blob = serde_json::to_vec(&self.entries).map_err(|err| StorageError::Corrupt {
            key: Self::storage_key(&self.root_id),
            reason: err.to_string(),
        })?;
        storage.set(&Self::storage_key(&self.root_id), blob).await
    }

    /// Add a pairing, replacing any existing record for the identifier.
    pub fn add(&mut self, entry: PairingEntry) {
        info!(controller = %entry.identifier, permission = ?entry.permission, "adding pairing");
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.identifier == entry.identifier)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Remove a pairing. When the last admin pairing goes, every remaining
    /// pairing is removed with it.
    pub fn remove(&mut self, identifier: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.identifier != identifier);
        let removed = self.entries.len() != before;

        if removed && !self.entries.iter().any(|e| e.permission == Permission::Admin) {
            info!(
                remaining = self.entries.len(),
                "last admin pairing removed, clearing all pairings"
            );
            self.entries.clear();
        }
        removed
    }

    /// Remove every pairing (factory reset).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, identifier: &str) -> Option<&PairingEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    pub fn list(&self) -> &[PairingEntry] {
        &self.entries
    }

    pub fn is_paired(&self) -> bool {
        !self.entries.is_empty()
    }

    fn is_admin(&self, identifier: &str) -> bool {
        self.get(identifier)
            .map(|e| e.permission == Permission::Admin)
            .unwrap_or(false)
    }

    /// Whether the connection's verified controller holds admin permission.
    pub fn has_admin_permission(&self, ctx: &ConnectionContext) -> bool {
        ctx.controller
            .as_deref()
            .map(|c| self.is_admin(c))
            .unwrap_or(false)
    }

    /// Check one operation against a characteristic's admin gates.
    pub fn check_operation(
        &self,
        gates: AdminGates,
        op: Operation,
        ctx: &ConnectionContext,
    ) -> AccessDecision {
        if !gates.gates(op) {
            return AccessDecision::Allow;
        }
        match ctx.controller.as_deref() {
            None => AccessDecision::Unverifiable,
            Some(controller) if self.is_admin(controller) => AccessDecision::Allow,
            Some(_) => AccessDecision::InsufficientPrivileges,
        }
    }
}
